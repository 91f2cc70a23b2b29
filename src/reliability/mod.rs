//! Message layer reliability (RFC 7252 §4): retransmission of our Confirmable messages and
//! acknowledgement plus deduplication of the peer's.

use crate::message::MessageId;

pub mod inbound;
pub mod outbound;

pub use outbound::{ExchangeEvent, ExchangeEventKind, SendFailed};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey<Endpoint> {
    pub peer: Endpoint,
    pub message_id: MessageId,
}

impl<Endpoint> MessageKey<Endpoint> {
    pub fn new(peer: Endpoint, message_id: MessageId) -> Self {
        Self { peer, message_id }
    }
}
