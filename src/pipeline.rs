//! Ordered protocol stages between the codec and the application.
//!
//! Inbound messages visit the stages in order, outbound messages visit them in reverse.  A
//! stage inspects or rewrites the message in place and tells the engine whether to keep
//! going.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use log::{error, trace};
use tokio::sync::mpsc::UnboundedSender;

use crate::message::{CoapMessage, Token};
use crate::reliability::outbound::SendFailed;

/// Bounds every peer address type must satisfy to key the engine's tables.
pub trait EndpointAddr: Debug + Clone + Eq + Hash + Send + Sync + 'static {}

impl<T: Debug + Clone + Eq + Hash + Send + Sync + 'static> EndpointAddr for T {}

/// Token level conversation with one peer: a blockwise transfer, an observation or a
/// pending client request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey<Endpoint> {
    pub peer: Endpoint,
    pub token: Token,
}

impl<Endpoint> ConversationKey<Endpoint> {
    pub fn new(peer: Endpoint, token: Token) -> Self {
        Self { peer, token }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Hand the (possibly rewritten) message to the next stage.
    Forward,
    /// The stage fully handled the message.
    Consume,
    /// Answer the peer with this message and stop.  The reply travels through the outbound
    /// side of the stages below the one that produced it.
    Reply(CoapMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    Forward,
    Consume,
}

#[async_trait]
pub trait Stage<Endpoint: EndpointAddr>: Send + Sync {
    async fn handle_inbound(&self, _message: &mut CoapMessage, _peer: &Endpoint) -> Inbound {
        Inbound::Forward
    }

    /// `request` is the inbound request this message answers, when there is one.
    async fn handle_outbound(
        &self,
        _message: &mut CoapMessage,
        _peer: &Endpoint,
        _request: Option<&CoapMessage>,
    ) -> Result<Outbound, SendFailed> {
        Ok(Outbound::Forward)
    }
}

/// Final hop before the codec: every message put here is written to the transport as is.
#[derive(Debug)]
pub struct Outbox<Endpoint> {
    tx: UnboundedSender<(CoapMessage, Endpoint)>,
}

impl<Endpoint> Clone for Outbox<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Endpoint: Debug> Outbox<Endpoint> {
    pub fn new(tx: UnboundedSender<(CoapMessage, Endpoint)>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: CoapMessage, peer: Endpoint) -> Result<(), SendFailed> {
        trace!("Outgoing to {peer:?}: {message}");
        self.tx.send((message, peer)).map_err(|e| {
            error!("Outbox closed, dropping message to {:?}", e.0 .1);
            SendFailed::Transmission(anyhow::Error::msg("outbox closed"))
        })
    }

    /// Like [`Outbox::send`] for fire-and-forget control messages such as empty ACKs,
    /// where the failure is already logged and there is nobody to report it to.
    pub fn send_control(&self, message: CoapMessage, peer: Endpoint) {
        let _ = self.send(message, peer);
    }
}
