use async_trait::async_trait;

use crate::codec::MessageError;
use crate::message::CoapMessage;
use crate::pipeline::Outbox;

/// "Low-level" datagram handler: told about every decoded datagram (or the reason it could
/// not be decoded) and free to send any number of messages through the [`Outbox`] it was
/// built with, at any time.
///
/// Most customers should not implement this themselves.  Prefer [`crate::app::Router`] or
/// [`crate::engine::ProtocolEngine::builder`].
#[async_trait]
pub trait PacketHandler<Endpoint>: Clone + Send + Sync + 'static {
    async fn handle(&self, decoded: Result<CoapMessage, MessageError>, peer: Endpoint);
}

/// Builds the packet handler once the transport is bound and its MTU and outbox exist.
#[async_trait]
pub trait IntoHandler<Handler, Endpoint>
where
    Handler: PacketHandler<Endpoint>,
{
    async fn into_handler(self, mtu: Option<u32>, outbox: Outbox<Endpoint>) -> Handler;
}
