use std::fmt::Debug;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};
use thiserror::Error;

use crate::codec::MessageError;
use crate::message::CoapMessage;

/// Generalization of the underlying CoAP transport so that the engine does not care whether
/// datagrams arrive over a real socket or an in-memory channel.
#[async_trait]
pub trait Transport {
    type Endpoint: Debug + Send + Clone;

    /// Begin accepting datagrams from this transport.  Every item delivered by the binding
    /// names the peer it came from, so packet oriented transports need no notion of a
    /// connection.
    async fn bind(self) -> Result<BoxedFramedBinding<Self::Endpoint>, TransportError>;
}

pub type BoxedFramedBinding<Endpoint> = Pin<Box<dyn FramedBinding<Endpoint>>>;

/// A bound socket exposed as both a stream of decoded datagrams and a sink of messages to
/// encode and send.
pub trait FramedBinding<Endpoint>:
    Send
    + Stream<Item = Result<FramedItem<Endpoint>, FramedReadError<Endpoint>>>
    + Sink<(CoapMessage, Endpoint), Error = FramedWriteError>
{
    /// Link MTU, used to pick the largest block size that still fits in one datagram.  `None`
    /// lets the engine fall back to its configured maximum.
    fn mtu(&self) -> Option<u32>;
}

/// One received datagram.  Decoding failures are delivered as items so the engine can reply
/// with a Reset or 4.02 to the peer that sent them.
pub type FramedItem<Endpoint> = (Result<CoapMessage, MessageError>, Endpoint);

/// Read error, with the peer when the failure can be attributed to one.
pub type FramedReadError<Endpoint> = (TransportError, Option<Endpoint>);

pub type FramedWriteError = TransportError;

/// Transport level failures such as being unable to bind or a socket error.  Most are not
/// fatal and the server keeps serving other peers.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("unspecified: {0}")]
    Unspecified(String),
}
