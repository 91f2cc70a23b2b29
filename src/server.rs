use futures::stream::Fuse;
use futures::{SinkExt, StreamExt};
use log::{error, trace, warn};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::codec::MessageError;
use crate::message::CoapMessage;
use crate::packet_handler::{IntoHandler, PacketHandler};
use crate::pipeline::{EndpointAddr, Outbox};
use crate::transport::{
    BoxedFramedBinding, FramedItem, FramedReadError, Transport, TransportError,
};

/// Primary server API to bind and ultimately run the CoAP server.
pub struct CoapServer<Handler, Endpoint> {
    binding: Fuse<BoxedFramedBinding<Endpoint>>,
    relay_rx: Fuse<UnboundedReceiverStream<(CoapMessage, Endpoint)>>,
    relay_tx: UnboundedSender<(CoapMessage, Endpoint)>,
    handler: Option<Handler>,
}

impl<Handler, Endpoint: EndpointAddr> CoapServer<Handler, Endpoint>
where
    Handler: PacketHandler<Endpoint>,
{
    /// Bind the server to a specific source of incoming datagrams in a transport-agnostic way.
    /// Most customers will wish to use [`crate::udp::UdpTransport`].
    pub async fn bind<T: Transport<Endpoint = Endpoint>>(
        transport: T,
    ) -> Result<Self, TransportError> {
        let binding = transport.bind().await?;
        let (relay_tx, relay_rx) = unbounded_channel();
        Ok(Self {
            binding: binding.fuse(),
            relay_rx: UnboundedReceiverStream::new(relay_rx).fuse(),
            relay_tx,
            handler: None,
        })
    }

    /// Run the server "forever".  Note that the function may return a fatal error if the server
    /// encounters unrecoverable issues, typically transport errors not related to a specific
    /// peer.
    pub async fn serve(
        mut self,
        handler: impl IntoHandler<Handler, Endpoint>,
    ) -> Result<(), FatalServerError> {
        let mtu = self.binding.get_ref().mtu();
        let outbox = Outbox::new(self.relay_tx.clone());
        self.handler = Some(handler.into_handler(mtu, outbox).await);

        loop {
            tokio::select! {
                event = self.binding.select_next_some() => {
                    self.handle_rx_event(event)?;
                }
                item = self.relay_rx.select_next_some() => {
                    self.handle_relay(item).await;
                }
            }
        }
    }

    fn handle_rx_event(
        &self,
        result: Result<FramedItem<Endpoint>, FramedReadError<Endpoint>>,
    ) -> Result<(), FatalServerError> {
        match result {
            Ok((decoded, peer)) => self.dispatch(decoded, peer)?,
            Err((transport_err, peer)) => {
                warn!("Error from {peer:?}: {transport_err}");
                if peer.is_none() {
                    return Err(transport_err.into());
                }
            }
        }

        Ok(())
    }

    /// Each datagram gets its own task so a slow handler never holds up the socket.
    fn dispatch(
        &self,
        decoded: Result<CoapMessage, MessageError>,
        peer: Endpoint,
    ) -> Result<(), FatalServerError> {
        let handler = self
            .handler
            .as_ref()
            .ok_or_else(|| FatalServerError::InternalError("handler not set".to_string()))?
            .clone();
        tokio::spawn(async move {
            handler.handle(decoded, peer).await;
        });
        Ok(())
    }

    async fn handle_relay(&mut self, item: (CoapMessage, Endpoint)) {
        let peer = item.1.clone();
        trace!("Outgoing to {peer:?}: {}", item.0);
        if let Err(e) = self.binding.send(item).await {
            error!("Error sending to {peer:?}: {e}");
        }
    }
}

/// Fatal error preventing the server from starting or continuing.  Typically the result of
/// programmer error or misconfiguration.
#[derive(Error, Debug)]
pub enum FatalServerError {
    /// Programmer error within this crate, file a bug!
    #[error("internal error: {0}")]
    InternalError(String),

    /// Transport error that is not related to any individual peer but would prevent any future
    /// exchanges on the transport.  Must abort the server.
    #[error("fatal transport error: {0}")]
    Transport(#[from] TransportError),
}
