use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Sink, Stream};
use log::debug;
use pin_project::pin_project;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio_util::udp::UdpFramed;

use crate::codec::MessageCodec;
use crate::message::CoapMessage;
use crate::transport::{
    BoxedFramedBinding, FramedBinding, FramedItem, FramedReadError, Transport, TransportError,
};

/// Default CoAP transport as originally defined in RFC 7252.  Likely this is what you want if
/// you're new to CoAP.
pub struct UdpTransport<A: ToSocketAddrs> {
    addresses: A,
    mtu: Option<u32>,
}

impl<A: ToSocketAddrs> UdpTransport<A> {
    pub fn new(addresses: A) -> Self {
        Self {
            addresses,
            mtu: None,
        }
    }

    /// Manually set the MTU that will be used to size Block2 responses.
    pub fn set_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }
}

#[async_trait]
impl<A: ToSocketAddrs + Sync + Send> Transport for UdpTransport<A> {
    type Endpoint = SocketAddr;

    async fn bind(self) -> Result<BoxedFramedBinding<Self::Endpoint>, TransportError> {
        let socket = UdpSocket::bind(self.addresses).await?;
        let local_addr = socket.local_addr()?;
        debug!("Bound UDP transport on {local_addr}");
        let framed_socket = UdpFramed::new(socket, MessageCodec);
        let binding = UdpBinding {
            framed_socket,
            mtu: self.mtu,
        };
        Ok(Box::pin(binding))
    }
}

#[pin_project]
struct UdpBinding {
    #[pin]
    framed_socket: UdpFramed<MessageCodec>,
    mtu: Option<u32>,
}

impl FramedBinding<SocketAddr> for UdpBinding {
    fn mtu(&self) -> Option<u32> {
        self.mtu
    }
}

/// ICMP errors reported back through the socket by some platforms.  They concern a single
/// earlier send and do not affect the socket.
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

impl Stream for UdpBinding {
    type Item = Result<FramedItem<SocketAddr>, FramedReadError<SocketAddr>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut framed_socket = self.project().framed_socket;
        loop {
            return match framed_socket.as_mut().poll_next(cx) {
                Poll::Ready(Some(Err(TransportError::IoError(e)))) if is_transient(&e) => {
                    debug!("Ignoring transient socket error: {e}");
                    continue;
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err((e, None)))),
                Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

impl Sink<(CoapMessage, SocketAddr)> for UdpBinding {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: (CoapMessage, SocketAddr)) -> Result<(), Self::Error> {
        self.project().framed_socket.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_close(cx)
    }
}
