//! CoAP protocol engine: message codec, reliability layers, block-wise transfer and
//! observe, composed into a pipeline that sits between a datagram transport and an
//! application [`app::RequestHandler`].
//!
//! ```no_run
//! use std::net::SocketAddr;
//!
//! use coap_engine::app::{CoapError, CoapRequest, Router};
//! use coap_engine::{CoapServer, FatalServerError, UdpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), FatalServerError> {
//!     let router = Router::new().get("/hello", |request: CoapRequest<SocketAddr>| async move {
//!         let mut response = request.new_response();
//!         response.set_payload("world").map_err(CoapError::internal)?;
//!         Ok::<_, CoapError>(response)
//!     });
//!     let server = CoapServer::bind(UdpTransport::new("0.0.0.0:5683")).await?;
//!     server.serve(router).await
//! }
//! ```

pub use config::ProtocolConfig;
pub use engine::{ProtocolEngine, ResponseCallback};
pub use message::{CoapMessage, MessageType, RequestMethod, ResponseStatus};
pub use reliability::SendFailed;
pub use server::{CoapServer, FatalServerError};
pub use udp::UdpTransport;

pub mod app;
pub mod blockwise;
pub mod codec;
pub mod config;
pub mod engine;
pub mod identifiers;
pub mod message;
pub mod observe;
pub mod packet_handler;
pub mod pipeline;
pub mod reliability;
pub mod server;
pub mod table;
pub mod transport;
pub mod udp;
