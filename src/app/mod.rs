//! Application boundary: requests handed to handlers, the response slot they fulfil and a
//! small router to dispatch by path and method.

pub use error::CoapError;
pub use handler::{RequestHandler, Responder, ResponseResult};
pub use request::{CoapRequest, CoapResponse};
pub use router::Router;

pub mod error;
pub mod handler;
mod path_matcher;
pub mod request;
pub mod router;
