use std::fmt;

use crate::message::option::content_format;
use crate::message::{CoapMessage, ResponseStatus};

/// Error type which can be converted to a response as a convenience for allowing Rust's `?`
/// operator to work naturally in handler code without violating the protocol by failing to
/// respond to requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapError {
    pub code: Option<ResponseStatus>,
    pub message: String,
}

impl CoapError {
    pub fn internal(msg: impl ToString) -> Self {
        Self::for_code(ResponseStatus::InternalServerError, msg)
    }

    pub fn bad_request(msg: impl ToString) -> Self {
        Self::for_code(ResponseStatus::BadRequest, msg)
    }

    pub fn not_found() -> Self {
        Self::for_code(ResponseStatus::NotFound, "Not found")
    }

    pub fn method_not_allowed() -> Self {
        Self::for_code(ResponseStatus::MethodNotAllowed, "Method not allowed")
    }

    pub fn not_acceptable() -> Self {
        Self::for_code(ResponseStatus::NotAcceptable, "Not acceptable")
    }

    pub fn for_code(code: ResponseStatus, msg: impl ToString) -> Self {
        Self {
            code: Some(code),
            message: msg.to_string(),
        }
    }

    pub fn status(&self) -> ResponseStatus {
        self.code.unwrap_or(ResponseStatus::InternalServerError)
    }

    /// Builds the error response for `request`, carrying the message as a plain text
    /// diagnostic payload.
    pub fn into_response(self, request: &CoapMessage) -> CoapMessage {
        let mut response = CoapMessage::response_to(request, self.status());
        if !self.message.is_empty() {
            let _ = response.set_content_format(content_format::TEXT_PLAIN);
            let _ = response.set_payload(self.message.into_bytes());
        }
        response
    }
}

impl fmt::Display for CoapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handling error {:?}: {}", self.status(), self.message)
    }
}

impl std::error::Error for CoapError {}
