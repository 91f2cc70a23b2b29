use crate::message::{CoapMessage, InvalidMessage, MessageClass, RequestMethod, ResponseStatus};

/// A fully reassembled request as seen by the application.
#[derive(Debug, Clone)]
pub struct CoapRequest<Endpoint> {
    pub message: CoapMessage,
    pub peer: Endpoint,

    /// Path segments left over after the router matched the most specific resource.
    pub unmatched_path: Vec<String>,
}

impl<Endpoint> CoapRequest<Endpoint> {
    pub fn new(message: CoapMessage, peer: Endpoint) -> Self {
        Self {
            message,
            peer,
            unmatched_path: Vec::new(),
        }
    }

    pub fn method(&self) -> Option<RequestMethod> {
        self.message.method()
    }

    pub fn path(&self) -> String {
        self.message.uri_path()
    }

    pub fn payload(&self) -> &[u8] {
        self.message.payload()
    }

    pub fn new_response(&self) -> CoapResponse {
        CoapResponse::for_request(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoapResponse {
    pub message: CoapMessage,
}

impl CoapResponse {
    /// Response addressed to `request` with the usual success code for its method.  The
    /// final Block1 option of a reassembled upload is echoed back.
    pub fn for_request(request: &CoapMessage) -> Self {
        let status = match request.method() {
            Some(RequestMethod::Get) | None => ResponseStatus::Content,
            Some(RequestMethod::Post) => ResponseStatus::Created,
            Some(RequestMethod::Put) => ResponseStatus::Changed,
            Some(RequestMethod::Delete) => ResponseStatus::Deleted,
        };
        let mut message = CoapMessage::response_to(request, status);
        if let Some(block) = request.block1() {
            let _ = message.set_block1(block);
        }
        Self { message }
    }

    pub fn status(&self) -> Option<ResponseStatus> {
        self.message.status()
    }

    pub fn set_status(&mut self, status: ResponseStatus) {
        self.message.set_code(MessageClass::Response(status));
    }

    pub fn set_payload(&mut self, payload: impl Into<Vec<u8>>) -> Result<(), InvalidMessage> {
        self.message.set_payload(payload.into())
    }

    pub fn set_content_format(&mut self, content_format: u16) -> Result<(), InvalidMessage> {
        self.message.set_content_format(content_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::block::BlockValue;
    use crate::message::{MessageType, Token};

    #[test]
    fn test_default_status_per_method() {
        let cases = [
            (RequestMethod::Get, ResponseStatus::Content),
            (RequestMethod::Post, ResponseStatus::Created),
            (RequestMethod::Put, ResponseStatus::Changed),
            (RequestMethod::Delete, ResponseStatus::Deleted),
        ];
        for (method, status) in cases {
            let request = CoapMessage::new_request(MessageType::NonConfirmable, method);
            assert_eq!(CoapResponse::for_request(&request).status(), Some(status));
        }
    }

    #[test]
    fn test_addressed_to_request() {
        let mut request = CoapMessage::new_request(MessageType::Confirmable, RequestMethod::Post);
        request.set_message_id(7);
        request.set_token(Token::new(vec![1, 2]).unwrap()).unwrap();
        request.set_block1(BlockValue::new(2, false, 0).unwrap()).unwrap();

        let response = CoapRequest::new(request.clone(), ()).new_response();
        assert_eq!(response.message.message_type(), MessageType::Acknowledgement);
        assert_eq!(response.message.message_id(), 7);
        assert_eq!(response.message.token(), request.token());
        assert_eq!(response.message.block1(), request.block1());
    }
}
