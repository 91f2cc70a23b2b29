//! In-memory representation of a CoAP message.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::message::block::BlockValue;
use crate::message::option::{CoapOption, OptionError, OptionValue};
use crate::message::sequence::u24;

pub mod block;
pub mod option;
pub mod sequence;

pub type MessageId = u16;

pub const MAX_TOKEN_LENGTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMethod {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    // 2.xx
    Created,
    Deleted,
    Valid,
    Changed,
    Content,
    Continue,

    // 4.xx
    BadRequest,
    Unauthorized,
    BadOption,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    RequestEntityIncomplete,
    PreconditionFailed,
    RequestEntityTooLarge,
    UnsupportedContentFormat,

    // 5.xx
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    ProxyingNotSupported,
}

impl ResponseStatus {
    pub fn is_success(self) -> bool {
        u8::from(MessageClass::Response(self)) >> 5 == 2
    }
}

/// The 8-bit code field, split into its request/response meaning.  Codes without a
/// registered meaning are kept verbatim so they survive a decode/encode cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Empty,
    Request(RequestMethod),
    Response(ResponseStatus),
    Reserved(u8),
}

impl From<u8> for MessageClass {
    fn from(code: u8) -> Self {
        use ResponseStatus::*;
        let status = match code {
            0x00 => return MessageClass::Empty,
            0x01 => return MessageClass::Request(RequestMethod::Get),
            0x02 => return MessageClass::Request(RequestMethod::Post),
            0x03 => return MessageClass::Request(RequestMethod::Put),
            0x04 => return MessageClass::Request(RequestMethod::Delete),

            0x41 => Created,
            0x42 => Deleted,
            0x43 => Valid,
            0x44 => Changed,
            0x45 => Content,
            0x5F => Continue,

            0x80 => BadRequest,
            0x81 => Unauthorized,
            0x82 => BadOption,
            0x83 => Forbidden,
            0x84 => NotFound,
            0x85 => MethodNotAllowed,
            0x86 => NotAcceptable,
            0x88 => RequestEntityIncomplete,
            0x8C => PreconditionFailed,
            0x8D => RequestEntityTooLarge,
            0x8F => UnsupportedContentFormat,

            0xA0 => InternalServerError,
            0xA1 => NotImplemented,
            0xA2 => BadGateway,
            0xA3 => ServiceUnavailable,
            0xA4 => GatewayTimeout,
            0xA5 => ProxyingNotSupported,

            other => return MessageClass::Reserved(other),
        };
        MessageClass::Response(status)
    }
}

impl From<MessageClass> for u8 {
    fn from(class: MessageClass) -> u8 {
        use ResponseStatus::*;
        match class {
            MessageClass::Empty => 0x00,

            MessageClass::Request(RequestMethod::Get) => 0x01,
            MessageClass::Request(RequestMethod::Post) => 0x02,
            MessageClass::Request(RequestMethod::Put) => 0x03,
            MessageClass::Request(RequestMethod::Delete) => 0x04,

            MessageClass::Response(Created) => 0x41,
            MessageClass::Response(Deleted) => 0x42,
            MessageClass::Response(Valid) => 0x43,
            MessageClass::Response(Changed) => 0x44,
            MessageClass::Response(Content) => 0x45,
            MessageClass::Response(Continue) => 0x5F,

            MessageClass::Response(BadRequest) => 0x80,
            MessageClass::Response(Unauthorized) => 0x81,
            MessageClass::Response(BadOption) => 0x82,
            MessageClass::Response(Forbidden) => 0x83,
            MessageClass::Response(NotFound) => 0x84,
            MessageClass::Response(MethodNotAllowed) => 0x85,
            MessageClass::Response(NotAcceptable) => 0x86,
            MessageClass::Response(RequestEntityIncomplete) => 0x88,
            MessageClass::Response(PreconditionFailed) => 0x8C,
            MessageClass::Response(RequestEntityTooLarge) => 0x8D,
            MessageClass::Response(UnsupportedContentFormat) => 0x8F,

            MessageClass::Response(InternalServerError) => 0xA0,
            MessageClass::Response(NotImplemented) => 0xA1,
            MessageClass::Response(BadGateway) => 0xA2,
            MessageClass::Response(ServiceUnavailable) => 0xA3,
            MessageClass::Response(GatewayTimeout) => 0xA4,
            MessageClass::Response(ProxyingNotSupported) => 0xA5,

            MessageClass::Reserved(code) => code,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = u8::from(*self);
        write!(f, "{}.{:02}", code >> 5, code & 0x1f)
    }
}

/// Opaque request/response correlator of at most eight bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(Vec<u8>);

impl Token {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, InvalidMessage> {
        let bytes = bytes.into();
        if bytes.len() > MAX_TOKEN_LENGTH {
            return Err(InvalidMessage::TokenTooLong(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({self})")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<empty>");
        }
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Violations of the message model that a caller can commit while building a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidMessage {
    #[error("token of {0} bytes exceeds the 8 byte limit")]
    TokenTooLong(usize),

    #[error("{0} messages carry nothing beyond the header")]
    NotAllowedOnEmpty(MessageClass),

    #[error(transparent)]
    Option(#[from] OptionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    message_type: MessageType,
    code: MessageClass,
    message_id: MessageId,
    token: Token,
    options: BTreeMap<u16, Vec<OptionValue>>,
    payload: Vec<u8>,
}

impl CoapMessage {
    pub fn new(message_type: MessageType, code: MessageClass, message_id: MessageId) -> Self {
        Self {
            message_type,
            code,
            message_id,
            token: Token::empty(),
            options: BTreeMap::new(),
            payload: Vec::new(),
        }
    }

    pub fn new_request(message_type: MessageType, method: RequestMethod) -> Self {
        Self::new(message_type, MessageClass::Request(method), 0)
    }

    pub fn new_response(message_type: MessageType, status: ResponseStatus) -> Self {
        Self::new(message_type, MessageClass::Response(status), 0)
    }

    pub fn new_empty(message_type: MessageType, message_id: MessageId) -> Self {
        Self::new(message_type, MessageClass::Empty, message_id)
    }

    /// Response skeleton for `request`: piggy-backed on the ACK (same message ID) when the
    /// request is Confirmable, Non-confirmable otherwise, always echoing the token.
    pub fn response_to(request: &CoapMessage, status: ResponseStatus) -> Self {
        let (message_type, message_id) = match request.message_type {
            MessageType::Confirmable => (MessageType::Acknowledgement, request.message_id),
            _ => (MessageType::NonConfirmable, 0),
        };
        let mut response = Self::new(message_type, MessageClass::Response(status), message_id);
        response.token = request.token.clone();
        response
    }

    /// Confirmable empty message used to probe whether a peer is alive.
    pub fn ping(message_id: MessageId) -> Self {
        Self::new_empty(MessageType::Confirmable, message_id)
    }

    pub fn empty_ack(message_id: MessageId) -> Self {
        Self::new_empty(MessageType::Acknowledgement, message_id)
    }

    pub fn reset(message_id: MessageId) -> Self {
        Self::new_empty(MessageType::Reset, message_id)
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn set_message_type(&mut self, message_type: MessageType) {
        self.message_type = message_type;
    }

    pub fn code(&self) -> MessageClass {
        self.code
    }

    /// Changes the code.  Switching to EMPTY strips token, options and payload.
    pub fn set_code(&mut self, code: MessageClass) {
        self.code = code;
        if code == MessageClass::Empty {
            self.token = Token::empty();
            self.options.clear();
            self.payload.clear();
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn set_message_id(&mut self, message_id: MessageId) {
        self.message_id = message_id;
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn set_token(&mut self, token: Token) -> Result<(), InvalidMessage> {
        if self.is_empty_message() && !token.is_empty() {
            return Err(InvalidMessage::NotAllowedOnEmpty(self.code));
        }
        self.token = token;
        Ok(())
    }

    pub fn is_empty_message(&self) -> bool {
        self.code == MessageClass::Empty
    }

    pub fn is_request(&self) -> bool {
        matches!(self.code, MessageClass::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self.code, MessageClass::Response(_))
    }

    pub fn method(&self) -> Option<RequestMethod> {
        match self.code {
            MessageClass::Request(method) => Some(method),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<ResponseStatus> {
        match self.code {
            MessageClass::Response(status) => Some(status),
            _ => None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) -> Result<(), InvalidMessage> {
        if self.is_empty_message() && !payload.is_empty() {
            return Err(InvalidMessage::NotAllowedOnEmpty(self.code));
        }
        self.payload = payload;
        Ok(())
    }

    pub fn take_payload(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.payload)
    }

    /// Appends a value, keeping earlier values of the same option in insertion order.
    pub fn add_option(
        &mut self,
        option: CoapOption,
        value: OptionValue,
    ) -> Result<(), InvalidMessage> {
        if self.is_empty_message() {
            return Err(InvalidMessage::NotAllowedOnEmpty(self.code));
        }
        value.validate_for(option)?;
        let repeatable = option.definition().map_or(false, |d| d.repeatable);
        let values = self.options.entry(option.number()).or_default();
        if !repeatable && !values.is_empty() {
            return Err(OptionError::NotRepeatable(option).into());
        }
        values.push(value);
        Ok(())
    }

    /// Replaces every value of `option` with `value`.
    pub fn set_option(
        &mut self,
        option: CoapOption,
        value: OptionValue,
    ) -> Result<(), InvalidMessage> {
        let previous = self.options.remove(&option.number());
        let result = self.add_option(option, value);
        if result.is_err() {
            if let Some(previous) = previous {
                self.options.insert(option.number(), previous);
            }
        }
        result
    }

    pub fn remove_option(&mut self, option: CoapOption) -> Vec<OptionValue> {
        self.options.remove(&option.number()).unwrap_or_default()
    }

    pub fn get_option(&self, option: CoapOption) -> &[OptionValue] {
        self.options
            .get(&option.number())
            .map_or(&[], |values| values.as_slice())
    }

    pub fn get_first_option(&self, option: CoapOption) -> Option<&OptionValue> {
        self.get_option(option).first()
    }

    pub fn has_option(&self, option: CoapOption) -> bool {
        !self.get_option(option).is_empty()
    }

    /// All options in ascending option number order, repeated values in insertion order.
    pub fn options(&self) -> impl Iterator<Item = (CoapOption, &OptionValue)> {
        self.options.iter().flat_map(|(number, values)| {
            let option = CoapOption::from_number(*number);
            values.iter().map(move |value| (option, value))
        })
    }

    pub(crate) fn insert_decoded_option(&mut self, option: CoapOption, value: OptionValue) {
        self.options.entry(option.number()).or_default().push(value);
    }

    fn uint_option(&self, option: CoapOption) -> Option<u32> {
        self.get_first_option(option).and_then(OptionValue::as_uint)
    }

    fn set_uint_option(&mut self, option: CoapOption, value: u32) -> Result<(), InvalidMessage> {
        self.set_option(option, OptionValue::UInt(value))
    }

    pub fn uri_path(&self) -> String {
        self.get_option(CoapOption::UriPath)
            .iter()
            .filter_map(OptionValue::as_str)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Sets Uri-Path from a slash separated path such as `/sensors/temp`.
    pub fn set_uri_path(&mut self, path: &str) -> Result<(), InvalidMessage> {
        self.remove_option(CoapOption::UriPath);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::UriPath, OptionValue::String(segment.to_string()))?;
        }
        Ok(())
    }

    pub fn uri_queries(&self) -> Vec<&str> {
        self.get_option(CoapOption::UriQuery)
            .iter()
            .filter_map(OptionValue::as_str)
            .collect()
    }

    pub fn content_format(&self) -> Option<u16> {
        self.uint_option(CoapOption::ContentFormat)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn set_content_format(&mut self, content_format: u16) -> Result<(), InvalidMessage> {
        self.set_uint_option(CoapOption::ContentFormat, u32::from(content_format))
    }

    pub fn accept(&self) -> Option<u16> {
        self.uint_option(CoapOption::Accept)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn observe(&self) -> Option<u24> {
        self.uint_option(CoapOption::Observe)
            .and_then(|v| u24::try_from(v).ok())
    }

    pub fn set_observe(&mut self, sequence: u24) -> Result<(), InvalidMessage> {
        self.set_uint_option(CoapOption::Observe, u32::from(sequence))
    }

    pub fn etags(&self) -> Vec<Vec<u8>> {
        self.get_option(CoapOption::ETag)
            .iter()
            .filter_map(OptionValue::as_opaque)
            .map(<[u8]>::to_vec)
            .collect()
    }

    pub fn add_etag(&mut self, etag: Vec<u8>) -> Result<(), InvalidMessage> {
        self.add_option(CoapOption::ETag, OptionValue::Opaque(etag))
    }

    pub fn max_age(&self) -> Option<u32> {
        self.uint_option(CoapOption::MaxAge)
    }

    pub fn set_max_age(&mut self, seconds: u32) -> Result<(), InvalidMessage> {
        self.set_uint_option(CoapOption::MaxAge, seconds)
    }

    pub fn block1(&self) -> Option<BlockValue> {
        self.uint_option(CoapOption::Block1)
            .and_then(|v| BlockValue::try_from(v).ok())
    }

    pub fn set_block1(&mut self, block: BlockValue) -> Result<(), InvalidMessage> {
        self.set_uint_option(CoapOption::Block1, u32::from(block))
    }

    pub fn block2(&self) -> Option<BlockValue> {
        self.uint_option(CoapOption::Block2)
            .and_then(|v| BlockValue::try_from(v).ok())
    }

    pub fn set_block2(&mut self, block: BlockValue) -> Result<(), InvalidMessage> {
        self.set_uint_option(CoapOption::Block2, u32::from(block))
    }

    pub fn size1(&self) -> Option<u32> {
        self.uint_option(CoapOption::Size1)
    }

    pub fn set_size1(&mut self, size: u32) -> Result<(), InvalidMessage> {
        self.set_uint_option(CoapOption::Size1, size)
    }

    pub fn size2(&self) -> Option<u32> {
        self.uint_option(CoapOption::Size2)
    }

    pub fn set_size2(&mut self, size: u32) -> Result<(), InvalidMessage> {
        self.set_uint_option(CoapOption::Size2, size)
    }
}

impl fmt::Display for CoapMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?} {} mid={} token={}",
            self.message_type, self.code, self.message_id, self.token
        )?;
        for (option, value) in self.options() {
            write!(f, " {option}={value:?}")?;
        }
        if !self.payload.is_empty() {
            write!(f, " payload={}B", self.payload.len())?;
        }
        f.write_str("]")
    }
}
