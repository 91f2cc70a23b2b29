//! Wire format of RFC 7252 §3: a 4 byte header, the token, delta encoded options, an
//! optional 0xFF marker and the payload.

use bytes::BytesMut;
use log::{debug, trace};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::option::{CoapOption, OptionError, OptionValue};
use crate::message::{
    CoapMessage, MessageClass, MessageId, MessageType, Token, MAX_TOKEN_LENGTH,
};
use crate::transport::TransportError;

const VERSION: u8 = 1;
const HEADER_LENGTH: usize = 4;
const PAYLOAD_MARKER: u8 = 0xFF;

/// A datagram that could not be turned into a [`CoapMessage`].  Each variant carries exactly
/// what the receiver needs to build its reply: a Reset for header faults when the message ID
/// survived, a 4.02 (Bad Option) for a request with a malformed critical option.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("malformed message (mid={message_id:?}): {fault}")]
    Header {
        message_id: Option<MessageId>,
        fault: FormatFault,
    },

    #[error("bad critical option {number} in {message_type:?} request mid={message_id}: {fault}")]
    BadOption {
        message_id: MessageId,
        token: Token,
        message_type: MessageType,
        number: u16,
        fault: OptionError,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFault {
    #[error("datagram shorter than the 4 byte header")]
    TooShort,

    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("token length {0} exceeds 8")]
    InvalidTokenLength(u8),

    #[error("token runs past the end of the datagram")]
    TruncatedToken,

    #[error("non-confirmable empty message")]
    EmptyNonConfirmable,

    #[error("option runs past the end of the datagram")]
    TruncatedOption,

    #[error("reserved option nibble 15")]
    ReservedOptionNibble,

    #[error("option number exceeds 65535")]
    OptionNumberOverflow,
}

impl MessageError {
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            MessageError::Header { message_id, .. } => *message_id,
            MessageError::BadOption { message_id, .. } => Some(*message_id),
        }
    }
}

pub fn decode(bytes: &[u8]) -> Result<CoapMessage, MessageError> {
    if bytes.len() < HEADER_LENGTH {
        return Err(header_error(None, FormatFault::TooShort));
    }
    let version = bytes[0] >> 6;
    if version != VERSION {
        return Err(header_error(None, FormatFault::UnsupportedVersion(version)));
    }
    let message_type = MessageType::from_bits(bytes[0] >> 4);
    let token_length = bytes[0] & 0x0F;
    let code = MessageClass::from(bytes[1]);
    let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

    if usize::from(token_length) > MAX_TOKEN_LENGTH {
        return Err(header_error(
            Some(message_id),
            FormatFault::InvalidTokenLength(token_length),
        ));
    }

    if code == MessageClass::Empty {
        if message_type == MessageType::NonConfirmable {
            return Err(header_error(
                Some(message_id),
                FormatFault::EmptyNonConfirmable,
            ));
        }
        return Ok(CoapMessage::new_empty(message_type, message_id));
    }

    let token_end = HEADER_LENGTH + usize::from(token_length);
    if bytes.len() < token_end {
        return Err(header_error(Some(message_id), FormatFault::TruncatedToken));
    }
    let token = Token::new(&bytes[HEADER_LENGTH..token_end])
        .map_err(|_| header_error(Some(message_id), FormatFault::InvalidTokenLength(token_length)))?;

    let mut message = CoapMessage::new(message_type, code, message_id);
    message.set_token(token.clone()).map_err(|_| {
        header_error(Some(message_id), FormatFault::InvalidTokenLength(token_length))
    })?;

    let mut reader = OptionReader::new(bytes, token_end);
    while let Some((number, raw)) = reader
        .next_option()
        .map_err(|fault| header_error(Some(message_id), fault))?
    {
        let option = CoapOption::from_number(number);
        let repeats_single = message.has_option(option)
            && !option.definition().map_or(false, |d| d.repeatable);
        let value = if repeats_single {
            Err(OptionError::NotRepeatable(option))
        } else {
            OptionValue::decode(option, raw)
        };
        match value {
            Ok(value) => message.insert_decoded_option(option, value),
            Err(OptionError::DefaultValue(_)) => {
                trace!("Dropping {option} carrying its default value");
            }
            Err(fault) if message.is_request() && option.is_critical() => {
                return Err(MessageError::BadOption {
                    message_id,
                    token,
                    message_type,
                    number,
                    fault,
                });
            }
            Err(fault) => {
                debug!("Dropping malformed option in mid={message_id}: {fault}");
            }
        }
    }

    let payload = reader.remaining();
    if !payload.is_empty() {
        message
            .set_payload(payload.to_vec())
            .map_err(|_| header_error(Some(message_id), FormatFault::TruncatedOption))?;
    }
    Ok(message)
}

pub fn encode(message: &CoapMessage) -> Vec<u8> {
    let token = message.token().as_bytes();
    let mut out = Vec::with_capacity(HEADER_LENGTH + token.len() + message.payload().len() + 16);
    // The model guarantees at most 8 token bytes, so the length fits the nibble.
    out.push(VERSION << 6 | message.message_type().bits() << 4 | token.len() as u8);
    out.push(u8::from(message.code()));
    out.extend_from_slice(&message.message_id().to_be_bytes());
    out.extend_from_slice(token);

    let mut previous = 0u16;
    for (option, value) in message.options() {
        let number = option.number();
        let bytes = value.to_bytes();
        write_option_header(&mut out, number - previous, bytes.len());
        out.extend_from_slice(&bytes);
        previous = number;
    }

    if !message.payload().is_empty() {
        out.push(PAYLOAD_MARKER);
        out.extend_from_slice(message.payload());
    }
    out
}

fn header_error(message_id: Option<MessageId>, fault: FormatFault) -> MessageError {
    MessageError::Header { message_id, fault }
}

fn write_option_header(out: &mut Vec<u8>, delta: u16, length: usize) {
    let (delta_nibble, delta_ext) = extended_field(usize::from(delta));
    let (length_nibble, length_ext) = extended_field(length);
    out.push(delta_nibble << 4 | length_nibble);
    out.extend_from_slice(&delta_ext);
    out.extend_from_slice(&length_ext);
}

/// Splits a delta or length into its 4 bit nibble and the 0, 1 or 2 extension bytes.
fn extended_field(value: usize) -> (u8, Vec<u8>) {
    match value {
        0..=12 => (value as u8, Vec::new()),
        13..=268 => (13, vec![(value - 13) as u8]),
        _ => (14, ((value - 269) as u16).to_be_bytes().to_vec()),
    }
}

struct OptionReader<'a> {
    bytes: &'a [u8],
    position: usize,
    number: u32,
    finished: bool,
}

impl<'a> OptionReader<'a> {
    fn new(bytes: &'a [u8], position: usize) -> Self {
        Self {
            bytes,
            position,
            number: 0,
            finished: false,
        }
    }

    fn next_option(&mut self) -> Result<Option<(u16, &'a [u8])>, FormatFault> {
        if self.finished || self.position >= self.bytes.len() {
            self.finished = true;
            return Ok(None);
        }
        let byte = self.bytes[self.position];
        self.position += 1;
        if byte == PAYLOAD_MARKER {
            self.finished = true;
            return Ok(None);
        }

        let delta = self.read_extended(byte >> 4)?;
        let length = self.read_extended(byte & 0x0F)? as usize;
        self.number += delta;
        let number = u16::try_from(self.number).map_err(|_| FormatFault::OptionNumberOverflow)?;

        let end = self.position + length;
        if end > self.bytes.len() {
            return Err(FormatFault::TruncatedOption);
        }
        let value = &self.bytes[self.position..end];
        self.position = end;
        Ok(Some((number, value)))
    }

    fn read_extended(&mut self, nibble: u8) -> Result<u32, FormatFault> {
        match nibble {
            0..=12 => Ok(u32::from(nibble)),
            13 => {
                let ext = *self
                    .bytes
                    .get(self.position)
                    .ok_or(FormatFault::TruncatedOption)?;
                self.position += 1;
                Ok(u32::from(ext) + 13)
            }
            14 => {
                let ext = self
                    .bytes
                    .get(self.position..self.position + 2)
                    .ok_or(FormatFault::TruncatedOption)?;
                self.position += 2;
                Ok(u32::from(u16::from_be_bytes([ext[0], ext[1]])) + 269)
            }
            _ => Err(FormatFault::ReservedOptionNibble),
        }
    }

    /// Bytes following the payload marker, or nothing if the options ran to the end.
    fn remaining(&self) -> &'a [u8] {
        self.bytes.get(self.position..).unwrap_or(&[])
    }
}

/// Datagram codec for [`tokio_util::udp::UdpFramed`].  Each datagram is decoded in full; a
/// malformed datagram is surfaced as an item rather than a stream error so the receive
/// loop can answer it without tearing down the socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Result<CoapMessage, MessageError>;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, TransportError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let result = decode(buf);
        buf.clear();
        Ok(Some(result))
    }
}

impl Encoder<CoapMessage> for MessageCodec {
    type Error = TransportError;

    fn encode(&mut self, message: CoapMessage, buf: &mut BytesMut) -> Result<(), TransportError> {
        buf.extend_from_slice(&encode(&message));
        Ok(())
    }
}
