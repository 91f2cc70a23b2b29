//! Option numbers, their registered metadata and typed option values.
//!
//! Every option number carries its semantics in its low-order bits (RFC 7252 §5.4.6):
//! bit 0 marks the option critical, bit 1 unsafe-to-forward, and bits 1-4 equal to
//! `0b11100` mark it as not part of the cache key.

use std::fmt;

use thiserror::Error;

/// Well known content formats.
pub mod content_format {
    pub const TEXT_PLAIN: u16 = 0;
    pub const APPLICATION_LINK_FORMAT: u16 = 40;
    pub const APPLICATION_XML: u16 = 41;
    pub const APPLICATION_OCTET_STREAM: u16 = 42;
    pub const APPLICATION_EXI: u16 = 47;
    pub const APPLICATION_JSON: u16 = 50;
    pub const APPLICATION_CBOR: u16 = 60;
}

pub const MAX_AGE_DEFAULT: u32 = 60;
pub const URI_PORT_DEFAULT: u32 = 5683;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoapOption {
    IfMatch,
    UriHost,
    ETag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size2,
    ProxyUri,
    ProxyScheme,
    Size1,
    Unknown(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionFormat {
    Empty,
    Opaque,
    String,
    UInt,
}

/// Registered shape of an option: value format, permitted encoded length, whether it may
/// occur more than once and the implicit default that must never be put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionDefinition {
    pub format: OptionFormat,
    pub min_length: usize,
    pub max_length: usize,
    pub repeatable: bool,
    pub default: Option<u32>,
}

impl OptionDefinition {
    const fn new(format: OptionFormat, min_length: usize, max_length: usize) -> Self {
        Self {
            format,
            min_length,
            max_length,
            repeatable: false,
            default: None,
        }
    }

    const fn repeatable(mut self) -> Self {
        self.repeatable = true;
        self
    }

    const fn with_default(mut self, default: u32) -> Self {
        self.default = Some(default);
        self
    }
}

impl CoapOption {
    pub fn number(self) -> u16 {
        match self {
            CoapOption::IfMatch => 1,
            CoapOption::UriHost => 3,
            CoapOption::ETag => 4,
            CoapOption::IfNoneMatch => 5,
            CoapOption::Observe => 6,
            CoapOption::UriPort => 7,
            CoapOption::LocationPath => 8,
            CoapOption::UriPath => 11,
            CoapOption::ContentFormat => 12,
            CoapOption::MaxAge => 14,
            CoapOption::UriQuery => 15,
            CoapOption::Accept => 17,
            CoapOption::LocationQuery => 20,
            CoapOption::Block2 => 23,
            CoapOption::Block1 => 27,
            CoapOption::Size2 => 28,
            CoapOption::ProxyUri => 35,
            CoapOption::ProxyScheme => 39,
            CoapOption::Size1 => 60,
            CoapOption::Unknown(number) => number,
        }
    }

    pub fn from_number(number: u16) -> Self {
        match number {
            1 => CoapOption::IfMatch,
            3 => CoapOption::UriHost,
            4 => CoapOption::ETag,
            5 => CoapOption::IfNoneMatch,
            6 => CoapOption::Observe,
            7 => CoapOption::UriPort,
            8 => CoapOption::LocationPath,
            11 => CoapOption::UriPath,
            12 => CoapOption::ContentFormat,
            14 => CoapOption::MaxAge,
            15 => CoapOption::UriQuery,
            17 => CoapOption::Accept,
            20 => CoapOption::LocationQuery,
            23 => CoapOption::Block2,
            27 => CoapOption::Block1,
            28 => CoapOption::Size2,
            35 => CoapOption::ProxyUri,
            39 => CoapOption::ProxyScheme,
            60 => CoapOption::Size1,
            n => CoapOption::Unknown(n),
        }
    }

    pub fn is_critical(self) -> bool {
        self.number() & 0x01 == 0x01
    }

    pub fn is_unsafe_to_forward(self) -> bool {
        self.number() & 0x02 == 0x02
    }

    pub fn is_no_cache_key(self) -> bool {
        self.number() & 0x1e == 0x1c
    }

    /// Registered metadata, `None` for options this engine does not recognize.
    pub fn definition(self) -> Option<OptionDefinition> {
        use OptionFormat::*;
        let definition = match self {
            CoapOption::IfMatch => OptionDefinition::new(Opaque, 0, 8).repeatable(),
            CoapOption::UriHost => OptionDefinition::new(String, 1, 255),
            CoapOption::ETag => OptionDefinition::new(Opaque, 1, 8).repeatable(),
            CoapOption::IfNoneMatch => OptionDefinition::new(Empty, 0, 0),
            CoapOption::Observe => OptionDefinition::new(UInt, 0, 3),
            CoapOption::UriPort => OptionDefinition::new(UInt, 0, 2).with_default(URI_PORT_DEFAULT),
            CoapOption::LocationPath => OptionDefinition::new(String, 0, 255).repeatable(),
            CoapOption::UriPath => OptionDefinition::new(String, 0, 255).repeatable(),
            CoapOption::ContentFormat => OptionDefinition::new(UInt, 0, 2),
            CoapOption::MaxAge => OptionDefinition::new(UInt, 0, 4).with_default(MAX_AGE_DEFAULT),
            CoapOption::UriQuery => OptionDefinition::new(String, 0, 255).repeatable(),
            CoapOption::Accept => OptionDefinition::new(UInt, 0, 2),
            CoapOption::LocationQuery => OptionDefinition::new(String, 0, 255).repeatable(),
            CoapOption::Block2 | CoapOption::Block1 => OptionDefinition::new(UInt, 0, 3),
            CoapOption::Size2 | CoapOption::Size1 => OptionDefinition::new(UInt, 0, 4),
            CoapOption::ProxyUri => OptionDefinition::new(String, 1, 1034),
            CoapOption::ProxyScheme => OptionDefinition::new(String, 1, 255),
            CoapOption::Unknown(_) => return None,
        };
        Some(definition)
    }
}

impl fmt::Display for CoapOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoapOption::Unknown(number) => write!(f, "Unknown({number})"),
            known => write!(f, "{known:?}({})", known.number()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OptionValue {
    Empty,
    Opaque(Vec<u8>),
    String(String),
    UInt(u32),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("option number {0} is not recognized")]
    Unrecognized(u16),

    #[error("option {option} requires a {expected:?} value")]
    WrongFormat {
        option: CoapOption,
        expected: OptionFormat,
    },

    #[error("option {option} has length {length}, permitted range is {min}..={max}")]
    Length {
        option: CoapOption,
        length: usize,
        min: usize,
        max: usize,
    },

    #[error("option {0} is not valid UTF-8")]
    InvalidEncoding(CoapOption),

    #[error("option {0} carries its default value")]
    DefaultValue(CoapOption),

    #[error("option {0} is not repeatable")]
    NotRepeatable(CoapOption),

    #[error("option {0} carries a reserved block size")]
    InvalidBlock(CoapOption),
}

impl OptionValue {
    /// Builds a typed value from raw wire bytes, enforcing the registered format, length
    /// bounds and default rule.
    pub fn decode(option: CoapOption, raw: &[u8]) -> Result<Self, OptionError> {
        let definition = option
            .definition()
            .ok_or(OptionError::Unrecognized(option.number()))?;
        check_length(option, &definition, raw.len())?;
        let value = match definition.format {
            OptionFormat::Empty => OptionValue::Empty,
            OptionFormat::Opaque => OptionValue::Opaque(raw.to_vec()),
            OptionFormat::String => OptionValue::String(
                String::from_utf8(raw.to_vec()).map_err(|_| OptionError::InvalidEncoding(option))?,
            ),
            OptionFormat::UInt => OptionValue::UInt(
                raw.iter()
                    .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte)),
            ),
        };
        value.check_semantics(option, &definition)?;
        Ok(value)
    }

    /// Validates a value constructed in memory against the option it is attached to.
    pub fn validate_for(&self, option: CoapOption) -> Result<(), OptionError> {
        let definition = option
            .definition()
            .ok_or(OptionError::Unrecognized(option.number()))?;
        let format_matches = matches!(
            (definition.format, self),
            (OptionFormat::Empty, OptionValue::Empty)
                | (OptionFormat::Opaque, OptionValue::Opaque(_))
                | (OptionFormat::String, OptionValue::String(_))
                | (OptionFormat::UInt, OptionValue::UInt(_))
        );
        if !format_matches {
            return Err(OptionError::WrongFormat {
                option,
                expected: definition.format,
            });
        }
        check_length(option, &definition, self.encoded_len())?;
        self.check_semantics(option, &definition)
    }

    fn check_semantics(
        &self,
        option: CoapOption,
        definition: &OptionDefinition,
    ) -> Result<(), OptionError> {
        if let (Some(default), OptionValue::UInt(value)) = (definition.default, self) {
            if *value == default {
                return Err(OptionError::DefaultValue(option));
            }
        }
        if matches!(option, CoapOption::Block1 | CoapOption::Block2) {
            if let OptionValue::UInt(value) = self {
                if value & 0x7 == 0x7 {
                    return Err(OptionError::InvalidBlock(option));
                }
            }
        }
        Ok(())
    }

    /// Number of bytes this value occupies on the wire.  Integers use the shortest
    /// big-endian form, so zero takes no bytes at all.
    pub fn encoded_len(&self) -> usize {
        match self {
            OptionValue::Empty => 0,
            OptionValue::Opaque(bytes) => bytes.len(),
            OptionValue::String(s) => s.len(),
            OptionValue::UInt(value) => uint_len(*value),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            OptionValue::Empty => Vec::new(),
            OptionValue::Opaque(bytes) => bytes.clone(),
            OptionValue::String(s) => s.as_bytes().to_vec(),
            OptionValue::UInt(value) => {
                let len = uint_len(*value);
                value.to_be_bytes()[4 - len..].to_vec()
            }
        }
    }

    pub fn as_uint(&self) -> Option<u32> {
        match self {
            OptionValue::UInt(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&[u8]> {
        match self {
            OptionValue::Opaque(bytes) => Some(bytes.as_slice()),
            _ => None,
        }
    }
}

fn uint_len(value: u32) -> usize {
    (32 - value.leading_zeros() as usize + 7) / 8
}

fn check_length(
    option: CoapOption,
    definition: &OptionDefinition,
    length: usize,
) -> Result<(), OptionError> {
    if length < definition.min_length || length > definition.max_length {
        return Err(OptionError::Length {
            option,
            length,
            min: definition.min_length,
            max: definition.max_length,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_properties() {
        assert!(CoapOption::UriPath.is_critical());
        assert!(CoapOption::UriPath.is_unsafe_to_forward());
        assert!(!CoapOption::ETag.is_critical());
        assert!(!CoapOption::ContentFormat.is_critical());
        assert!(CoapOption::Size1.is_no_cache_key());
        assert!(!CoapOption::UriQuery.is_no_cache_key());
        assert!(CoapOption::Block1.is_critical());
    }

    #[test]
    fn test_number_mapping() {
        for number in 0..=64u16 {
            assert_eq!(CoapOption::from_number(number).number(), number);
        }
    }

    #[test]
    fn test_uint_minimal_encoding() {
        assert_eq!(OptionValue::UInt(0).to_bytes(), Vec::<u8>::new());
        assert_eq!(OptionValue::UInt(0x12).to_bytes(), vec![0x12]);
        assert_eq!(OptionValue::UInt(0x1234).to_bytes(), vec![0x12, 0x34]);
        assert_eq!(OptionValue::UInt(0x010000).to_bytes(), vec![0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_accepts_leading_zeros() {
        let value = OptionValue::decode(CoapOption::ContentFormat, &[0x00, 0x32]).unwrap();
        assert_eq!(value, OptionValue::UInt(50));
    }

    #[test]
    fn test_length_bounds() {
        let err = OptionValue::decode(CoapOption::ETag, &[]).unwrap_err();
        assert!(matches!(err, OptionError::Length { min: 1, max: 8, .. }));
        let err = OptionValue::decode(CoapOption::Observe, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, OptionError::Length { length: 4, .. }));
        let err = OptionValue::UInt(0x0100_0000)
            .validate_for(CoapOption::Observe)
            .unwrap_err();
        assert!(matches!(err, OptionError::Length { .. }));
    }

    #[test]
    fn test_default_value_rejected() {
        assert_eq!(
            OptionValue::UInt(60).validate_for(CoapOption::MaxAge),
            Err(OptionError::DefaultValue(CoapOption::MaxAge))
        );
        assert_eq!(
            OptionValue::decode(CoapOption::UriPort, &[0x16, 0x33]),
            Err(OptionError::DefaultValue(CoapOption::UriPort))
        );
        assert!(OptionValue::UInt(61).validate_for(CoapOption::MaxAge).is_ok());
    }

    #[test]
    fn test_invalid_utf8() {
        assert_eq!(
            OptionValue::decode(CoapOption::UriPath, &[0xff, 0xfe]),
            Err(OptionError::InvalidEncoding(CoapOption::UriPath))
        );
    }

    #[test]
    fn test_wrong_format() {
        let err = OptionValue::String("x".into())
            .validate_for(CoapOption::ContentFormat)
            .unwrap_err();
        assert_eq!(
            err,
            OptionError::WrongFormat {
                option: CoapOption::ContentFormat,
                expected: OptionFormat::UInt,
            }
        );
    }

    #[test]
    fn test_reserved_block_size() {
        assert_eq!(
            OptionValue::decode(CoapOption::Block2, &[0x17]),
            Err(OptionError::InvalidBlock(CoapOption::Block2))
        );
    }

    #[test]
    fn test_unknown_option() {
        assert_eq!(
            OptionValue::decode(CoapOption::Unknown(9), &[1]),
            Err(OptionError::Unrecognized(9))
        );
    }
}
