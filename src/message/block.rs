use std::fmt;

use crate::message::option::{CoapOption, OptionError};

/// Largest size exponent with a defined block size (1024 bytes).
pub const MAX_SIZE_EXPONENT: u8 = 6;

/// Decoded value of a Block1 or Block2 option (RFC 7959 §2.2).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct BlockValue {
    pub num: u32,
    pub more: bool,
    pub size_exponent: u8,
}

impl BlockValue {
    pub fn new(num: u32, more: bool, size_exponent: u8) -> Result<Self, OptionError> {
        if size_exponent > MAX_SIZE_EXPONENT || num >= 1 << 20 {
            return Err(OptionError::InvalidBlock(CoapOption::Block2));
        }
        Ok(Self {
            num,
            more,
            size_exponent,
        })
    }

    /// Largest size exponent whose block size does not exceed `size`.
    pub fn exponent_for_size(size: usize) -> Option<u8> {
        if size < 16 {
            return None;
        }
        let power = usize::BITS - 1 - size.leading_zeros();
        let exponent = power.saturating_sub(4).min(u32::from(MAX_SIZE_EXPONENT));
        u8::try_from(exponent).ok()
    }

    pub fn size_for_exponent(size_exponent: u8) -> usize {
        1 << (usize::from(size_exponent) + 4)
    }

    pub fn size(&self) -> usize {
        Self::size_for_exponent(self.size_exponent)
    }

    /// Position of the first byte of this block within the full body.
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }
}

impl From<BlockValue> for u32 {
    fn from(block: BlockValue) -> u32 {
        block.num << 4 | u32::from(block.more) << 3 | u32::from(block.size_exponent & 0x7)
    }
}

impl TryFrom<u32> for BlockValue {
    type Error = OptionError;

    fn try_from(scalar: u32) -> Result<Self, Self::Error> {
        let size_exponent = (scalar & 0x7) as u8;
        if size_exponent == 0x7 || scalar >= 1 << 24 {
            return Err(OptionError::InvalidBlock(CoapOption::Block2));
        }
        Ok(Self {
            num: scalar >> 4,
            more: scalar >> 3 & 0x1 == 0x1,
            size_exponent,
        })
    }
}

impl fmt::Display for BlockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let more = if self.more { "+" } else { "" };
        write!(f, "{}{}/{}", self.num, more, self.size())
    }
}
