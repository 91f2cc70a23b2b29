//! 24-bit unsigned integer carried by the Observe option as a notification sequence number.

use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

/// Notifications older than this are never compared by sequence number alone
/// (RFC 7641 §3.4).
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(128);

const MASK: u32 = 0xff_ffff;
const HALF_RANGE: u32 = 1 << 23;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
#[allow(non_camel_case_types)]
pub struct u24(u32);

impl u24 {
    pub const MIN: u24 = u24(0);
    pub const MAX: u24 = u24(MASK);
    pub const BITS: u32 = 24;

    pub fn wrapping_add(self, rhs: Self) -> Self {
        u24(self.0.wrapping_add(rhs.0) & MASK)
    }

    /// Next value in the sequence, wrapping back to zero after [`u24::MAX`].
    pub fn next(self) -> Self {
        self.wrapping_add(u24(1))
    }

    pub fn from_be_bytes(bytes: [u8; 3]) -> Self {
        u24(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    /// Whether a notification carrying `self`, received `elapsed` after the one carrying
    /// `previous`, is the fresher of the two under serial number arithmetic.
    pub fn is_fresher_than(self, previous: u24, elapsed: Duration) -> bool {
        let (v1, v2) = (previous.0, self.0);
        (v1 < v2 && v2 - v1 < HALF_RANGE)
            || (v1 > v2 && v1 - v2 > HALF_RANGE)
            || elapsed > FRESHNESS_WINDOW
    }
}

impl Display for u24 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for u24 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl From<u8> for u24 {
    fn from(value: u8) -> Self {
        u24(u32::from(value))
    }
}

impl From<u16> for u24 {
    fn from(value: u16) -> Self {
        u24(u32::from(value))
    }
}

impl TryFrom<u32> for u24 {
    type Error = TryFromCustomIntError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value > MASK {
            Err(TryFromCustomIntError)
        } else {
            Ok(u24(value))
        }
    }
}

impl From<u24> for u32 {
    fn from(value: u24) -> Self {
        value.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TryFromCustomIntError;

impl Display for TryFromCustomIntError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("value does not fit in 24 bits")
    }
}

impl std::error::Error for TryFromCustomIntError {}
