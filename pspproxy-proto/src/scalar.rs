//! Width-tagged scalar values for register-style accesses.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Access width of a scalar read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Width {
    /// One byte.
    U8 = 1,
    /// Two bytes.
    U16 = 2,
    /// Four bytes.
    U32 = 4,
    /// Eight bytes.
    U64 = 8,
}

impl Width {
    /// Every supported width, narrowest first.
    pub const ALL: [Self; 4] = [Self::U8, Self::U16, Self::U32, Self::U64];

    /// Size of the access in bytes.
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Largest value representable at this width.
    pub const fn max_value(self) -> u64 {
        match self {
            Self::U8 => u8::MAX as u64,
            Self::U16 => u16::MAX as u64,
            Self::U32 => u32::MAX as u64,
            Self::U64 => u64::MAX,
        }
    }
}

impl TryFrom<usize> for Width {
    type Error = Error;

    fn try_from(bytes: usize) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|w| w.bytes() == bytes)
            .ok_or(Error::InvalidWidth(bytes))
    }
}

impl TryFrom<u8> for Width {
    type Error = Error;

    fn try_from(bytes: u8) -> Result<Self, Self::Error> {
        Self::try_from(usize::from(bytes))
    }
}

impl TryFrom<u32> for Width {
    type Error = Error;

    fn try_from(bytes: u32) -> Result<Self, Self::Error> {
        usize::try_from(bytes)
            .map_err(|_| Error::InvalidWidth(usize::MAX))
            .and_then(Self::try_from)
    }
}

impl From<Width> for u8 {
    fn from(w: Width) -> Self {
        w as Self
    }
}

/// A value paired with the width it is accessed at.
///
/// On the wire a scalar is its little-endian bytes, so the encoded length
/// carries the width. Decoding rejects any length other than 1, 2, 4 or 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Scalar {
    /// Access width.
    width: Width,
    /// Value, always within `width.max_value()`.
    value: u64,
}

impl Scalar {
    /// Pairs `value` with `width`, or `None` if it does not fit.
    pub const fn new(width: Width, value: u64) -> Option<Self> {
        if value > width.max_value() {
            return None;
        }
        Some(Self { width, value })
    }

    /// Pairs `value` with `width`, dropping high bits that do not fit.
    pub const fn truncate(width: Width, value: u64) -> Self {
        Self {
            width,
            value: value & width.max_value(),
        }
    }

    /// Parses a little-endian byte string whose length selects the width.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let width = Width::try_from(bytes.len())?;
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            width,
            value: u64::from_le_bytes(raw),
        })
    }

    /// Little-endian bytes, exactly `width.bytes()` long.
    pub fn to_le_bytes(self) -> Vec<u8> {
        self.value.to_le_bytes()[..self.width.bytes()].to_vec()
    }

    /// Access width.
    pub const fn width(self) -> Width {
        self.width
    }

    /// The value, zero-extended.
    pub const fn value(self) -> u64 {
        self.value
    }
}

impl TryFrom<Vec<u8>> for Scalar {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        Self::from_le_bytes(&bytes)
    }
}

impl From<Scalar> for Vec<u8> {
    fn from(s: Scalar) -> Self {
        s.to_le_bytes()
    }
}
