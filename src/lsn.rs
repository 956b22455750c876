//! Log sequence numbers.
//!
//! PostgreSQL renders an LSN as `segment/offset` with both halves in hex,
//! e.g. `0/1949850` or `2F/AB060628`. Internally the position is a single
//! 64-bit value (upper 32 bits segment, lower 32 offset), which gives total
//! ordering for free and round-trips to the textual form without loss.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MirrorError;

/// A position in the source's write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(u64);

impl Lsn {
    /// The invalid/zero position (`0/0`). Used as "nothing confirmed yet".
    pub const ZERO: Lsn = Lsn(0);

    pub fn from_parts(segment: u32, offset: u32) -> Self {
        Lsn(((segment as u64) << 32) | offset as u64)
    }

    pub fn from_u64(raw: u64) -> Self {
        Lsn(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn segment(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn offset(self) -> u32 {
        self.0 as u32
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The position immediately before this one; saturates at zero.
    pub fn prev(self) -> Lsn {
        Lsn(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.segment(), self.offset())
    }
}

impl FromStr for Lsn {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seg, off) = s
            .split_once('/')
            .ok_or_else(|| MirrorError::Decode(format!("invalid lsn '{s}': missing '/'")))?;
        let segment = u32::from_str_radix(seg, 16)
            .map_err(|e| MirrorError::Decode(format!("invalid lsn segment '{seg}': {e}")))?;
        let offset = u32::from_str_radix(off, 16)
            .map_err(|e| MirrorError::Decode(format!("invalid lsn offset '{off}': {e}")))?;
        Ok(Lsn::from_parts(segment, offset))
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
