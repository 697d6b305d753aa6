//! Position in the replicated log.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(segment_id, record_count)` logical clock.
///
/// Versions are ordered lexicographically. Applying a mutation advances
/// `record_count` by one; rotating the changelog moves to the next segment
/// and resets `record_count` to zero.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MetaVersion {
    pub segment_id: u32,
    pub record_count: u32,
}

impl MetaVersion {
    #[must_use]
    pub const fn new(segment_id: u32, record_count: u32) -> Self {
        Self {
            segment_id,
            record_count,
        }
    }

    /// The version after one more record in the same segment.
    #[must_use]
    pub const fn advance(self) -> Self {
        Self::new(self.segment_id, self.record_count + 1)
    }

    /// The version after `count` more records in the same segment.
    #[must_use]
    pub const fn advance_by(self, count: u32) -> Self {
        Self::new(self.segment_id, self.record_count + count)
    }

    /// The first version of the next segment.
    #[must_use]
    pub const fn rotate(self) -> Self {
        Self::new(self.segment_id + 1, 0)
    }

    /// Packed form: segment in the high half, record count in the low half.
    #[must_use]
    pub const fn to_revision(self) -> u64 {
        ((self.segment_id as u64) << 32) | self.record_count as u64
    }

    #[must_use]
    pub const fn from_revision(revision: u64) -> Self {
        Self::new((revision >> 32) as u32, (revision & 0xffff_ffff) as u32)
    }
}

impl fmt::Display for MetaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.record_count)
    }
}
