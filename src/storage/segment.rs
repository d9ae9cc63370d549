//! Segment lifecycle state and the summary stats shared by the writer,
//! compactor, and query executor.

use crate::core::timestamp::Timestamp;

/// Where a segment sits in its lifecycle.
///
/// A partition's active segment is the only one producers may append to;
/// everything else is immutable. `Compacted` segments have been rewritten by
/// the background compactor into a smaller, block-compressed replacement —
/// the original is deleted once the replacement is verified, so this state
/// is transient and mostly useful for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Active,
    Sealed,
    Compacted,
}

/// Cheap summary of a segment's contents, as returned by `Stat()` without decoding any frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStats {
    pub first_ts: Timestamp,
    pub last_ts: Timestamp,
    pub count: u64,
    pub raw_size: u64,
    pub file_size: u64,
    pub codec: super::segment_file::SegmentCodec,
    /// Set when the segment's footer or a frame failed validation; the
    /// query executor returns partial results and reports a quarantine
    /// warning rather than failing the whole query.
    pub quarantined: bool,
}

impl SegmentStats {
    /// Lifecycle state implied by this snapshot. A segment only has
    /// `SegmentStats` once it's sealed (the active segment is tracked by the
    /// writer, not by a stats struct), so this is only ever `Sealed` (raw,
    /// not yet rewritten) or `Compacted` (rewritten by the background
    /// compactor into block-compressed form).
    pub fn state(&self) -> SegmentState {
        match self.codec {
            super::segment_file::SegmentCodec::Raw => SegmentState::Sealed,
            super::segment_file::SegmentCodec::Zstd => SegmentState::Compacted,
        }
    }
}
