use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalError {
    /// A record's framed CRC did not match its contents.
    #[error("corrupt data detected")]
    CorruptCrc,
    /// Clean end of a segment at a record boundary.
    #[error("end of segment")]
    Eof,
    /// A segment ended in the middle of a record.
    #[error("unexpected end of segment")]
    UnexpectedEof,
    /// A record header could not be interpreted.
    #[error("invalid record framing: {0}")]
    InvalidFrame(&'static str),
    /// The log directory contains no segment files.
    #[error("no segments")]
    NoSegments,
    /// A blocking read found nothing to return.
    #[error("no data available")]
    NoData,
    #[error("compression error: {0}")]
    Compression(#[from] snap::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WalError {
    /// Whether this error means "the segment has no more complete records"
    /// rather than a real failure. A closed segment's trailing magic always
    /// reads as a torn record, so both EOF flavors qualify.
    pub(crate) fn is_end_of_segment(&self) -> bool {
        matches!(self, WalError::Eof | WalError::UnexpectedEof)
    }
}

/// A position within the log, combining a segment index with a byte offset
/// local to that segment. The offset names where a record begins, so seeking
/// to a position and iterating yields the records from that point on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub segment: i64,
    pub offset: i64,
}

impl Position {
    pub fn new(segment: i64, offset: i64) -> Self {
        Self { segment, offset }
    }

    /// The sentinel returned when a lookup finds nothing.
    pub const fn none() -> Self {
        Self {
            segment: -1,
            offset: -1,
        }
    }

    pub fn is_none(&self) -> bool {
        self.segment == -1
    }
}

/// Default size of a single segment file: 16 MiB.
pub const MAX_SEGMENT_SIZE: i64 = 16 * 1024 * 1024;

/// Configuration for a [`WalWriter`](crate::WalWriter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// The maximum size in bytes of each segment. When the active segment
    /// reaches near this size, a new segment is created.
    pub segment_size: i64,

    /// The maximum number of segments to keep on disk.
    pub max_segments: i64,

    /// If `None`, data is synced after every write. Otherwise this controls
    /// how often the log is synced to disk. Setting an interval speeds up
    /// the log by sacrificing safety.
    pub sync_rate: Option<Duration>,
}

impl Default for WriteOptions {
    /// Defaults to using 160 MB of disk: ten 16 MiB segments, synced on
    /// every write.
    fn default() -> Self {
        Self {
            segment_size: MAX_SEGMENT_SIZE,
            max_segments: 10,
            sync_rate: None,
        }
    }
}

impl WriteOptions {
    /// Derive `segment_size` and `max_segments` from how much disk space the
    /// log should consume in total. The true on-disk size might be slightly
    /// more than this because the value is calculated against
    /// [`MAX_SEGMENT_SIZE`]. For a larger (or more precise) segment size,
    /// set `segment_size` and `max_segments` directly.
    pub fn calculate_from_total(&mut self, total: i64) {
        if self.max_segments == 0 {
            if total < MAX_SEGMENT_SIZE {
                self.max_segments = 1;
                self.segment_size = total;
            } else {
                self.segment_size = MAX_SEGMENT_SIZE;

                let mut segments = total / self.segment_size;

                // Round up, not down.
                if total % self.segment_size != 0 {
                    segments += 1;
                }

                self.max_segments = segments;
            }
        } else {
            self.segment_size = total / self.max_segments;
        }
    }
}
