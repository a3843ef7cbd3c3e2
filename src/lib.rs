//! A file-backed, segmented Write-Ahead Log (WAL) with tags.
//!
//! `twal` stores opaque byte records on disk as a directory of numbered
//! segment files. Records are snappy-compressed and CRC-checked, segments
//! carry a trailer that distinguishes clean shutdowns from crashes, and
//! named **tags** bookmark positions in the stream so a consumer can resume
//! from its last commit point after a restart.
//!
//! # Features
//!
//! - **Segmented** – when the active segment would exceed
//!   [`WriteOptions::segment_size`] a new file is created automatically
//!   (rotation), and segments beyond [`WriteOptions::max_segments`] are
//!   pruned from disk.
//! - **Crash-aware** – every record carries a CRC-32; a 34-byte closing
//!   trailer marks segments that were shut down in an orderly fashion.
//! - **Taggable** – [`WalWriter::write_tag`] drops a named bookmark into the
//!   stream; [`WalReader::seek_tag`] and [`begin_recovery`] find the most
//!   recent one, across segments, without trusting any cached state.
//! - **Tailable** – [`new_pair`] couples a reader and a writer so a consumer
//!   can block until the producer appends more records.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use twal::{begin_recovery, WalWriter, WriteOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), twal::WalError> {
//!     // 1. Create (or reopen) the log. Reopening continues the highest
//!     //    existing segment.
//!     let mut wal = WalWriter::new_with_options(
//!         "./wal_data",
//!         WriteOptions::default(), // 16 MiB segments, 10 kept, sync-per-write
//!     )
//!     .await?;
//!
//!     // 2. Append records and mark a commit point.
//!     wal.write(b"some bytes").await?;
//!     wal.write_tag(b"commit").await?;
//!     wal.write(b"bytes written after the commit").await?;
//!     wal.close().await?;
//!
//!     // 3. Replay everything since the last commit point.
//!     let mut reader = begin_recovery("./wal_data", b"commit")?;
//!     while reader.next() {
//!         println!("replaying {} bytes", reader.value().len());
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Tailing a live log
//!
//! [`new_pair`] returns a [`PairedReader`] and [`PairedWriter`] sharing one
//! log directory. [`PairedReader::blocking_next`] suspends until the writer
//! appends, and closing the writer wakes any blocked reader with
//! [`WalError::NoData`].


mod pair;
mod reader;
mod record;
mod recover;
mod segment;
mod types;
pub mod wal;
mod writer;

pub use pair::{PairedReader, PairedWriter, new_pair};
pub use reader::SegmentReader;
pub use recover::begin_recovery;
pub use types::{MAX_SEGMENT_SIZE, Position, WalError, WriteOptions};
pub use wal::{WalReader, WalWriter};
pub use writer::SegmentWriter;
