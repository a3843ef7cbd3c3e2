//! Crash-recovery entry point.

use crate::types::WalError;
use crate::wal::WalReader;
use std::path::PathBuf;

/// Open a reader positioned just after the most recent `tag` record, so
/// iteration replays exactly the records that were not yet covered by the
/// last committed bookmark. When the tag was never written the reader is
/// reset to the very beginning and replays everything.
pub fn begin_recovery(root: impl Into<PathBuf>, tag: &[u8]) -> Result<WalReader, WalError> {
    let mut reader = WalReader::new(root)?;

    let pos = reader.seek_tag(tag)?;

    if pos.is_none() {
        reader.reset()?;
    }

    Ok(reader)
}
