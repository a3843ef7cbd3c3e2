//! Segment file naming and discovery.
//!
//! Segment files live directly in the log's root directory and are named by
//! their decimal index: `0`, `1`, `2`, ... with no padding. Anything that
//! does not parse as a non-negative integer (such as the `tags` cache file)
//! is ignored during discovery.

use crate::types::WalError;
use std::path::{Path, PathBuf};

/// Name of the tag cache file kept alongside the segments.
pub(crate) const TAGS_FILE: &str = "tags";

pub(crate) fn segment_path(root: &Path, index: i64) -> PathBuf {
    root.join(index.to_string())
}

/// Scan `root` and return the lowest and highest segment index present, or
/// `None` when the directory holds no segment files.
pub(crate) fn range_segments(root: &Path) -> Result<Option<(i64, i64)>, WalError> {
    let mut range: Option<(i64, i64)> = None;

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Ok(index) = name.parse::<u64>() else {
            continue;
        };
        let Ok(index) = i64::try_from(index) else {
            continue;
        };

        range = Some(match range {
            None => (index, index),
            Some((first, last)) => (first.min(index), last.max(index)),
        });
    }

    Ok(range)
}
