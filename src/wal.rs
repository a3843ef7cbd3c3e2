//! The multi-segment log: a directory of numbered segment files plus a tag
//! cache, with size-based rotation and retention-based pruning on the write
//! side and chained cross-segment iteration on the read side.

use crate::reader::SegmentReader;
use crate::segment::{TAGS_FILE, range_segments, segment_path};
use crate::types::{Position, WalError, WriteOptions};
use crate::writer::SegmentWriter;
use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Estimated framing overhead used by the rotation predicate:
/// 4 CRC bytes, 1 type byte, and a 2-byte length varint.
const RECORD_OVERHEAD: i64 = 4 + 1 + 2;

/// On-disk layout of the `tags` cache file: one JSON object mapping
/// base64url-encoded tags to the position of their tag record.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct TagCache {
    pub(crate) tags: HashMap<String, Position>,
}

/// Appends records to a directory of numbered segments.
///
/// Opening a directory continues its highest existing segment. Writes rotate
/// to a fresh segment when the active one would grow past
/// [`WriteOptions::segment_size`], and rotation prunes segments older than
/// the retention cap. The writer is single-producer by construction; to
/// share it with a tailing reader, couple the two with
/// [`new_pair`](crate::new_pair).
pub struct WalWriter {
    root: PathBuf,
    opts: WriteOptions,

    first: i64,
    index: i64,

    segment: SegmentWriter,

    cache: TagCache,
    cache_file: File,
}

impl WalWriter {
    /// Open `root` with [`WriteOptions::default`].
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, WalError> {
        Self::new_with_options(root, WriteOptions::default()).await
    }

    pub async fn new_with_options(
        root: impl Into<PathBuf>,
        opts: WriteOptions,
    ) -> Result<Self, WalError> {
        let root = root.into();

        if !root.exists() {
            tokio::fs::create_dir_all(&root).await?;
            info!("created WAL dir {root:?}");
        }

        let (first, last) = range_segments(&root)?.unwrap_or((0, 0));

        // The cache is rebuilt from scratch every run; readers never trust
        // it across restarts and always fall back to scanning.
        let cache_file = File::create(root.join(TAGS_FILE)).await?;

        let mut segment = SegmentWriter::open(segment_path(&root, last)).await?;

        if let Some(rate) = opts.sync_rate {
            segment.set_sync_rate(rate).await?;
        }

        Ok(Self {
            root,
            opts,
            first,
            index: last,
            segment,
            cache: TagCache::default(),
            cache_file,
        })
    }

    pub fn options(&self) -> &WriteOptions {
        &self.opts
    }

    /// Append one data record.
    ///
    /// If the record would push the active segment past the configured size,
    /// the segment is rotated first, so the overflowing record becomes the
    /// first record of the new segment.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), WalError> {
        let projected = data.len() as i64 + RECORD_OVERHEAD + self.segment.size();

        if projected > self.opts.segment_size {
            self.rotate_segment().await?;
            self.prune_segments(self.opts.max_segments).await?;
        }

        self.segment.write(data).await?;
        Ok(())
    }

    /// Close the active segment and open the next index.
    pub(crate) async fn rotate_segment(&mut self) -> Result<(), WalError> {
        self.segment.close().await?;

        self.index += 1;

        let mut segment = SegmentWriter::open(segment_path(&self.root, self.index)).await?;

        if let Some(rate) = self.opts.sync_rate {
            segment.set_sync_rate(rate).await?;
        }

        info!(
            "WAL rotation: segment {} -> {}",
            self.index - 1,
            self.index
        );

        self.segment = segment;

        Ok(())
    }

    /// Remove segments older than the newest `keep`. Already-absent files
    /// are fine; anything else surfaces.
    pub(crate) async fn prune_segments(&mut self, keep: i64) -> Result<(), WalError> {
        let mut i = self.index - keep;

        while i >= self.first {
            let path = segment_path(&self.root, i);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!("pruned WAL segment {path:?}"),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("WAL segment {path:?} already pruned");
                }
                Err(err) => return Err(err.into()),
            }
            i -= 1;
        }

        Ok(())
    }

    /// Where the next record will land: the active segment index and the
    /// byte offset inside it.
    pub fn pos(&self) -> Position {
        Position::new(self.index, self.segment.pos())
    }

    /// Append a tag record marking the current position, and refresh the
    /// on-disk tag cache.
    ///
    /// The cache file is truncated before the tag record goes down, so a
    /// crash in between leaves the cache absent rather than stale. Cache
    /// maintenance failures are logged and swallowed; the tag record in the
    /// segment is the authoritative copy and readers can always find it by
    /// scanning.
    pub async fn write_tag(&mut self, tag: &[u8]) -> Result<(), WalError> {
        let truncated = self.rewind_cache_file().await;

        let seg_pos = self.segment.pos();

        self.segment.write_tag(tag).await?;

        match truncated {
            Ok(()) => {
                let key = URL_SAFE.encode(tag);
                self.cache
                    .tags
                    .insert(key, Position::new(self.index, seg_pos));

                if let Err(err) = self.flush_cache().await {
                    warn!("failed to persist tag cache: {err}");
                }
            }
            Err(err) => warn!("failed to truncate tag cache: {err}"),
        }

        Ok(())
    }

    async fn rewind_cache_file(&mut self) -> Result<(), std::io::Error> {
        self.cache_file.set_len(0).await?;
        self.cache_file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    async fn flush_cache(&mut self) -> Result<(), WalError> {
        let encoded = serde_json::to_vec(&self.cache)
            .map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err))?;

        self.cache_file.write_all(&encoded).await?;
        self.cache_file.flush().await?;
        self.cache_file.sync_data().await?;

        Ok(())
    }

    /// Close the active segment, appending its clean-shutdown trailer.
    pub async fn close(&mut self) -> Result<(), WalError> {
        self.segment.close().await
    }
}

/// Iterates a log directory across all of its segments.
///
/// The `[first, last]` segment range is captured when the reader is opened
/// (or [`reset`](WalReader::reset)); records are yielded in segment order,
/// with tag records skipped. The last segment is held open at EOF so a
/// coupled live writer can be tailed.
pub struct WalReader {
    root: PathBuf,

    first: i64,
    last: i64,
    index: i64,

    seg: Option<SegmentReader>,

    /// Final offset of the previous segment, reported by
    /// [`pos`](WalReader::pos) while between segments.
    last_seg_pos: i64,

    err: Option<WalError>,
}

impl WalReader {
    /// Open a reader positioned at the start of the oldest segment. Fails
    /// with [`WalError::NoSegments`] when the directory has none.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, WalError> {
        let mut reader = Self {
            root: root.into(),
            first: 0,
            last: 0,
            index: 0,
            seg: None,
            last_seg_pos: 0,
            err: None,
        };

        reader.reset()?;

        Ok(reader)
    }

    /// Re-scan the directory and reposition at the start of the oldest
    /// segment.
    pub fn reset(&mut self) -> Result<(), WalError> {
        self.seg = None;
        self.err = None;
        self.last_seg_pos = 0;

        let (first, last) = range_segments(&self.root)?.ok_or(WalError::NoSegments)?;

        let seg = SegmentReader::open(segment_path(&self.root, first))?;

        self.first = first;
        self.last = last;
        self.index = first;
        self.seg = Some(seg);

        Ok(())
    }

    /// Advance to the next data record, crossing segment boundaries as
    /// needed. Returns false at the end of the log or on a fatal error.
    pub fn next(&mut self) -> bool {
        loop {
            if let Some(seg) = self.seg.as_mut() {
                if seg.next() {
                    return true;
                }

                if seg.error().is_some_and(|err| !err.is_end_of_segment()) {
                    return false;
                }

                if self.index >= self.last {
                    // The active segment: stay on it so records appended by
                    // a live writer show up on a later call.
                    return false;
                }

                self.last_seg_pos = seg.pos();
                self.seg = None;
            } else {
                self.index += 1;

                if self.index > self.last {
                    // Clamp so pos() reports the final segment rather than
                    // one past it.
                    self.index = self.last;
                    return false;
                }

                match SegmentReader::open(segment_path(&self.root, self.index)) {
                    Ok(seg) => self.seg = Some(seg),
                    Err(err) => {
                        self.err = Some(err);
                        return false;
                    }
                }
            }
        }
    }

    /// Reposition to a previously captured position.
    pub fn seek(&mut self, pos: Position) -> Result<(), WalError> {
        let mut seg = SegmentReader::open(segment_path(&self.root, pos.segment))?;

        seg.seek(pos.offset)?;

        self.index = pos.segment;
        self.seg = Some(seg);
        self.err = None;

        Ok(())
    }

    /// Search every segment for the last record tagged exactly `tag`.
    ///
    /// On a hit the reader is repositioned at the tag, so iterating yields
    /// exactly the records written after it; the tag's position is
    /// returned. Otherwise returns [`Position::none`] and leaves the reader
    /// untouched.
    pub fn seek_tag(&mut self, tag: &[u8]) -> Result<Position, WalError> {
        let mut found = Position::none();

        let mut index = self.first;

        loop {
            let mut seg = match SegmentReader::open(segment_path(&self.root, index)) {
                Ok(seg) => seg,
                Err(WalError::Io(err)) if err.kind() == ErrorKind::NotFound => break,
                Err(err) => return Err(err),
            };

            let pos = seg.seek_tag(tag)?;

            if pos >= 0 {
                found = Position::new(index, pos);
            }

            index += 1;
        }

        if !found.is_none() {
            self.seek(found)?;
        }

        Ok(found)
    }

    /// The position of the next unread record.
    pub fn pos(&self) -> Position {
        match &self.seg {
            Some(seg) => Position::new(self.index, seg.pos()),
            None => Position::new(self.index, self.last_seg_pos),
        }
    }

    /// The most recently read data payload.
    pub fn value(&self) -> &[u8] {
        match &self.seg {
            Some(seg) => seg.value(),
            None => &[],
        }
    }

    /// The fatal error that halted iteration, if any. Plain end-of-log is
    /// not an error and is not reported here.
    pub fn error(&self) -> Option<&WalError> {
        if let Some(err) = &self.err {
            return Some(err);
        }

        self.seg
            .as_ref()
            .and_then(SegmentReader::error)
            .filter(|err| !err.is_end_of_segment())
    }
}
