//! Single-segment append path.

use crate::record::{self, CLOSING_MAGIC, DATA_TYPE, TAG_TYPE};
use crate::types::WalError;
use log::warn;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Appends framed records to one segment file.
///
/// The file is opened in read/write mode (never append mode) so that the
/// clean-close trailer of a previous run can be detected and overwritten,
/// keeping records contiguous across re-opens. The logical size counts only
/// record bytes and doubles as the offset of the next write, which is what
/// [`pos`](SegmentWriter::pos) reports and what a reader seeks to.
pub struct SegmentWriter {
    file: File,
    encoder: snap::raw::Encoder,
    /// Shared with the background sync task, which polls it to decide
    /// whether anything new needs an fsync.
    size: Arc<AtomicI64>,
    clean: bool,
    sync: Option<SyncTask>,
}

struct SyncTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SegmentWriter {
    /// Open (or create) the segment at `path` for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())
            .await?;

        let (clean, size) = calculate_clean(&mut file).await?;

        Ok(Self {
            file,
            encoder: snap::raw::Encoder::new(),
            size: Arc::new(AtomicI64::new(size)),
            clean,
            sync: None,
        })
    }

    /// Append a data record. Returns the number of input bytes accepted.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, WalError> {
        self.write_record(DATA_TYPE, data).await
    }

    /// Append a tag record.
    pub async fn write_tag(&mut self, tag: &[u8]) -> Result<(), WalError> {
        self.write_record(TAG_TYPE, tag).await.map(|_| ())
    }

    async fn write_record(&mut self, kind: u8, data: &[u8]) -> Result<usize, WalError> {
        let frame = record::encode_record(&mut self.encoder, kind, data)?;

        // One write_all per record so a torn write leaves at most one
        // partial frame at the tail.
        self.file.write_all(&frame).await?;
        self.file.flush().await?;

        if self.sync.is_none() {
            self.file.sync_data().await?;
        }

        self.size.fetch_add(frame.len() as i64, Ordering::Relaxed);

        Ok(data.len())
    }

    /// Logical size of the segment: the sum of all record frames written,
    /// excluding any closing trailer.
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Relaxed)
    }

    /// The byte offset at which the next record will be written. Seeking a
    /// reader here yields exactly the records that follow.
    pub fn pos(&self) -> i64 {
        self.size()
    }

    /// Cut the segment back to `pos` bytes, discarding anything written
    /// after a position captured with [`pos`](SegmentWriter::pos).
    pub async fn truncate(&mut self, pos: i64) -> Result<(), WalError> {
        self.file.set_len(pos as u64).await?;
        self.file.seek(SeekFrom::Start(pos as u64)).await?;
        self.size.store(pos, Ordering::Relaxed);
        Ok(())
    }

    /// Whether the previous writer of this file shut down cleanly.
    pub fn clean(&self) -> bool {
        self.clean
    }

    /// Switch from sync-per-write to a background task that syncs every
    /// `rate`, and only when new records actually arrived since its last
    /// look.
    pub async fn set_sync_rate(&mut self, rate: Duration) -> Result<(), WalError> {
        let file = self.file.try_clone().await?;
        let size = Arc::clone(&self.size);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut tick = time::interval(rate);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut before = size.load(Ordering::Relaxed);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let current = size.load(Ordering::Relaxed);

                        if current != before {
                            if let Err(err) = file.sync_data().await {
                                warn!("background segment sync failed: {err}");
                            }
                        }

                        before = current;
                    }
                    _ = shutdown_rx.changed() => {
                        if let Err(err) = file.sync_data().await {
                            warn!("final segment sync failed: {err}");
                        }
                        return;
                    }
                }
            }
        });

        self.sync = Some(SyncTask {
            shutdown: shutdown_tx,
            handle,
        });

        Ok(())
    }

    /// Stop the background sync (after its final fsync) and append the
    /// closing trailer. The file handle itself is released on drop, even
    /// when the trailer write fails.
    pub async fn close(&mut self) -> Result<(), WalError> {
        if let Some(task) = self.sync.take() {
            let _ = task.shutdown.send(true);
            if let Err(err) = task.handle.await {
                warn!("background segment sync task failed to join: {err}");
            }
        }

        self.file.write_all(&CLOSING_MAGIC).await?;
        self.file.flush().await?;

        Ok(())
    }
}

/// Inspect the tail of the file for the closing trailer.
///
/// Returns the clean flag and the starting logical size, leaving the file
/// cursor where the next write belongs: over the trailer when the segment
/// was closed properly, at EOF when it was not, and at zero when the file is
/// empty or too short to hold a trailer at all.
async fn calculate_clean(file: &mut File) -> Result<(bool, i64), WalError> {
    let disk_size = file.metadata().await?.len() as i64;
    let magic_len = CLOSING_MAGIC.len() as i64;

    if disk_size == 0 {
        return Ok((false, 0));
    }

    if disk_size < magic_len {
        // Too short for a trailer; overwrite the partial tail.
        file.seek(SeekFrom::Start(0)).await?;
        return Ok((false, 0));
    }

    file.seek(SeekFrom::End(-magic_len)).await?;

    let mut tail = [0u8; CLOSING_MAGIC.len()];
    if file.read_exact(&mut tail).await.is_err() {
        file.seek(SeekFrom::End(0)).await?;
        return Ok((false, disk_size));
    }

    if tail == CLOSING_MAGIC {
        // Seek back so the next write overwrites the trailer.
        file.seek(SeekFrom::End(-magic_len)).await?;
        Ok((true, disk_size - magic_len))
    } else {
        Ok((false, disk_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::SegmentReader;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_grows_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment");

        let mut segment = SegmentWriter::open(&path).await.unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        let accepted = segment.write(b"test data").await.unwrap();
        let after = std::fs::metadata(&path).unwrap().len();

        assert_eq!(accepted, 9);
        assert!(after > before);
        assert_eq!(segment.size(), after as i64);
    }

    #[tokio::test]
    async fn truncate_discards_later_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment");

        let mut segment = SegmentWriter::open(&path).await.unwrap();

        segment.write(b"test data").await.unwrap();
        let pos = segment.pos();

        segment.write(b"bad data").await.unwrap();
        segment.truncate(pos).await.unwrap();
        segment.close().await.unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(reader.next());
        assert_eq!(reader.value(), b"test data");
        assert!(!reader.next());
    }

    #[tokio::test]
    async fn clean_flag_tracks_orderly_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment");

        let mut segment = SegmentWriter::open(&path).await.unwrap();
        segment.write(b"test data").await.unwrap();

        // Still open: a second look at the file sees a dirty segment.
        let observer = SegmentWriter::open(&path).await.unwrap();
        assert!(!observer.clean());
        drop(observer);

        segment.close().await.unwrap();

        let observer = SegmentWriter::open(&path).await.unwrap();
        assert!(observer.clean());
    }

    #[tokio::test]
    async fn reopen_overwrites_the_trailer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment");

        let mut segment = SegmentWriter::open(&path).await.unwrap();
        segment.write(b"first data").await.unwrap();
        let pos_at_close = segment.pos();
        segment.close().await.unwrap();

        let mut segment = SegmentWriter::open(&path).await.unwrap();
        assert_eq!(segment.pos(), pos_at_close);
        segment.write(b"more data").await.unwrap();
        segment.close().await.unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(reader.next());
        assert_eq!(reader.value(), b"first data");
        assert!(reader.next());
        assert_eq!(reader.value(), b"more data");
        assert!(!reader.next());
    }

    #[tokio::test]
    async fn empty_file_is_dirty_at_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment");

        let segment = SegmentWriter::open(&path).await.unwrap();
        assert!(!segment.clean());
        assert_eq!(segment.size(), 0);
    }

    #[tokio::test]
    async fn short_junk_file_is_overwritten_from_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment");
        std::fs::write(&path, b"stub").unwrap();

        let mut segment = SegmentWriter::open(&path).await.unwrap();
        assert!(!segment.clean());
        assert_eq!(segment.size(), 0);

        segment.write(b"real data").await.unwrap();
        segment.close().await.unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(reader.next());
        assert_eq!(reader.value(), b"real data");
    }

    #[tokio::test]
    async fn background_sync_covers_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment");

        let mut segment = SegmentWriter::open(&path).await.unwrap();
        segment
            .set_sync_rate(Duration::from_millis(5))
            .await
            .unwrap();

        segment.write(b"synced later").await.unwrap();
        time::sleep(Duration::from_millis(25)).await;

        // Close signals the task, which performs a final sync before the
        // trailer goes down.
        segment.close().await.unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(reader.next());
        assert_eq!(reader.value(), b"synced later");
    }
}
