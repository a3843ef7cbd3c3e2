//! A coupled reader/writer over one log directory.
//!
//! The two sides share a single coordination object: a mutex that serializes
//! their file I/O against each other, and a watch channel carrying the
//! writer's generation counter. Every successful write bumps the generation,
//! which is what lets the reader block until there is something new instead
//! of polling.

use crate::types::{WalError, WriteOptions};
use crate::wal::{WalReader, WalWriter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

struct PairShared {
    /// Serializes the paired reader and writer against each other on the
    /// underlying files.
    io: Mutex<()>,
    gen_tx: watch::Sender<u64>,
}

/// The producing half of a pair. Owns the [`WalWriter`].
pub struct PairedWriter {
    wal: WalWriter,
    shared: Arc<PairShared>,
}

/// The consuming half of a pair. Owns the [`WalReader`] and tracks the last
/// writer generation it has observed.
pub struct PairedReader {
    reader: WalReader,
    shared: Arc<PairShared>,
    gen_rx: watch::Receiver<u64>,
    generation: u64,
}

/// Open `root` as a coupled reader/writer pair.
pub async fn new_pair(
    root: impl Into<PathBuf>,
    opts: WriteOptions,
) -> Result<(PairedReader, PairedWriter), WalError> {
    let root = root.into();

    let mut wal = WalWriter::new_with_options(&root, opts).await?;

    let reader = match WalReader::new(&root) {
        Ok(reader) => reader,
        Err(err) => {
            let _ = wal.close().await;
            return Err(err);
        }
    };

    let (gen_tx, gen_rx) = watch::channel(0);

    let shared = Arc::new(PairShared {
        io: Mutex::new(()),
        gen_tx,
    });

    Ok((
        PairedReader {
            reader,
            shared: Arc::clone(&shared),
            gen_rx,
            generation: 0,
        },
        PairedWriter { wal, shared },
    ))
}

impl PairedWriter {
    /// Append a data record and wake any blocked reader.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), WalError> {
        {
            let _io = self.shared.io.lock().await;
            self.wal.write(data).await?;
        }

        self.shared.gen_tx.send_modify(|generation| *generation += 1);

        Ok(())
    }

    /// Append a tag record and wake any blocked reader.
    pub async fn write_tag(&mut self, tag: &[u8]) -> Result<(), WalError> {
        {
            let _io = self.shared.io.lock().await;
            self.wal.write_tag(tag).await?;
        }

        self.shared.gen_tx.send_modify(|generation| *generation += 1);

        Ok(())
    }

    pub async fn pos(&self) -> crate::Position {
        let _io = self.shared.io.lock().await;
        self.wal.pos()
    }

    pub fn options(&self) -> &WriteOptions {
        self.wal.options()
    }

    /// Close the log. The generation is bumped one last time so a reader
    /// blocked in [`PairedReader::blocking_next`] wakes up and observes
    /// [`WalError::NoData`] instead of waiting forever.
    pub async fn close(&mut self) -> Result<(), WalError> {
        let result = {
            let _io = self.shared.io.lock().await;
            self.wal.close().await
        };

        self.shared.gen_tx.send_modify(|generation| *generation += 1);

        result
    }
}

impl PairedReader {
    /// Advance to the next record if one is already readable. Safe to call
    /// while the paired writer runs; the shared mutex keeps the file I/O of
    /// the two sides apart.
    pub async fn next(&mut self) -> bool {
        let _io = self.shared.io.lock().await;
        self.reader.next()
    }

    /// Wait until the writer has produced something since our last look,
    /// then advance. Returns [`WalError::NoData`] when woken without a
    /// readable record (including after the writer closed).
    ///
    /// The local generation can jump forward by more than one when the
    /// producer was faster; after one `blocking_next` the caller drains the
    /// backlog with non-blocking [`next`](PairedReader::next) calls.
    pub async fn blocking_next(&mut self) -> Result<(), WalError> {
        loop {
            let current = *self.gen_rx.borrow_and_update();

            if current != self.generation {
                self.generation = current;
                break;
            }

            if self.gen_rx.changed().await.is_err() {
                // Writer side dropped; fall through for a final look.
                break;
            }
        }

        if self.next().await {
            Ok(())
        } else {
            Err(WalError::NoData)
        }
    }

    pub fn value(&self) -> &[u8] {
        self.reader.value()
    }

    pub fn error(&self) -> Option<&WalError> {
        self.reader.error()
    }

    pub fn pos(&self) -> crate::Position {
        self.reader.pos()
    }
}
