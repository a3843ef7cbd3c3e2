//! Single-segment read path.

use crate::record::{self, TAG_TYPE};
use crate::types::WalError;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

/// Iterates the records of one segment file.
///
/// `pos` always names the offset of the next unread record; it advances only
/// when a frame is read in full and verified, so after a failure it still
/// points at the offending frame. Framing is separate from payload decoding:
/// tag scanning inspects tag payloads without touching the value buffer.
pub struct SegmentReader {
    reader: BufReader<File>,
    decoder: snap::raw::Decoder,

    value: Vec<u8>,
    value_crc: u32,

    /// Compressed payload of the frame most recently read.
    scratch: Vec<u8>,
    /// Decoded tag payloads during a tag scan.
    tag_scratch: Vec<u8>,

    pos: i64,
    err: Option<WalError>,
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let file = File::open(path.as_ref())?;

        Ok(Self {
            reader: BufReader::new(file),
            decoder: snap::raw::Decoder::new(),
            value: Vec::new(),
            value_crc: 0,
            scratch: Vec::new(),
            tag_scratch: Vec::new(),
            pos: 0,
            err: None,
        })
    }

    /// Advance to the next data record, skipping tags. Returns false at the
    /// end of the segment or on error; [`error`](SegmentReader::error) tells
    /// which. A false caused by [`WalError::Eof`] is not final: if a live
    /// writer appends more records, a later call picks them up.
    pub fn next(&mut self) -> bool {
        self.err = None;

        loop {
            let raw = match record::read_record(&mut self.reader, &mut self.scratch) {
                Ok(raw) => raw,
                Err(err) => {
                    if matches!(err, WalError::UnexpectedEof) {
                        // The torn frame may simply not be finished yet; put
                        // the buffered reader back on the frame boundary so
                        // a retry after a live writer appends stays aligned.
                        let pos = self.pos;
                        if let Err(seek_err) = self.seek(pos) {
                            self.err = Some(seek_err);
                            return false;
                        }
                    }
                    self.err = Some(err);
                    return false;
                }
            };
            self.pos += raw.consumed;

            if raw.kind == TAG_TYPE {
                continue;
            }

            match decompress(&mut self.decoder, &self.scratch, &mut self.value) {
                Ok(()) => {
                    self.value_crc = raw.crc;
                    return true;
                }
                Err(err) => {
                    self.err = Some(err);
                    return false;
                }
            }
        }
    }

    /// Reposition to an absolute byte offset previously obtained from a
    /// writer's or reader's position.
    pub fn seek(&mut self, pos: i64) -> Result<(), WalError> {
        self.reader.seek(SeekFrom::Start(pos as u64))?;
        self.pos = pos;
        Ok(())
    }

    /// Scan forward for the last record tagged exactly `tag`. When found,
    /// the reader is left positioned at that tag record and its offset is
    /// returned; otherwise `-1`. Running out of segment ends the scan
    /// without error.
    pub fn seek_tag(&mut self, tag: &[u8]) -> Result<i64, WalError> {
        let mut last_pos = -1;

        loop {
            let pos = self.pos;
            let raw = match record::read_record(&mut self.reader, &mut self.scratch) {
                Ok(raw) => raw,
                Err(err) if err.is_end_of_segment() => break,
                Err(err) => return Err(err),
            };
            self.pos += raw.consumed;

            if raw.kind == TAG_TYPE {
                decompress(&mut self.decoder, &self.scratch, &mut self.tag_scratch)?;

                if self.tag_scratch == tag {
                    last_pos = pos;
                }
            }
        }

        if last_pos != -1 {
            self.seek(last_pos)?;
        }

        Ok(last_pos)
    }

    /// Offset of the next unread record.
    pub fn pos(&self) -> i64 {
        self.pos
    }

    /// The most recently read data payload.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Frame CRC of the most recently read data record.
    pub fn crc(&self) -> u32 {
        self.value_crc
    }

    /// Outcome of the most recent [`next`](SegmentReader::next) when it
    /// returned false.
    pub fn error(&self) -> Option<&WalError> {
        self.err.as_ref()
    }
}

fn decompress(
    decoder: &mut snap::raw::Decoder,
    compressed: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), WalError> {
    let len = snap::raw::decompress_len(compressed)?;
    out.resize(len, 0);
    let written = decoder.decompress(compressed, out)?;
    out.truncate(written);
    Ok(())
}
