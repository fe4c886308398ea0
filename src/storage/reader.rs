//! # Bidirectional UTF-8 Byte Reader
//!
//! A pull cursor over a [`LockedFile`] that yields `(byte_offset, char)`
//! pairs in forward or reverse byte order. Reads go through a reusable chunk
//! buffer that is refilled on demand, so multi-byte sequences straddling a
//! refill boundary decode transparently.
//!
//! The cursor advances only when an item is delivered: a consumer that
//! abandons iteration leaves the next position un-consumed, and the same
//! reader (or a `seek`) resumes exactly there. This is what lets the JSON
//! scanner chain element scans over one reader.
//!
//! A negative start position counts from end-of-file (`-1` is the last
//! byte), which the store's tail scan uses to find the closing `]`.

use eyre::{ensure, Result};

use super::file::LockedFile;
use crate::error::JifyError;

pub const DEFAULT_CHUNK_SIZE: usize = 8192;

#[derive(Debug)]
pub struct ByteReader<'f> {
    file: &'f LockedFile,
    chunk: usize,
    buf: Vec<u8>,
    buf_start: u64,
    position: u64,
    reverse: bool,
    done: bool,
}

impl<'f> ByteReader<'f> {
    /// Positions a new reader. `position` is absolute, or from end-of-file
    /// when negative. A reverse reader past the end clamps to the last byte.
    pub fn new(file: &'f LockedFile, position: i64, reverse: bool, chunk: usize) -> Result<Self> {
        let len = file.len()? as i64;
        let resolved = if position < 0 { len + position } else { position };
        let (start, done) = if reverse {
            let start = resolved.min(len - 1);
            (start.max(0) as u64, start < 0)
        } else {
            (resolved.max(0) as u64, false)
        };
        Ok(Self {
            file,
            chunk: chunk.max(4),
            buf: Vec::new(),
            buf_start: 0,
            position: start,
            reverse,
            done,
        })
    }

    /// Restarts the reader at an absolute offset, keeping its buffer.
    pub fn seek(&mut self, position: u64) {
        self.position = position;
        self.done = false;
    }

    fn in_buf(&self, offset: u64) -> bool {
        offset >= self.buf_start && offset < self.buf_start + self.buf.len() as u64
    }

    fn fill(&mut self, start: u64) -> Result<()> {
        self.buf.resize(self.chunk, 0);
        let count = self.file.read_at(&mut self.buf, start)?;
        self.buf.truncate(count);
        self.buf_start = start;
        Ok(())
    }

    /// Next raw byte in the configured direction.
    pub fn next_byte(&mut self) -> Result<Option<(u64, u8)>> {
        if self.done {
            return Ok(None);
        }
        if !self.in_buf(self.position) {
            let start = if self.reverse {
                self.position.saturating_sub(self.chunk as u64 - 1)
            } else {
                self.position
            };
            self.fill(start)?;
            if !self.in_buf(self.position) {
                self.done = true;
                return Ok(None);
            }
        }
        let offset = self.position;
        let byte = self.buf[(offset - self.buf_start) as usize];
        if self.reverse {
            if self.position == 0 {
                self.done = true;
            } else {
                self.position -= 1;
            }
        } else {
            self.position += 1;
        }
        Ok(Some((offset, byte)))
    }

    /// Next Unicode scalar; the offset is that of the scalar's first byte in
    /// either direction.
    pub fn next_char(&mut self) -> Result<Option<(u64, char)>> {
        if self.reverse {
            self.next_char_reverse()
        } else {
            self.next_char_forward()
        }
    }

    fn next_char_forward(&mut self) -> Result<Option<(u64, char)>> {
        let Some((start, lead)) = self.next_byte()? else {
            return Ok(None);
        };
        let width = utf8_width(lead)?;
        let mut bytes = [lead, 0, 0, 0];
        for slot in bytes.iter_mut().take(width).skip(1) {
            let Some((_, byte)) = self.next_byte()? else {
                return Err(JifyError::InvalidFormat(format!(
                    "truncated UTF-8 sequence at offset {start}"
                ))
                .into());
            };
            *slot = byte;
        }
        Ok(Some((start, decode_scalar(&bytes[..width], start)?)))
    }

    fn next_char_reverse(&mut self) -> Result<Option<(u64, char)>> {
        let mut bytes = [0u8; 4];
        let mut count = 0;
        loop {
            let Some((offset, byte)) = self.next_byte()? else {
                if count == 0 {
                    return Ok(None);
                }
                return Err(JifyError::InvalidFormat(
                    "orphan UTF-8 continuation bytes at start of file".into(),
                )
                .into());
            };
            count += 1;
            ensure!(
                count <= 4,
                JifyError::InvalidFormat(format!(
                    "over-long UTF-8 sequence ending at offset {offset}"
                ))
            );
            bytes[4 - count] = byte;
            if byte & 0xC0 != 0x80 {
                return Ok(Some((offset, decode_scalar(&bytes[4 - count..], offset)?)));
            }
        }
    }
}

fn utf8_width(lead: u8) -> Result<usize> {
    match lead {
        0x00..=0x7F => Ok(1),
        0xC0..=0xDF => Ok(2),
        0xE0..=0xEF => Ok(3),
        0xF0..=0xF7 => Ok(4),
        other => Err(JifyError::InvalidFormat(format!("invalid UTF-8 lead byte {other:#x}")).into()),
    }
}

fn decode_scalar(bytes: &[u8], offset: u64) -> Result<char> {
    let text = std::str::from_utf8(bytes).map_err(|_| {
        JifyError::InvalidFormat(format!("invalid UTF-8 sequence at offset {offset}"))
    })?;
    match text.chars().next() {
        Some(ch) => Ok(ch),
        None => Err(JifyError::InvalidFormat(format!("empty UTF-8 sequence at offset {offset}")).into()),
    }
}
