//! Newline-delimited JSON record reassembly.
//!
//! Bytes arrive in arbitrary chunks. A record ends at `\n` (an optional `\r`
//! before it is stripped). Blank lines are skipped. A malformed line yields an
//! error item and decoding carries on with the next line.

use bytes::BytesMut;
use serde_json::Value;
use thiserror::Error;

/// Default cap on one record's size.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// A line that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("line {line}: malformed record: {reason}")]
    Malformed { line: u64, reason: String },
    #[error("line {line}: record exceeds {limit} bytes")]
    TooLong { line: u64, limit: usize },
}

/// Incremental NDJSON decoder.
///
/// Chunk boundaries never change the outcome: feeding a stream in pieces
/// yields the same items as feeding it whole.
#[derive(Debug)]
pub struct RecordDecoder {
    /// Current line from its first non-whitespace byte.
    buf: BytesMut,
    /// Bytes seen on the current line, leading whitespace included.
    line_len: usize,
    ends_with_cr: bool,
    max_record_bytes: usize,
    /// 1-based number of the line being accumulated.
    line: u64,
    /// Skipping the rest of an oversized line.
    discarding: bool,
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD_BYTES)
    }
}

impl RecordDecoder {
    #[must_use]
    pub fn new(max_record_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            line_len: 0,
            ends_with_cr: false,
            max_record_bytes: max_record_bytes.max(1),
            line: 1,
            discarding: false,
        }
    }

    /// Feed a chunk and return every record it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Value, DecodeError>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                self.reset_line();
            } else {
                self.append(head);
                if let Some(item) = self.take_line() {
                    out.push(item);
                }
            }
            self.line += 1;
        }

        if self.discarding {
            return out;
        }
        self.append(rest);
        // Only give up early once the finished line is certain to be too long.
        if !self.buf.is_empty() && self.record_len() > self.max_record_bytes {
            out.push(Err(DecodeError::TooLong {
                line: self.line,
                limit: self.max_record_bytes,
            }));
            self.reset_line();
            self.discarding = true;
        }
        out
    }

    /// Decode a trailing unterminated line at end of input.
    pub fn finish(&mut self) -> Option<Result<Value, DecodeError>> {
        if std::mem::take(&mut self.discarding) {
            self.reset_line();
            return None;
        }
        self.take_line()
    }

    /// Bytes of the current line waiting for a newline.
    #[must_use]
    pub const fn pending_bytes(&self) -> usize {
        self.line_len
    }

    fn append(&mut self, bytes: &[u8]) {
        let Some(&last) = bytes.last() else { return };
        self.line_len += bytes.len();
        self.ends_with_cr = last == b'\r';
        if self.buf.is_empty() {
            if let Some(start) = bytes.iter().position(|b| !b.is_ascii_whitespace()) {
                self.buf.extend_from_slice(&bytes[start..]);
            }
        } else {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Line length without the `\r` of a `\r\n` ending.
    const fn record_len(&self) -> usize {
        self.line_len - if self.ends_with_cr { 1 } else { 0 }
    }

    fn reset_line(&mut self) {
        self.buf.clear();
        self.line_len = 0;
        self.ends_with_cr = false;
    }

    fn take_line(&mut self) -> Option<Result<Value, DecodeError>> {
        let len = self.record_len();
        let raw = self.buf.split();
        self.line_len = 0;
        self.ends_with_cr = false;

        if raw.is_empty() {
            return None;
        }
        if len > self.max_record_bytes {
            return Some(Err(DecodeError::TooLong {
                line: self.line,
                limit: self.max_record_bytes,
            }));
        }
        let record = raw.strip_suffix(b"\r").unwrap_or(&raw[..]);
        Some(
            serde_json::from_slice(record).map_err(|e| DecodeError::Malformed {
                line: self.line,
                reason: e.to_string(),
            }),
        )
    }
}
