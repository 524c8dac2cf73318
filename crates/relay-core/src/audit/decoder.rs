//! Line-oriented decoding of the mirrored output stream.
//!
//! This is not a terminal emulator: cursor movement and screen redraws are discarded, so
//! full-screen programs produce a rough transcript.

use thiserror::Error;

/// Why a line was dropped instead of transcribed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeIssue {
    #[error("line is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },
    #[error("line exceeds {limit} bytes")]
    Oversized { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditLine {
    Text(String),
    Rejected(DecodeIssue),
}

/// Splits a byte stream into cleaned-up text lines.
///
/// Bytes are buffered until `\n`. A line that grows past `max_line_bytes` is reported once and
/// everything up to the next `\n` is skipped.
#[derive(Debug)]
pub struct LineDecoder {
    pending: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
}

impl LineDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
        }
    }

    /// Feed the next chunk, returning every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<AuditLine> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            match rest.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    let head = &rest[..idx];
                    rest = &rest[idx + 1..];

                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if self.pending.len() + head.len() > self.max_line_bytes {
                        self.pending.clear();
                        out.push(self.oversized());
                        continue;
                    }
                    self.pending.extend_from_slice(head);
                    let line = std::mem::take(&mut self.pending);
                    out.extend(clean_line(&line));
                }
                None => {
                    if !self.discarding {
                        if self.pending.len() + rest.len() > self.max_line_bytes {
                            self.pending.clear();
                            self.discarding = true;
                            out.push(self.oversized());
                        } else {
                            self.pending.extend_from_slice(rest);
                        }
                    }
                    break;
                }
            }
        }
        out
    }

    /// Flush a trailing line that never saw its `\n`.
    pub fn finish(&mut self) -> Option<AuditLine> {
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        clean_line(&line)
    }

    fn oversized(&self) -> AuditLine {
        AuditLine::Rejected(DecodeIssue::Oversized {
            limit: self.max_line_bytes,
        })
    }
}

fn clean_line(raw: &[u8]) -> Option<AuditLine> {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => {
            return Some(AuditLine::Rejected(DecodeIssue::InvalidUtf8 {
                valid_up_to: e.valid_up_to(),
            }));
        }
    };

    let mut edited = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\r' => {}
            '\x08' | '\x7f' => {
                edited.pop();
            }
            '\t' => edited.push_str("    "),
            c => edited.push(c),
        }
    }

    let stripped = strip_ansi_escapes::strip_str(&edited);
    let line = stripped.trim_end();
    if line.trim_start().is_empty() {
        None
    } else {
        Some(AuditLine::Text(line.to_string()))
    }
}
