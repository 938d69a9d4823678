//! Trace file reader.
//!
//! Line-oriented format, one access per line:
//!
//! ```text
//! # cycle  op  physical-address  [data]
//! 0   R  0x1A2B3C00
//! 12  W  0x1A2B3C40  DEADBEEF00112233
//! ```
//!
//! `op` is `R` or `W`; the address takes an optional `0x` prefix; data
//! is hex bytes and only meaningful for writes (and for reads when a
//! data mirror should be backfilled). Blank lines and `#` comments are
//! skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

use crate::device::data::DataBlock;
use crate::device::request::OpKind;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to read trace: {0}")]
    Io(#[from] std::io::Error),
    #[error("trace line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// One parsed trace access.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    /// Earliest cycle the access may be injected.
    pub cycle: u64,
    pub kind: OpKind,
    pub address: u64,
    pub data: Option<DataBlock>,
}

/// Streaming reader over a trace source.
pub struct TraceReader<R: BufRead> {
    lines: std::io::Lines<R>,
    line_number: usize,
}

impl TraceReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, TraceError> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> TraceReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
        }
    }

    fn parse(&self, text: &str) -> Result<Option<TraceRecord>, TraceError> {
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            return Ok(None);
        }

        let malformed = |reason: &str| TraceError::Malformed {
            line: self.line_number,
            reason: reason.to_owned(),
        };

        let mut fields = text.split_whitespace();
        let cycle = fields
            .next()
            .ok_or_else(|| malformed("missing cycle"))?
            .parse::<u64>()
            .map_err(|_| malformed("bad cycle"))?;

        let kind = match fields.next().ok_or_else(|| malformed("missing op"))? {
            "R" | "r" => OpKind::Read,
            "W" | "w" => OpKind::Write,
            other => return Err(malformed(&format!("unknown op '{}'", other))),
        };

        let addr_text = fields.next().ok_or_else(|| malformed("missing address"))?;
        let addr_text = addr_text.strip_prefix("0x").unwrap_or(addr_text);
        let address =
            u64::from_str_radix(addr_text, 16).map_err(|_| malformed("bad address"))?;

        let data = match fields.next() {
            Some(hex) => Some(
                DataBlock::from_hex(hex).ok_or_else(|| malformed("bad data"))?,
            ),
            None => None,
        };

        Ok(Some(TraceRecord {
            cycle,
            kind,
            address,
            data,
        }))
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = Result<TraceRecord, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line_number += 1;
            match self.lines.next()? {
                Ok(text) => match self.parse(&text) {
                    Ok(Some(record)) => return Some(Ok(record)),
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e)),
                },
                Err(e) => return Some(Err(TraceError::Io(e))),
            }
        }
    }
}
