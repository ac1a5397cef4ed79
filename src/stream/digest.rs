//! Digest layers: SHA-256 over bytes in flight.

use std::io::{self, Read, Write};

use sha2::{Digest, Sha256};

use crate::{Error, Result};

use super::{FileSink, FileSource, StageReport};

/// Tees every written byte into a SHA-256 state on the way downstream.
pub(crate) struct DigestWriter {
    inner: Box<dyn FileSink>,
    hasher: Sha256,
    length: u64,
}

impl DigestWriter {
    pub(crate) fn new(inner: Box<dyn FileSink>) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            length: 0,
        }
    }
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.length += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl FileSink for DigestWriter {
    fn finish_stage(self: Box<Self>) -> Result<(StageReport, Option<Box<dyn FileSink>>)> {
        let report = StageReport::Digest {
            value: self.hasher.finalize().to_vec(),
            length: self.length,
        };
        Ok((report, Some(self.inner)))
    }
}

/// Hashes every byte read from the layer below and validates the result
/// against an expected digest at close.
///
/// Validation only runs when end of stream was actually observed: a caller
/// that stops reading early has not seen every byte, so no digest claim can
/// be made either way.
pub(crate) struct DigestReader {
    inner: Box<dyn FileSource>,
    hasher: Sha256,
    expected: Vec<u8>,
    eof_seen: bool,
}

impl DigestReader {
    pub(crate) fn new(inner: Box<dyn FileSource>, expected: Vec<u8>) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            expected,
            eof_seen: false,
        }
    }
}

impl Read for DigestReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            if !buf.is_empty() {
                self.eof_seen = true;
            }
        } else {
            self.hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

impl FileSource for DigestReader {
    fn close_stage(self: Box<Self>) -> Result<Option<Box<dyn FileSource>>> {
        if self.eof_seen {
            let actual = self.hasher.finalize().to_vec();
            if actual != self.expected {
                return Err(Error::IntegrityViolation {
                    expected: hex::encode(&self.expected),
                    actual: hex::encode(&actual),
                });
            }
        }
        Ok(Some(self.inner))
    }
}
