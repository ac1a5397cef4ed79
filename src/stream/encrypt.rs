//! Encryption and decryption stream layers.

use std::io::{self, Read, Write};

use crate::crypto::CipherBuffer;
use crate::{Error, Result};

use super::{FileSink, FileSource, StageReport};

/// How many ciphertext bytes [`DecryptReader`] pulls from below per refill.
const PULL_SIZE: usize = 1024;

/// Encrypts written bytes through a [`CipherBuffer`] before forwarding.
pub(crate) struct EncryptWriter {
    inner: Box<dyn FileSink>,
    cipher: CipherBuffer,
}

impl EncryptWriter {
    pub(crate) fn new(inner: Box<dyn FileSink>, cipher: CipherBuffer) -> Self {
        Self { inner, cipher }
    }
}

impl Write for EncryptWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.cipher.update(buf).map_err(Error::into_io)?;
        self.inner.write_all(&self.cipher.buffer()[..n])?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Block-mode tails cannot be forced out early; only forward the
        // flush downstream.
        self.inner.flush()
    }
}

impl FileSink for EncryptWriter {
    fn finish_stage(mut self: Box<Self>) -> Result<(StageReport, Option<Box<dyn FileSink>>)> {
        let n = self.cipher.finish()?;
        self.inner
            .write_all(&self.cipher.buffer()[..n])
            .map_err(Error::from_io)?;
        Ok((StageReport::Passthrough, Some(self.inner)))
    }
}

/// Decrypts bytes pulled from the layer below.
///
/// Ciphertext is pulled in at most [`PULL_SIZE`]-byte slices; plaintext the
/// cipher produces is held until the caller consumes it. The cipher tail is
/// finished when the layer below reports end of stream.
pub(crate) struct DecryptReader {
    inner: Box<dyn FileSource>,
    cipher: CipherBuffer,
    held: Vec<u8>,
    pos: usize,
    done: bool,
}

impl DecryptReader {
    pub(crate) fn new(inner: Box<dyn FileSource>, cipher: CipherBuffer) -> Self {
        Self {
            inner,
            cipher,
            held: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    fn refill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; PULL_SIZE];
        while self.pos == self.held.len() && !self.done {
            let r = self.inner.read(&mut chunk)?;
            let n = if r == 0 {
                self.done = true;
                self.cipher.finish().map_err(Error::into_io)?
            } else {
                self.cipher.update(&chunk[..r]).map_err(Error::into_io)?
            };
            self.held.clear();
            self.held.extend_from_slice(&self.cipher.buffer()[..n]);
            self.pos = 0;
        }
        Ok(())
    }
}

impl Read for DecryptReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.refill()?;
        let n = buf.len().min(self.held.len() - self.pos);
        buf[..n].copy_from_slice(&self.held[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl FileSource for DecryptReader {
    fn close_stage(self: Box<Self>) -> Result<Option<Box<dyn FileSource>>> {
        Ok(Some(self.inner))
    }
}
