//! A bounded in-memory byte pipe between a caller and a codec worker.
//!
//! Bytes accumulate into fixed-size chunks that travel over a bounded
//! channel; a full channel blocks the sender and an empty one blocks the
//! receiver, which is the pipeline's only backpressure mechanism. Dropping
//! the writer signals end of stream; dropping the reader makes further
//! writes fail with `BrokenPipe`, which is how a closing pipeline unblocks
//! a stalled worker.

use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

/// Bytes per chunk sent over the channel.
pub(crate) const CHUNK_SIZE: usize = 8 * 1024;

/// Chunks the channel buffers before senders block.
pub(crate) const PIPE_DEPTH: usize = 16;

/// Creates a connected pipe pair.
pub(crate) fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(PIPE_DEPTH);
    (
        PipeWriter {
            tx,
            buffer: Vec::with_capacity(CHUNK_SIZE),
        },
        PipeReader {
            rx,
            held: Vec::new(),
            pos: 0,
        },
    )
}

/// The writing end. Drop it (or let it fall out of scope) to signal end of
/// stream to the reader.
pub(crate) struct PipeWriter {
    tx: SyncSender<Vec<u8>>,
    buffer: Vec<u8>,
}

impl PipeWriter {
    fn send(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(CHUNK_SIZE));
        self.tx
            .send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader is gone"))
    }

    /// Whether a send would currently block.
    #[cfg(test)]
    fn is_full(&self) -> bool {
        use std::sync::mpsc::TrySendError;
        matches!(self.tx.try_send(Vec::new()), Err(TrySendError::Full(_)))
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let take = rest.len().min(CHUNK_SIZE - self.buffer.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == CHUNK_SIZE {
                self.send()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        // Push out any buffered tail so a clean drop equals a flush; if the
        // reader is already gone there is nobody left to care.
        let _ = self.send();
    }
}

/// The reading end. Reports end of stream once the writer is dropped and
/// every chunk in flight has been consumed.
pub(crate) struct PipeReader {
    rx: Receiver<Vec<u8>>,
    held: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.held.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.held = chunk;
                    self.pos = 0;
                }
                // Writer dropped and channel drained: end of stream.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.held.len() - self.pos);
        buf[..n].copy_from_slice(&self.held[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_roundtrip_across_threads() {
        let (mut writer, mut reader) = pipe();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
        let expected = data.clone();

        let producer = thread::spawn(move || {
            writer.write_all(&data).unwrap();
            // Drop signals end of stream.
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        producer.join().unwrap();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_flush_delivers_partial_chunk() {
        let (mut writer, mut reader) = pipe();
        writer.write_all(b"tail").unwrap();
        writer.flush().unwrap();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"tail");
    }

    #[test]
    fn test_write_after_reader_drop_fails() {
        let (mut writer, reader) = pipe();
        drop(reader);
        let err = writer.write_all(&vec![0u8; CHUNK_SIZE * 2]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_bounded_channel_fills_up() {
        let (mut writer, _reader) = pipe();
        // Fill the channel without a consumer; the next full chunk would
        // block, which try_send reports as Full.
        for _ in 0..PIPE_DEPTH {
            writer.write_all(&vec![1u8; CHUNK_SIZE]).unwrap();
        }
        assert!(writer.is_full());
    }

    #[test]
    fn test_eof_after_writer_drop() {
        let (writer, mut reader) = pipe();
        drop(writer);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
