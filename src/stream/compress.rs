//! Background LZMA compression layers.
//!
//! The codec runs on its own thread per open pipeline. The caller-facing
//! layer moves bytes over a bounded pipe; the worker owns the rest of the
//! layer chain and hands it back when it exits, so the pipeline unwind can
//! continue below the codec. Worker failures are captured in the join value
//! and re-raised on the next caller operation or at close, never lost.
//!
//! The compressed stream starts with a 5-byte parameter header (properties
//! byte plus little-endian dictionary size) followed by a raw LZMA stream
//! with an end marker, so the decoder needs no recorded plaintext length.

use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};

use lzma_rust2::{LzmaOptions, LzmaReader, LzmaWriter};

use crate::{Error, Result};

use super::{FileSink, FileSource, PipeReader, PipeWriter, StageReport, pipe};

const PRESET: u32 = 6;
const PARAM_LEN: usize = 5;

/// Compresses written bytes on a worker thread before they reach the layer
/// below.
pub(crate) struct CompressWriter {
    pipe: Option<PipeWriter>,
    worker: Option<JoinHandle<(Result<()>, Box<dyn FileSink>)>>,
}

impl CompressWriter {
    pub(crate) fn new(inner: Box<dyn FileSink>) -> Result<Self> {
        let (pipe_writer, pipe_reader) = pipe();
        let worker = thread::Builder::new()
            .name("lzma-encode".into())
            .spawn(move || compress_worker(pipe_reader, inner))?;
        Ok(Self {
            pipe: Some(pipe_writer),
            worker: Some(worker),
        })
    }

    /// Joins a worker that died under the caller, recovering its error.
    fn worker_failure(&mut self, fallback: io::Error) -> io::Error {
        self.pipe = None;
        let Some(worker) = self.worker.take() else {
            return fallback;
        };
        match worker.join() {
            Ok((Err(e), _)) => e.into_io(),
            Ok((Ok(()), _)) => fallback,
            Err(_) => Error::CompressionFailure("codec worker panicked".into()).into_io(),
        }
    }
}

impl Write for CompressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Err(Error::CompressionFailure("codec worker already failed".into()).into_io());
        };
        match pipe.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(self.worker_failure(e)),
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        // Delivering buffered chunks to the worker is all a flush can mean;
        // the codec itself cannot emit a clean boundary mid-stream.
        match self.pipe.as_mut().map(|p| p.flush()) {
            Some(Ok(())) | None => Ok(()),
            Some(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => Err(self.worker_failure(e)),
            Some(Err(e)) => Err(e),
        }
    }
}

impl FileSink for CompressWriter {
    fn finish_stage(mut self: Box<Self>) -> Result<(StageReport, Option<Box<dyn FileSink>>)> {
        // Dropping the pipe signals end of stream to the worker.
        drop(self.pipe.take());
        let worker = self
            .worker
            .take()
            .ok_or_else(|| Error::CompressionFailure("codec worker already failed".into()))?;
        let (result, sink) = worker
            .join()
            .map_err(|_| Error::CompressionFailure("codec worker panicked".into()))?;
        result?;
        Ok((StageReport::Passthrough, Some(sink)))
    }
}

fn compress_worker(
    mut source: PipeReader,
    mut sink: Box<dyn FileSink>,
) -> (Result<()>, Box<dyn FileSink>) {
    let result = (|| -> Result<()> {
        let options = LzmaOptions::with_preset(PRESET);
        let mut params = [0u8; PARAM_LEN];
        params[0] = options.get_props();
        params[1..].copy_from_slice(&options.dict_size.to_le_bytes());
        sink.write_all(&params).map_err(Error::from_io)?;

        let mut encoder = LzmaWriter::new_no_header(&mut sink, &options, true)
            .map_err(|e| Error::CompressionFailure(e.to_string()))?;
        io::copy(&mut source, &mut encoder).map_err(Error::from_io)?;
        encoder
            .finish()
            .map_err(|e| Error::CompressionFailure(e.to_string()))?;
        Ok(())
    })();
    (result, sink)
}

/// Decompresses bytes on a worker thread that owns the layer chain below.
pub(crate) struct DecompressReader {
    pipe: Option<PipeReader>,
    worker: Option<JoinHandle<(Result<()>, Box<dyn FileSource>)>>,
    chain: Option<Box<dyn FileSource>>,
}

impl DecompressReader {
    pub(crate) fn new(inner: Box<dyn FileSource>) -> Result<Self> {
        let (pipe_writer, pipe_reader) = pipe();
        let worker = thread::Builder::new()
            .name("lzma-decode".into())
            .spawn(move || decompress_worker(inner, pipe_writer))?;
        Ok(Self {
            pipe: Some(pipe_reader),
            worker: Some(worker),
            chain: None,
        })
    }

    /// Joins the worker after the pipe reported end of stream. A worker
    /// error must surface here, before the caller can mistake a truncated
    /// stream for a complete one.
    fn settle(&mut self) -> io::Result<()> {
        self.pipe = None;
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.join() {
            Ok((result, chain)) => {
                self.chain = Some(chain);
                result.map_err(Error::into_io)
            }
            Err(_) => Err(Error::CompressionFailure("codec worker panicked".into()).into_io()),
        }
    }
}

impl Read for DecompressReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(0);
        };
        let n = pipe.read(buf)?;
        if n == 0 {
            self.settle()?;
        }
        Ok(n)
    }
}

impl FileSource for DecompressReader {
    fn close_stage(mut self: Box<Self>) -> Result<Option<Box<dyn FileSource>>> {
        // Drop the pipe first: a worker blocked on a full pipe wakes up
        // with a broken-pipe error and exits.
        self.pipe = None;
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok((result, chain)) => {
                    self.chain = Some(chain);
                    match result {
                        // The worker died mid-send because we closed early.
                        Err(Error::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
                        other => other?,
                    }
                }
                Err(_) => {
                    return Err(Error::CompressionFailure("codec worker panicked".into()));
                }
            }
        }
        Ok(self.chain.take())
    }
}

fn decompress_worker(
    mut source: Box<dyn FileSource>,
    mut pipe: PipeWriter,
) -> (Result<()>, Box<dyn FileSource>) {
    let result = (|| -> Result<()> {
        let mut params = [0u8; PARAM_LEN];
        source.read_exact(&mut params).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::CompressionFailure("stream too short for codec parameters".into())
            } else {
                Error::from_io(e)
            }
        })?;
        let dict_size = u32::from_le_bytes(params[1..].try_into().expect("4 parameter bytes"));

        let mut decoder = LzmaReader::new_with_props(&mut source, u64::MAX, params[0], dict_size, None)
            .map_err(|e| Error::CompressionFailure(e.to_string()))?;
        io::copy(&mut decoder, &mut pipe).map_err(codec_error)?;
        pipe.flush().map_err(codec_error)?;

        // The decoder stops at its end marker; drain whatever trails it so
        // the layers below observe end of stream before their close-time
        // validation runs.
        io::copy(&mut source, &mut io::sink()).map_err(Error::from_io)?;
        Ok(())
    })();
    (result, source)
}

/// Classifies a worker-side copy error: broken pipe means the caller went
/// away, invalid data means a corrupt compressed stream, and anything else
/// is unwrapped back into a crate error.
fn codec_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::BrokenPipe {
        return Error::Io(e);
    }
    match Error::from_io(e) {
        Error::Io(inner) if inner.kind() == io::ErrorKind::InvalidData => {
            Error::CompressionFailure(inner.to_string())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Terminal sink writing into shared storage so tests can inspect the
    /// bytes after the worker consumed the sink.
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl FileSink for SharedSink {
        fn finish_stage(self: Box<Self>) -> Result<(StageReport, Option<Box<dyn FileSink>>)> {
            let bytes = self.0.lock().unwrap().len() as u64;
            Ok((StageReport::Stored { bytes }, None))
        }
    }

    struct VecSource(io::Cursor<Vec<u8>>);

    impl Read for VecSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl FileSource for VecSource {
        fn close_stage(self: Box<Self>) -> Result<Option<Box<dyn FileSource>>> {
            Ok(None)
        }
    }

    fn compress(data: &[u8]) -> Vec<u8> {
        let storage = Arc::new(Mutex::new(Vec::new()));
        let mut writer =
            Box::new(CompressWriter::new(Box::new(SharedSink(storage.clone()))).unwrap());
        writer.write_all(data).unwrap();
        let (report, inner) = writer.finish_stage().unwrap();
        assert_eq!(report, StageReport::Passthrough);
        inner.unwrap().finish_stage().unwrap();
        let out = storage.lock().unwrap().clone();
        out
    }

    #[test]
    fn test_roundtrip() {
        let data: Vec<u8> = b"compressible text "
            .iter()
            .cycle()
            .take(50_000)
            .copied()
            .collect();
        let compressed = compress(&data);
        assert!(compressed.len() > PARAM_LEN);
        assert!(compressed.len() < data.len());

        let mut reader = Box::new(
            DecompressReader::new(Box::new(VecSource(io::Cursor::new(compressed)))).unwrap(),
        );
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert!(reader.close_stage().unwrap().is_some());
    }

    #[test]
    fn test_empty_input() {
        let compressed = compress(b"");
        let mut reader = Box::new(
            DecompressReader::new(Box::new(VecSource(io::Cursor::new(compressed)))).unwrap(),
        );
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
        reader.close_stage().unwrap();
    }

    #[test]
    fn test_truncated_stream_fails() {
        let mut compressed = compress(b"some payload worth keeping around for a while");
        compressed.truncate(compressed.len() / 2);

        let mut reader = Box::new(
            DecompressReader::new(Box::new(VecSource(io::Cursor::new(compressed)))).unwrap(),
        );
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        let err = Error::from_io(err);
        assert!(
            matches!(err, Error::CompressionFailure(_) | Error::Io(_)),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn test_missing_parameters_fails() {
        let mut reader = Box::new(
            DecompressReader::new(Box::new(VecSource(io::Cursor::new(vec![1, 2])))).unwrap(),
        );
        let mut out = Vec::new();
        let err = Error::from_io(reader.read_to_end(&mut out).unwrap_err());
        assert!(matches!(err, Error::CompressionFailure(_)));
    }

    #[test]
    fn test_early_close_does_not_hang() {
        let data = vec![0u8; 2 * 1024 * 1024];
        let compressed = compress(&data);

        let mut reader = Box::new(
            DecompressReader::new(Box::new(VecSource(io::Cursor::new(compressed)))).unwrap(),
        );
        // Read a little, then abandon: close must unblock the worker.
        let mut buf = [0u8; 64];
        reader.read(&mut buf).unwrap();
        assert!(reader.close_stage().unwrap().is_some());
    }

    #[test]
    fn test_worker_error_surfaces_in_write() {
        /// A sink that rejects everything.
        struct FailSink;

        impl Write for FailSink {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(Error::CryptoFailure("downstream rejected write".into()).into_io())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        impl FileSink for FailSink {
            fn finish_stage(self: Box<Self>) -> Result<(StageReport, Option<Box<dyn FileSink>>)> {
                Ok((StageReport::Passthrough, None))
            }
        }

        let mut writer = CompressWriter::new(Box::new(FailSink)).unwrap();
        // Keep feeding until the dead worker is noticed; the original
        // downstream error must come back, not a bare broken pipe.
        let mut seen = None;
        for _ in 0..10_000 {
            if let Err(e) = writer.write_all(&[0u8; 1024]) {
                seen = Some(Error::from_io(e));
                break;
            }
        }
        match seen {
            Some(Error::CryptoFailure(msg)) => assert!(msg.contains("downstream rejected")),
            other => panic!("expected the downstream error, got {other:?}"),
        }
    }
}
