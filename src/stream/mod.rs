//! Layered stream pipelines.
//!
//! Writer pipelines are chains of [`FileSink`] layers: each layer transforms
//! bytes and forwards them to the layer below. Closing a pipeline unwinds it
//! layer by layer: `finish_stage` flushes the layer's tail, produces a
//! [`StageReport`], and hands back the layer below so the caller can keep
//! unwinding. Reader pipelines mirror this with [`FileSource`] and
//! `close_stage`, which is where deferred validation (digest checks, worker
//! errors) surfaces.

mod compress;
mod digest;
mod encrypt;
mod pipe;

pub(crate) use compress::{CompressWriter, DecompressReader};
pub(crate) use digest::{DigestReader, DigestWriter};
pub(crate) use encrypt::{DecryptReader, EncryptWriter};
pub(crate) use pipe::{PipeReader, PipeWriter, pipe};

use std::io::{Read, Write};

use crate::Result;

/// What one writer layer observed, reported as the pipeline unwinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StageReport {
    /// A digest over every byte that passed through the layer.
    Digest { value: Vec<u8>, length: u64 },
    /// Bytes physically written by the terminal layer.
    Stored { bytes: u64 },
    /// The layer transformed bytes but has nothing to record.
    Passthrough,
}

/// One layer of a writer pipeline.
pub(crate) trait FileSink: Write + Send {
    /// Flushes this layer's tail downstream and reports on it.
    ///
    /// Returns the layer below, or `None` for the terminal layer.
    fn finish_stage(self: Box<Self>) -> Result<(StageReport, Option<Box<dyn FileSink>>)>;
}

impl std::fmt::Debug for dyn FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileSource")
    }
}

/// One layer of a reader pipeline.
pub(crate) trait FileSource: Read + Send {
    /// Runs this layer's close-time validation.
    ///
    /// Returns the layer this one was reading from, or `None` for the
    /// terminal layer.
    fn close_stage(self: Box<Self>) -> Result<Option<Box<dyn FileSource>>>;
}
