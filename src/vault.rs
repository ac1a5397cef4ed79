//! The physical container layer.
//!
//! A vault is a store-only sequential archive. It knows nothing about
//! encryption or compression; it stores named byte streams and hands them
//! back. All security lives in the layers above it.
//!
//! # Wire format
//!
//! ```text
//! magic "GKNT" | version u8
//! entry*:  name_len u16 LE | name | extra_len u16 LE | extra | frame*
//! frame:   len u32 LE | bytes          (len 0 terminates the payload)
//! end:     name_len 0xFFFF
//! ```
//!
//! Payloads are chunk-framed because their final length is unknown while
//! streaming: the layers above produce compressed ciphertext of a length
//! nobody knows until the stream ends.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::stream::FileSource;
use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"GKNT";
const VERSION: u8 = 1;

/// Name-length value marking the end of the vault.
const END_SENTINEL: u16 = u16::MAX;

/// Longest allowed entry name, in bytes.
pub(crate) const MAX_NAME_LEN: usize = (END_SENTINEL - 1) as usize;

/// Streams entries into a vault.
pub(crate) struct VaultWriter<W: Write> {
    inner: W,
    in_entry: bool,
}

impl<W: Write> VaultWriter<W> {
    /// Writes the preamble and returns a writer positioned at the first
    /// entry.
    pub(crate) fn new(mut inner: W) -> Result<Self> {
        inner.write_all(MAGIC)?;
        inner.write_all(&[VERSION])?;
        Ok(Self {
            inner,
            in_entry: false,
        })
    }

    /// Opens a new entry. `extra` is a small clear-text marker blob stored
    /// alongside the name.
    pub(crate) fn begin_entry(&mut self, name: &str, extra: &[u8]) -> Result<()> {
        debug_assert!(!self.in_entry);
        if name.len() > MAX_NAME_LEN {
            return Err(Error::ProtocolViolation("entry name too long"));
        }
        if extra.len() > u16::MAX as usize {
            return Err(Error::ProtocolViolation("entry extra blob too large"));
        }
        self.inner
            .write_all(&(name.len() as u16).to_le_bytes())?;
        self.inner.write_all(name.as_bytes())?;
        self.inner
            .write_all(&(extra.len() as u16).to_le_bytes())?;
        self.inner.write_all(extra)?;
        self.in_entry = true;
        Ok(())
    }

    /// Appends one payload frame to the open entry. Empty input writes
    /// nothing, since a zero-length frame is the payload terminator.
    pub(crate) fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(self.in_entry);
        if data.is_empty() {
            return Ok(());
        }
        self.inner.write_all(&(data.len() as u32).to_le_bytes())?;
        self.inner.write_all(data)?;
        Ok(())
    }

    /// Terminates the open entry's payload.
    pub(crate) fn end_entry(&mut self) -> Result<()> {
        debug_assert!(self.in_entry);
        self.inner.write_all(&0u32.to_le_bytes())?;
        self.in_entry = false;
        Ok(())
    }

    /// Writes the end sentinel, flushes, and hands the destination back.
    pub(crate) fn finish(mut self) -> Result<W> {
        debug_assert!(!self.in_entry);
        self.inner.write_all(&END_SENTINEL.to_le_bytes())?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Name and marker blob of one vault entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VaultEntryMeta {
    pub(crate) name: String,
    pub(crate) extra: Vec<u8>,
}

/// Forward-only scanner over a vault.
///
/// After [`next_entry`][Self::next_entry] returns an entry, the scanner
/// itself reads as that entry's payload (frames are decoded transparently);
/// calling `next_entry` again skips whatever payload is left.
pub(crate) struct VaultScan<R: Read> {
    inner: R,
    /// Bytes left in the current frame.
    frame_left: u32,
    payload_done: bool,
}

impl<R: Read> std::fmt::Debug for VaultScan<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultScan")
            .field("frame_left", &self.frame_left)
            .field("payload_done", &self.payload_done)
            .finish_non_exhaustive()
    }
}

impl<R: Read> VaultScan<R> {
    pub(crate) fn new(mut inner: R) -> Result<Self> {
        let mut preamble = [0u8; 5];
        inner
            .read_exact(&mut preamble)
            .map_err(|_| Error::MalformedMetadata("container too short for preamble".into()))?;
        if &preamble[..4] != MAGIC {
            return Err(Error::MalformedMetadata(
                "container signature mismatch".into(),
            ));
        }
        if preamble[4] != VERSION {
            return Err(Error::MalformedMetadata(format!(
                "unsupported container version {}",
                preamble[4]
            )));
        }
        Ok(Self {
            inner,
            frame_left: 0,
            payload_done: true,
        })
    }

    /// Advances to the next entry, or `None` at the end sentinel.
    pub(crate) fn next_entry(&mut self) -> Result<Option<VaultEntryMeta>> {
        self.skip_payload()?;

        let name_len = self.read_u16()?;
        if name_len == END_SENTINEL {
            return Ok(None);
        }
        let name = self.read_exact_vec(name_len as usize)?;
        let name = String::from_utf8(name)
            .map_err(|_| Error::MalformedMetadata("entry name is not valid UTF-8".into()))?;
        let extra_len = self.read_u16()?;
        let extra = self.read_exact_vec(extra_len as usize)?;

        self.frame_left = 0;
        self.payload_done = false;
        Ok(Some(VaultEntryMeta { name, extra }))
    }

    /// Consumes the rest of the current payload, if any.
    pub(crate) fn skip_payload(&mut self) -> Result<()> {
        while !self.payload_done {
            let mut sink = [0u8; 4096];
            if Read::read(self, &mut sink).map_err(Error::from_io)? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.inner
            .read_exact(&mut buf)
            .map_err(|_| Error::MalformedMetadata("container truncated in entry header".into()))?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .map_err(|_| Error::MalformedMetadata("container truncated in entry header".into()))?;
        Ok(buf)
    }
}

impl<R: Read> Read for VaultScan<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.payload_done {
            return Ok(0);
        }
        while self.frame_left == 0 {
            let mut len = [0u8; 4];
            self.inner.read_exact(&mut len).map_err(|_| {
                Error::MalformedMetadata("container truncated in payload frame".into()).into_io()
            })?;
            self.frame_left = u32::from_le_bytes(len);
            if self.frame_left == 0 {
                self.payload_done = true;
                return Ok(0);
            }
        }
        let n = buf.len().min(self.frame_left as usize);
        let read = self.inner.read(&mut buf[..n])?;
        if read == 0 {
            return Err(
                Error::MalformedMetadata("container truncated in payload frame".into()).into_io(),
            );
        }
        self.frame_left -= read as u32;
        Ok(read)
    }
}

/// A backing store that can be scanned any number of times.
///
/// Every open file stream of a reader gets its own scan, so streams stay
/// independent of each other.
pub trait VaultSource: Send + Sync {
    /// Opens a fresh sequential view of the container bytes.
    fn open_scan(&self) -> io::Result<Box<dyn Read + Send>>;
}

/// A vault stored in a file on disk.
pub struct FileVaultSource {
    path: PathBuf,
}

impl FileVaultSource {
    /// Points at a container file; nothing is opened until the first scan.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl VaultSource for FileVaultSource {
    fn open_scan(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(BufReader::new(File::open(&self.path)?)))
    }
}

/// A vault held entirely in memory.
pub struct MemoryVaultSource {
    bytes: Arc<Vec<u8>>,
}

impl MemoryVaultSource {
    /// Wraps container bytes already in memory.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }
}

impl VaultSource for MemoryVaultSource {
    fn open_scan(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(SliceRead {
            bytes: self.bytes.clone(),
            pos: 0,
        }))
    }
}

struct SliceRead {
    bytes: Arc<Vec<u8>>,
    pos: usize,
}

impl Read for SliceRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.bytes.len() - self.pos);
        buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Opens a fresh scan positioned at the payload of one physical entry.
pub(crate) fn open_entry(
    source: &dyn VaultSource,
    physical_name: &str,
) -> Result<VaultScan<Box<dyn Read + Send>>> {
    let mut scan = VaultScan::new(source.open_scan()?)?;
    while let Some(meta) = scan.next_entry()? {
        if meta.name == physical_name {
            return Ok(scan);
        }
    }
    Err(Error::MalformedMetadata(format!(
        "physical entry '{physical_name}' missing from container"
    )))
}

/// The terminal source layer of a reader pipeline: one entry's payload.
pub(crate) struct EntryPayload {
    scan: VaultScan<Box<dyn Read + Send>>,
}

impl EntryPayload {
    pub(crate) fn open(source: &dyn VaultSource, physical_name: &str) -> Result<Self> {
        Ok(Self {
            scan: open_entry(source, physical_name)?,
        })
    }
}

impl Read for EntryPayload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.scan.read(buf)
    }
}

impl FileSource for EntryPayload {
    fn close_stage(self: Box<Self>) -> Result<Option<Box<dyn FileSource>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_vault() -> Vec<u8> {
        let mut writer = VaultWriter::new(Vec::new()).unwrap();
        writer.begin_entry("first", b"").unwrap();
        writer.write_frame(b"hello ").unwrap();
        writer.write_frame(b"world").unwrap();
        writer.end_entry().unwrap();
        writer.begin_entry("second", b"marker").unwrap();
        writer.write_frame(&[0xAA; 300]).unwrap();
        writer.end_entry().unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_scan_walks_entries() {
        let bytes = build_vault();
        let mut scan = VaultScan::new(io::Cursor::new(bytes)).unwrap();

        let meta = scan.next_entry().unwrap().unwrap();
        assert_eq!(meta.name, "first");
        assert!(meta.extra.is_empty());
        let mut payload = Vec::new();
        scan.read_to_end(&mut payload).unwrap();
        assert_eq!(payload, b"hello world");

        let meta = scan.next_entry().unwrap().unwrap();
        assert_eq!(meta.name, "second");
        assert_eq!(meta.extra, b"marker");
        let mut payload = Vec::new();
        scan.read_to_end(&mut payload).unwrap();
        assert_eq!(payload, vec![0xAA; 300]);

        assert!(scan.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_next_entry_skips_unread_payload() {
        let bytes = build_vault();
        let mut scan = VaultScan::new(io::Cursor::new(bytes)).unwrap();
        scan.next_entry().unwrap().unwrap();
        // Skip straight past "first" without reading it.
        let meta = scan.next_entry().unwrap().unwrap();
        assert_eq!(meta.name, "second");
    }

    #[test]
    fn test_empty_payload_entry() {
        let mut writer = VaultWriter::new(Vec::new()).unwrap();
        writer.begin_entry("empty", b"").unwrap();
        writer.end_entry().unwrap();
        let bytes = writer.finish().unwrap();

        let mut scan = VaultScan::new(io::Cursor::new(bytes)).unwrap();
        scan.next_entry().unwrap().unwrap();
        let mut payload = Vec::new();
        scan.read_to_end(&mut payload).unwrap();
        assert!(payload.is_empty());
        assert!(scan.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let err = VaultScan::new(io::Cursor::new(b"NOPE\x01".to_vec())).unwrap_err();
        assert!(matches!(err, Error::MalformedMetadata(_)));
    }

    #[test]
    fn test_bad_version_rejected() {
        let err = VaultScan::new(io::Cursor::new(b"GKNT\x07".to_vec())).unwrap_err();
        assert!(matches!(err, Error::MalformedMetadata(_)));
    }

    #[test]
    fn test_truncated_payload_detected() {
        let mut bytes = build_vault();
        bytes.truncate(bytes.len() - 200);
        let mut scan = VaultScan::new(io::Cursor::new(bytes)).unwrap();
        scan.next_entry().unwrap().unwrap();
        scan.next_entry().unwrap().unwrap();
        let mut payload = Vec::new();
        let err = Error::from_io(scan.read_to_end(&mut payload).unwrap_err());
        assert!(matches!(err, Error::MalformedMetadata(_)));
    }

    #[test]
    fn test_memory_source_supports_concurrent_scans() {
        let source = MemoryVaultSource::new(build_vault());
        let mut a = VaultScan::new(source.open_scan().unwrap()).unwrap();
        let mut b = VaultScan::new(source.open_scan().unwrap()).unwrap();
        assert_eq!(a.next_entry().unwrap().unwrap().name, "first");
        // The second scan starts from the top regardless of the first.
        assert_eq!(b.next_entry().unwrap().unwrap().name, "first");
    }

    #[test]
    fn test_open_entry_positions_at_payload() {
        let source = MemoryVaultSource::new(build_vault());
        let mut scan = open_entry(&source, "second").unwrap();
        let mut payload = Vec::new();
        scan.read_to_end(&mut payload).unwrap();
        assert_eq!(payload, vec![0xAA; 300]);

        let err = open_entry(&source, "absent").unwrap_err();
        assert!(matches!(err, Error::MalformedMetadata(_)));
    }

    #[test]
    fn test_file_source_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.gkn");
        std::fs::write(&path, build_vault()).unwrap();

        let source = FileVaultSource::new(&path);
        let mut scan = VaultScan::new(source.open_scan().unwrap()).unwrap();
        assert_eq!(scan.next_entry().unwrap().unwrap().name, "first");
    }
}
