//! Container writing.
//!
//! [`ContainerWriter`] is a small state machine: at most one file stream is
//! open at a time, and a closed writer stays closed. Opening a file stream
//! hands the caller a [`FileWriter`] whose bytes run through the layered
//! pipeline (plaintext digest, background compression, the file's randomly
//! chosen encryption stages with optional per-stage digests, ciphertext
//! digest) before landing in the physical vault.
//!
//! Encrypted entries get anonymous physical names; everything that could
//! identify them — logical name, sizes, digests, keys — lives only in the
//! directory, which is encrypted under the password hash when the container
//! closes.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::debug;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::contents::{ContainerContents, ContainerEntry, Digest, EntryKind, FileInfo, HeaderInfo, StageKey};
use crate::crypto::{
    CipherBuffer, KeyPair, MAX_STAGES, MIN_STAGES, Password, PasswordHash, RandomPicker,
    StagePicker, SymAlgorithm,
};
use crate::stream::{CompressWriter, DigestWriter, EncryptWriter, FileSink, StageReport};
use crate::vault::VaultWriter;
use crate::{Error, Result};

/// Prefix of anonymous physical entry names.
pub(crate) const DATA_PREFIX: &str = "DataFile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    FileOpen,
    Closed,
    /// A pipeline unwind failed and the vault was lost; the container can
    /// neither take more files nor be closed cleanly.
    Broken,
}

struct Security {
    hash: PasswordHash,
    keypair: KeyPair,
    picker: Box<dyn StagePicker>,
}

struct Core<W: Write + Send> {
    vault: Option<VaultWriter<W>>,
    state: WriterState,
    contents: ContainerContents,
    /// Every logical name ever opened. The directory only tracks encrypted
    /// entries, so duplicates are rejected against this set instead.
    used_names: BTreeSet<String>,
    security: Option<Security>,
    stage_digests: bool,
    next_index: u64,
    dest: Option<W>,
}

/// Writes a secure container.
///
/// ```rust,no_run
/// use std::io::Write;
/// use gordian::{ContainerWriter, Password, Result};
///
/// fn write_archive() -> Result<()> {
///     let mut writer =
///         ContainerWriter::create_path("backup.gkn", Some(Password::new("secret")))?;
///     let mut file = writer.begin_file("notes.txt")?;
///     file.write_all(b"important notes")?;
///     file.finish()?;
///     writer.close()
/// }
/// ```
pub struct ContainerWriter<W: Write + Send + 'static> {
    core: Arc<Mutex<Core<W>>>,
}

impl ContainerWriter<BufWriter<File>> {
    /// Creates a container file at `path`.
    pub fn create_path(path: impl AsRef<Path>, password: Option<Password>) -> Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), password)
    }
}

impl<W: Write + Send + 'static> ContainerWriter<W> {
    /// Creates a container writing into `dest`.
    ///
    /// With a password the container is encrypted; without one it is a
    /// plain store-only archive.
    pub fn new(dest: W, password: Option<Password>) -> Result<Self> {
        Self::build(dest, password, Box::new(RandomPicker))
    }

    /// Creates an encrypted container with a caller-chosen stage picker.
    pub fn with_picker(
        dest: W,
        password: Password,
        picker: Box<dyn StagePicker>,
    ) -> Result<Self> {
        Self::build(dest, Some(password), picker)
    }

    fn build(dest: W, password: Option<Password>, picker: Box<dyn StagePicker>) -> Result<Self> {
        let security = match password {
            Some(password) => Some(Security {
                hash: PasswordHash::random(password)?,
                keypair: KeyPair::generate(),
                picker,
            }),
            None => None,
        };
        let core = Core {
            vault: Some(VaultWriter::new(dest)?),
            state: WriterState::Open,
            contents: ContainerContents::new(),
            used_names: BTreeSet::new(),
            security,
            stage_digests: false,
            next_index: 1,
            dest: None,
        };
        Ok(Self {
            core: Arc::new(Mutex::new(core)),
        })
    }

    /// Turns per-stage digests on or off for files opened afterwards.
    ///
    /// With stage digests on, each encryption stage's input digest is
    /// recorded too, so corruption can be localized to a stage instead of
    /// just detected.
    pub fn set_stage_digests(&mut self, on: bool) {
        self.lock().stage_digests = on;
    }

    /// Opens a stream for the next file.
    pub fn begin_file(&mut self, name: &str) -> Result<FileWriter<W>> {
        let mut core = self.lock();
        match core.state {
            WriterState::Open => {}
            WriterState::FileOpen => {
                return Err(Error::ProtocolViolation("a file stream is already open"));
            }
            WriterState::Closed => {
                return Err(Error::ProtocolViolation("container is closed"));
            }
            WriterState::Broken => {
                return Err(Error::ProtocolViolation(
                    "an earlier failure broke the container",
                ));
            }
        }
        if name.is_empty() {
            return Err(Error::ProtocolViolation("file name must not be empty"));
        }
        if core.used_names.contains(name) {
            return Err(Error::DuplicateEntry { name: name.into() });
        }

        let encrypted = core.security.is_some();
        let physical = if encrypted {
            let physical = format!("{DATA_PREFIX}{}", core.next_index);
            core.next_index += 1;
            physical
        } else {
            name.to_owned()
        };

        // Pick the plan and generate fresh stage keys before touching the
        // vault, so a failure leaves the container untouched.
        let stage_digests = core.stage_digests;
        let mut plan = Vec::new();
        let mut keys: Vec<(Zeroizing<Vec<u8>>, Vec<u8>)> = Vec::new();
        if let Some(security) = core.security.as_mut() {
            plan = security.picker.pick();
            if !(MIN_STAGES..=MAX_STAGES).contains(&plan.len()) {
                return Err(Error::CryptoFailure(format!(
                    "stage picker produced {} stages, expected {MIN_STAGES}..={MAX_STAGES}",
                    plan.len()
                )));
            }
            for algorithm in &plan {
                let mut key = Zeroizing::new(vec![0u8; algorithm.key_len()]);
                OsRng.fill_bytes(&mut key);
                let mut iv = vec![0u8; algorithm.iv_len()];
                OsRng.fill_bytes(&mut iv);
                keys.push((key, iv));
            }
        }

        let mut vault = core
            .vault
            .take()
            .ok_or(Error::ProtocolViolation("container writer is broken"))?;
        if let Err(e) = vault.begin_entry(&physical, b"") {
            core.vault = Some(vault);
            return Err(e);
        }
        core.state = WriterState::FileOpen;
        core.used_names.insert(name.to_owned());
        drop(core);

        debug!(
            "opened entry '{name}' as '{physical}' with {} stages",
            plan.len()
        );

        // Build the pipeline inner-first: vault sink, ciphertext digest,
        // stages outermost-last, compression, plaintext digest.
        let mut chain: Box<dyn FileSink> = Box::new(EntrySink {
            vault: Some(vault),
            core: Arc::clone(&self.core),
            written: 0,
        });
        if encrypted {
            chain = Box::new(DigestWriter::new(chain));
            for (algorithm, (key, iv)) in plan.iter().zip(&keys).rev() {
                let cipher = CipherBuffer::encrypt(*algorithm, key, iv)?;
                chain = Box::new(EncryptWriter::new(chain, cipher));
                if stage_digests {
                    chain = Box::new(DigestWriter::new(chain));
                }
            }
            chain = Box::new(CompressWriter::new(chain)?);
            chain = Box::new(DigestWriter::new(chain));
        }

        Ok(FileWriter {
            chain: Some(chain),
            core: Arc::clone(&self.core),
            ctx: Some(EntryCtx {
                logical_name: name.to_owned(),
                physical_name: physical,
                plan,
                keys,
                stage_digests,
            }),
        })
    }

    /// Closes the container: writes the encrypted directory and the end
    /// sentinel. Idempotent; closing an already-closed container is a
    /// no-op.
    pub fn close(&mut self) -> Result<()> {
        let mut core = self.lock();
        match core.state {
            WriterState::Closed => return Ok(()),
            WriterState::FileOpen => {
                return Err(Error::ProtocolViolation(
                    "close called while a file stream is open",
                ));
            }
            WriterState::Broken => {
                return Err(Error::ProtocolViolation(
                    "an earlier failure broke the container",
                ));
            }
            WriterState::Open => {}
        }
        let core = &mut *core;
        let mut vault = core
            .vault
            .take()
            .ok_or(Error::ProtocolViolation("container writer is broken"))?;

        let has_files = !core.contents.is_empty();
        if let Some(security) = core.security.as_mut().filter(|_| has_files) {
            let physical = format!("{DATA_PREFIX}{}", core.next_index);
            core.next_index += 1;

            let wrapped_secret = security
                .hash
                .encrypt(security.keypair.secret_encoding().as_slice())?;
            core.contents.set_header(ContainerEntry {
                file_name: "header".into(),
                archive_name: physical.clone(),
                original_size: 0,
                stored_size: 0,
                kind: EntryKind::Header(HeaderInfo {
                    public_key: security.keypair.public_encoding().to_vec(),
                    wrapped_secret,
                }),
            });

            let text = core.contents.encode();
            let blob = security.hash.encrypt(text.as_bytes())?;
            let marker = security.hash.hash_bytes();

            vault.begin_entry(&physical, &marker)?;
            vault.write_frame(&blob)?;
            vault.end_entry()?;

            // A future container written with this writer's security state
            // must not share salts with this one.
            security.hash.reseed()?;
            debug!("wrote directory with {} entries", core.contents.len());
        }

        core.dest = Some(vault.finish()?);
        core.state = WriterState::Closed;
        Ok(())
    }

    /// Consumes a closed writer and hands back the destination.
    pub fn into_inner(self) -> Result<W> {
        let core = Arc::into_inner(self.core)
            .ok_or(Error::ProtocolViolation("a file stream is still open"))?;
        let core = core.into_inner().unwrap_or_else(|e| e.into_inner());
        core.dest
            .ok_or(Error::ProtocolViolation("container is not closed"))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Core<W>> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-entry state carried from `begin_file` to `finish`.
struct EntryCtx {
    logical_name: String,
    physical_name: String,
    plan: Vec<SymAlgorithm>,
    keys: Vec<(Zeroizing<Vec<u8>>, Vec<u8>)>,
    stage_digests: bool,
}

/// An open file stream inside a container.
///
/// Dropping an unfinished stream completes it on a best-effort basis;
/// call [`finish`][Self::finish] to observe errors.
pub struct FileWriter<W: Write + Send + 'static> {
    chain: Option<Box<dyn FileSink>>,
    core: Arc<Mutex<Core<W>>>,
    ctx: Option<EntryCtx>,
}

impl<W: Write + Send + 'static> std::fmt::Debug for FileWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter").finish_non_exhaustive()
    }
}

impl<W: Write + Send + 'static> Write for FileWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.chain.as_mut() {
            Some(chain) => chain.write(buf),
            None => Err(Error::ProtocolViolation("file stream already finished").into_io()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.chain.as_mut() {
            Some(chain) => chain.flush(),
            None => Ok(()),
        }
    }
}

impl<W: Write + Send + 'static> FileWriter<W> {
    /// Completes the file: unwinds the pipeline, wraps the stage keys,
    /// signs the entry metadata, and records it in the directory.
    pub fn finish(mut self) -> Result<()> {
        self.complete()
    }

    fn complete(&mut self) -> Result<()> {
        let Some(mut chain) = self.chain.take() else {
            return Ok(());
        };
        let ctx = self.ctx.take().ok_or(Error::ProtocolViolation(
            "file stream has no entry context",
        ))?;

        // Unwind without holding the container lock: the terminal layer
        // reinstalls the vault itself.
        let mut reports = Vec::new();
        let result = loop {
            match chain.finish_stage() {
                Ok((report, Some(next))) => {
                    reports.push(report);
                    chain = next;
                }
                Ok((report, None)) => {
                    reports.push(report);
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
        let core = &mut *core;
        if let Err(e) = result {
            // The vault never came back; later calls keep reporting this.
            core.state = WriterState::Broken;
            return Err(e);
        }
        core.state = WriterState::Open;

        let mut digests = Vec::new();
        let mut stored_size = 0;
        for report in reports {
            match report {
                StageReport::Digest { value, length } => digests.push(Digest { value, length }),
                StageReport::Stored { bytes } => stored_size = bytes,
                StageReport::Passthrough => {}
            }
        }

        if core.security.is_none() {
            // Store-only entry: the vault record is all there is.
            return Ok(());
        }

        // Unwind order is plaintext digest first, stage digests in stage
        // order, ciphertext digest last; the recorded order puts the
        // ciphertext digest first and the plaintext digest last.
        let expected = if ctx.stage_digests {
            2 + ctx.plan.len()
        } else {
            2
        };
        if digests.len() != expected {
            return Err(Error::ProtocolViolation("pipeline produced wrong digest count"));
        }
        let plain = digests.remove(0);
        let entry_digest = digests.pop().expect("at least two digests");
        let original_size = plain.length;
        let mut recorded = Vec::with_capacity(expected);
        recorded.push(entry_digest);
        recorded.extend(digests);
        recorded.push(plain);

        let security = core
            .security
            .as_ref()
            .expect("checked above");
        let public = security.keypair.public_encoding();
        let mut stages = Vec::with_capacity(ctx.plan.len());
        for (algorithm, (key, iv)) in ctx.plan.iter().zip(&ctx.keys) {
            stages.push(StageKey {
                algorithm: *algorithm,
                wrapped_key: KeyPair::wrap_key(&public, key)?,
                iv: iv.clone(),
            });
        }

        let mut info = FileInfo {
            digests: recorded,
            stages,
            signature: Vec::new(),
            debug: ctx.stage_digests,
        };
        info.signature = security.keypair.sign(&info.signed_payload(&ctx.logical_name));

        core.contents.insert(ContainerEntry {
            file_name: ctx.logical_name,
            archive_name: ctx.physical_name,
            original_size,
            stored_size,
            kind: EntryKind::File(info),
        })
    }
}

impl<W: Write + Send + 'static> Drop for FileWriter<W> {
    fn drop(&mut self) {
        if self.chain.is_some() {
            let _ = self.complete();
        }
    }
}

/// Terminal sink: frames payload bytes into the open vault entry and gives
/// the vault back to the container when the entry ends.
struct EntrySink<W: Write + Send + 'static> {
    vault: Option<VaultWriter<W>>,
    core: Arc<Mutex<Core<W>>>,
    written: u64,
}

impl<W: Write + Send + 'static> Write for EntrySink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(vault) = self.vault.as_mut() else {
            return Err(Error::ProtocolViolation("entry already finished").into_io());
        };
        vault.write_frame(buf).map_err(Error::into_io)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: Write + Send + 'static> FileSink for EntrySink<W> {
    fn finish_stage(mut self: Box<Self>) -> Result<(StageReport, Option<Box<dyn FileSink>>)> {
        let mut vault = self
            .vault
            .take()
            .ok_or(Error::ProtocolViolation("entry already finished"))?;
        vault.end_entry()?;
        let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
        core.vault = Some(vault);
        Ok((
            StageReport::Stored {
                bytes: self.written,
            },
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::FixedPicker;
    use crate::vault::VaultScan;
    use std::io::{Cursor, Read};

    fn picker() -> Box<dyn StagePicker> {
        Box::new(FixedPicker::new(vec![
            SymAlgorithm::Aes256Cbc,
            SymAlgorithm::ChaCha20,
        ]))
    }

    #[test]
    fn test_two_open_streams_rejected() {
        let mut writer =
            ContainerWriter::with_picker(Vec::new(), Password::new("pw"), picker()).unwrap();
        let _file = writer.begin_file("a").unwrap();
        let err = writer.begin_file("b").unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_close_with_open_stream_rejected() {
        let mut writer =
            ContainerWriter::with_picker(Vec::new(), Password::new("pw"), picker()).unwrap();
        let _file = writer.begin_file("a").unwrap();
        let err = writer.close().unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut writer =
            ContainerWriter::with_picker(Vec::new(), Password::new("pw"), picker()).unwrap();
        let mut file = writer.begin_file("a").unwrap();
        file.write_all(b"one").unwrap();
        file.finish().unwrap();
        let err = writer.begin_file("a").unwrap_err();
        assert!(matches!(err, Error::DuplicateEntry { .. }));
    }

    #[test]
    fn test_duplicate_names_rejected_without_encryption() {
        // Store-only entries never reach the directory, so the name check
        // must not depend on it.
        let mut writer = ContainerWriter::new(Vec::new(), None).unwrap();
        let mut file = writer.begin_file("twice").unwrap();
        file.write_all(b"first").unwrap();
        file.finish().unwrap();
        let err = writer.begin_file("twice").unwrap_err();
        assert!(matches!(err, Error::DuplicateEntry { name } if name == "twice"));
        writer.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut writer =
            ContainerWriter::with_picker(Vec::new(), Password::new("pw"), picker()).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        let bytes = writer.into_inner().unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn test_begin_after_close_rejected() {
        let mut writer =
            ContainerWriter::with_picker(Vec::new(), Password::new("pw"), picker()).unwrap();
        writer.close().unwrap();
        let err = writer.begin_file("late").unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_empty_container_has_no_directory() {
        let mut writer =
            ContainerWriter::with_picker(Vec::new(), Password::new("pw"), picker()).unwrap();
        writer.close().unwrap();
        let bytes = writer.into_inner().unwrap();

        let mut scan = VaultScan::new(Cursor::new(bytes)).unwrap();
        assert!(scan.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_physical_names_are_anonymous() {
        let mut writer =
            ContainerWriter::with_picker(Vec::new(), Password::new("pw"), picker()).unwrap();
        let mut file = writer.begin_file("very-secret-name.txt").unwrap();
        file.write_all(b"payload").unwrap();
        file.finish().unwrap();
        writer.close().unwrap();
        let bytes = writer.into_inner().unwrap();

        let mut scan = VaultScan::new(Cursor::new(bytes.clone())).unwrap();
        let mut names = Vec::new();
        while let Some(meta) = scan.next_entry().unwrap() {
            names.push(meta.name);
        }
        assert_eq!(names, ["DataFile1", "DataFile2"]);

        let haystack = String::from_utf8_lossy(&bytes).into_owned();
        assert!(!haystack.contains("very-secret-name"));
    }

    #[test]
    fn test_directory_entry_carries_hash_marker() {
        let mut writer =
            ContainerWriter::with_picker(Vec::new(), Password::new("pw"), picker()).unwrap();
        let mut file = writer.begin_file("a").unwrap();
        file.write_all(b"data").unwrap();
        file.finish().unwrap();
        writer.close().unwrap();
        let bytes = writer.into_inner().unwrap();

        let mut scan = VaultScan::new(Cursor::new(bytes)).unwrap();
        let first = scan.next_entry().unwrap().unwrap();
        assert!(first.extra.is_empty());
        let second = scan.next_entry().unwrap().unwrap();
        assert_eq!(second.extra.len(), crate::crypto::HASH_LEN);
    }

    #[test]
    fn test_unencrypted_container_keeps_names() {
        let mut writer = ContainerWriter::new(Vec::new(), None).unwrap();
        let mut file = writer.begin_file("plain.txt").unwrap();
        file.write_all(b"clear text payload").unwrap();
        file.finish().unwrap();
        writer.close().unwrap();
        let bytes = writer.into_inner().unwrap();

        let mut scan = VaultScan::new(Cursor::new(bytes)).unwrap();
        let meta = scan.next_entry().unwrap().unwrap();
        assert_eq!(meta.name, "plain.txt");
        let mut payload = Vec::new();
        scan.read_to_end(&mut payload).unwrap();
        assert_eq!(payload, b"clear text payload");
    }

    /// Destination that fails once a byte budget is exhausted.
    struct FailingDest {
        limit: usize,
        written: usize,
    }

    impl Write for FailingDest {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written + buf.len() > self.limit {
                return Err(io::Error::other("device full"));
            }
            self.written += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_finish_breaks_the_writer() {
        // Enough budget for the preamble and the entry header, not for the
        // payload: the pipeline unwind fails and the vault is lost.
        let dest = FailingDest {
            limit: 40,
            written: 0,
        };
        let mut writer = ContainerWriter::with_picker(dest, Password::new("pw"), picker()).unwrap();
        let mut file = writer.begin_file("doomed").unwrap();
        let _ = file.write_all(&[0x5A; 4096]);
        assert!(file.finish().is_err());

        // Later calls must keep reporting the failure instead of
        // pretending the container closed cleanly.
        assert!(matches!(writer.close(), Err(Error::ProtocolViolation(_))));
        assert!(matches!(writer.close(), Err(Error::ProtocolViolation(_))));
        assert!(matches!(
            writer.begin_file("after"),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(writer.into_inner().is_err());
    }

    #[test]
    fn test_dropped_file_writer_completes_entry() {
        let mut writer =
            ContainerWriter::with_picker(Vec::new(), Password::new("pw"), picker()).unwrap();
        {
            let mut file = writer.begin_file("dropped").unwrap();
            file.write_all(b"content").unwrap();
            // No finish: drop completes it.
        }
        writer.close().unwrap();
    }
}
