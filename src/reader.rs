//! Container reading.
//!
//! Opening a container only scans the physical layer: entry names and the
//! clear marker blobs. Nothing about an encrypted container is trusted
//! until [`ContainerReader::unlock`] verifies the password against the
//! recorded hash, decrypts the directory, and recovers the key pair.
//!
//! Every file stream gets its own scan of the backing store, so streams
//! are independent of each other. Before any ciphertext of an entry is
//! decrypted, its metadata signature is checked; a signature failure means
//! the entry is never opened at all.

use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};

use crate::contents::ContainerContents;
use crate::crypto::{CipherBuffer, KeyPair, Password, PasswordHash};
use crate::stream::{DecompressReader, DecryptReader, DigestReader, FileSource};
use crate::vault::{EntryPayload, FileVaultSource, VaultScan, VaultSource};
use crate::{Error, Result};

/// What the caller can learn about an entry without reading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Logical name.
    pub name: String,
    /// Plaintext length; unknown for store-only entries.
    pub original_size: Option<u64>,
    /// Stored (compressed + encrypted) length; unknown for store-only
    /// entries.
    pub stored_size: Option<u64>,
}

/// The directory marker found during the physical scan.
struct Marker {
    hash_bytes: Vec<u8>,
    physical_name: String,
}

/// State recovered by a successful unlock.
struct Unlocked {
    contents: ContainerContents,
    keypair: KeyPair,
    public: Vec<u8>,
}

/// Reads a secure container.
///
/// ```rust,no_run
/// use std::io::Read;
/// use gordian::{ContainerReader, Password, Result};
///
/// fn read_notes() -> Result<Vec<u8>> {
///     let mut reader = ContainerReader::open_path("backup.gkn")?;
///     reader.unlock(Password::new("secret"))?;
///     let mut file = reader.open("notes.txt")?;
///     let mut notes = Vec::new();
///     file.read_to_end(&mut notes)?;
///     file.close()?;
///     Ok(notes)
/// }
/// ```
pub struct ContainerReader {
    source: Arc<dyn VaultSource>,
    marker: Option<Marker>,
    plain_names: Vec<String>,
    unlocked: Option<Unlocked>,
}

impl ContainerReader {
    /// Opens a container file.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(FileVaultSource::new(path))
    }

    /// Opens a container over any rescannable source.
    pub fn new(source: impl VaultSource + 'static) -> Result<Self> {
        let source: Arc<dyn VaultSource> = Arc::new(source);

        // Walk the physical entries until the directory marker shows up.
        // Entries before it (or all of them, when there is no marker) are
        // store-only files addressable by their physical names.
        let mut scan = VaultScan::new(source.open_scan()?)?;
        let mut marker = None;
        let mut plain_names = Vec::new();
        while let Some(meta) = scan.next_entry()? {
            if meta.extra.is_empty() {
                plain_names.push(meta.name);
            } else {
                marker = Some(Marker {
                    hash_bytes: meta.extra,
                    physical_name: meta.name,
                });
                break;
            }
        }

        Ok(Self {
            source,
            marker,
            plain_names,
            unlocked: None,
        })
    }

    /// Whether the container carries an encrypted directory that has not
    /// been unlocked yet.
    pub fn is_locked(&self) -> bool {
        self.marker.is_some() && self.unlocked.is_none()
    }

    /// Verifies `password` and decrypts the directory.
    ///
    /// Fails with [`Error::WrongSecurityContext`] before touching any
    /// encrypted data when the password does not match. A no-op on an
    /// unencrypted container.
    pub fn unlock(&mut self, password: Password) -> Result<()> {
        let Some(marker) = self.marker.as_ref() else {
            return Ok(());
        };
        let hash = PasswordHash::derive(&marker.hash_bytes, password)?;

        let mut payload = EntryPayload::open(self.source.as_ref(), &marker.physical_name)?;
        let mut blob = Vec::new();
        payload.read_to_end(&mut blob).map_err(Error::from_io)?;

        let text = hash.decrypt(&blob)?;
        let text = std::str::from_utf8(&text)
            .map_err(|_| Error::MalformedMetadata("directory text is not valid UTF-8".into()))?;
        let contents = ContainerContents::decode(text)?;

        let header = contents.header().ok_or(Error::MissingHeader)?;
        let info = header
            .header_info()
            .ok_or(Error::MissingHeader)?;
        let keypair = hash.derive_keypair(&info.wrapped_secret, &info.public_key)?;
        let public = info.public_key.clone();

        debug!("unlocked directory with {} entries", contents.len());
        self.unlocked = Some(Unlocked {
            contents,
            keypair,
            public,
        });
        Ok(())
    }

    /// Lists the readable entries.
    ///
    /// Empty while an encrypted container is still locked: physical entry
    /// names are anonymous and the directory is unreadable.
    pub fn entries(&self) -> Vec<EntryInfo> {
        if let Some(unlocked) = &self.unlocked {
            return unlocked
                .contents
                .entries()
                .map(|e| EntryInfo {
                    name: e.file_name.clone(),
                    original_size: Some(e.original_size),
                    stored_size: Some(e.stored_size),
                })
                .collect();
        }
        if self.marker.is_some() {
            return Vec::new();
        }
        self.plain_names
            .iter()
            .map(|name| EntryInfo {
                name: name.clone(),
                original_size: None,
                stored_size: None,
            })
            .collect()
    }

    /// Opens a file stream by logical name.
    pub fn open(&self, name: &str) -> Result<FileReader> {
        if let Some(unlocked) = &self.unlocked {
            return self.open_encrypted(unlocked, name);
        }
        if self.marker.is_some() {
            return Err(Error::ProtocolViolation(
                "container is locked; unlock it first",
            ));
        }
        if !self.plain_names.iter().any(|n| n == name) {
            return Err(Error::EntryNotFound { name: name.into() });
        }
        let payload = EntryPayload::open(self.source.as_ref(), name)?;
        Ok(FileReader {
            chain: Some(Box::new(payload)),
        })
    }

    fn open_encrypted(&self, unlocked: &Unlocked, name: &str) -> Result<FileReader> {
        let entry = unlocked
            .contents
            .get(name)
            .ok_or_else(|| Error::EntryNotFound { name: name.into() })?;
        let info = entry
            .file_info()
            .ok_or_else(|| Error::MalformedMetadata("directory entry is not a file".into()))?;

        // Fail closed: no ciphertext is decrypted for an entry whose
        // metadata does not verify.
        let payload = info.signed_payload(name);
        if !KeyPair::verify(&unlocked.public, &payload, &info.signature) {
            warn!("signature check failed for entry '{name}'");
            return Err(Error::AuthenticationFailure { name: name.into() });
        }

        let stage_count = info.stages.len();
        let plain_digest = info
            .digests
            .last()
            .ok_or_else(|| Error::MalformedMetadata("entry carries no digests".into()))?;

        let mut chain: Box<dyn FileSource> = Box::new(EntryPayload::open(
            self.source.as_ref(),
            &entry.archive_name,
        )?);
        chain = Box::new(DigestReader::new(chain, info.digests[0].value.clone()));
        for (j, stage) in info.stages.iter().enumerate().rev() {
            let key = unlocked.keypair.unwrap_key(&stage.wrapped_key)?;
            if key.len() != stage.algorithm.key_len() {
                return Err(Error::CryptoFailure(format!(
                    "unwrapped stage key has length {}",
                    key.len()
                )));
            }
            let cipher = CipherBuffer::decrypt(stage.algorithm, &key, &stage.iv)?;
            chain = Box::new(DecryptReader::new(chain, cipher));
            if info.debug {
                chain = Box::new(DigestReader::new(chain, info.digests[1 + j].value.clone()));
            }
        }
        chain = Box::new(DecompressReader::new(chain)?);
        chain = Box::new(DigestReader::new(chain, plain_digest.value.clone()));

        debug!("opened entry '{name}' with {stage_count} stages");
        Ok(FileReader { chain: Some(chain) })
    }
}

/// An open file stream from a container.
///
/// Digest validation happens at [`close`][Self::close]; dropping the
/// stream closes it on a best-effort basis, losing any verdict.
pub struct FileReader {
    chain: Option<Box<dyn FileSource>>,
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader").finish_non_exhaustive()
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.chain.as_mut() {
            Some(chain) => chain.read(buf),
            None => Ok(0),
        }
    }
}

impl FileReader {
    /// Closes the stream, running every layer's validation.
    ///
    /// When the stream was read to its end, a digest mismatch surfaces
    /// here as [`Error::IntegrityViolation`]. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        let mut chain = match self.chain.take() {
            Some(chain) => chain,
            None => return Ok(()),
        };
        loop {
            match chain.close_stage()? {
                Some(next) => chain = next,
                None => return Ok(()),
            }
        }
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contents::EntryKind;
    use crate::vault::{MemoryVaultSource, VaultScan, VaultWriter};
    use crate::writer::ContainerWriter;
    use std::io::{Cursor, Write};

    /// Rewrites a container byte-for-byte except for the directory, whose
    /// file entries get one signature bit flipped. The directory is
    /// re-encrypted under the same password hash, so the rewritten
    /// container still unlocks.
    fn corrupt_signatures(bytes: Vec<u8>, password: &str) -> Vec<u8> {
        let mut scan = VaultScan::new(Cursor::new(bytes)).unwrap();
        let mut rebuilt = VaultWriter::new(Vec::new()).unwrap();
        while let Some(meta) = scan.next_entry().unwrap() {
            let mut payload = Vec::new();
            scan.read_to_end(&mut payload).unwrap();
            rebuilt.begin_entry(&meta.name, &meta.extra).unwrap();
            if meta.extra.is_empty() {
                rebuilt.write_frame(&payload).unwrap();
            } else {
                let hash = PasswordHash::derive(&meta.extra, Password::new(password)).unwrap();
                let text = hash.decrypt(&payload).unwrap();
                let contents =
                    ContainerContents::decode(std::str::from_utf8(&text).unwrap()).unwrap();
                let mut forged = ContainerContents::new();
                for entry in contents.entries() {
                    let mut entry = entry.clone();
                    if let EntryKind::File(info) = &mut entry.kind {
                        info.signature[0] ^= 1;
                    }
                    forged.insert(entry).unwrap();
                }
                forged.set_header(contents.header().unwrap().clone());
                let blob = hash.encrypt(forged.encode().as_bytes()).unwrap();
                rebuilt.write_frame(&blob).unwrap();
            }
            rebuilt.end_entry().unwrap();
        }
        rebuilt.finish().unwrap()
    }

    #[test]
    fn test_forged_entry_signature_fails_before_any_decryption() {
        let mut writer = ContainerWriter::new(Vec::new(), Some(Password::new("pw"))).unwrap();
        let mut file = writer.begin_file("guarded").unwrap();
        file.write_all(b"never released").unwrap();
        file.finish().unwrap();
        writer.close().unwrap();
        let bytes = writer.into_inner().unwrap();

        let forged = corrupt_signatures(bytes, "pw");
        let mut reader = ContainerReader::new(MemoryVaultSource::new(forged)).unwrap();
        // The password still matches and the directory still decodes; only
        // the entry signature is wrong.
        reader.unlock(Password::new("pw")).unwrap();
        assert_eq!(reader.entries().len(), 1);

        // Open itself fails: no stream exists, so no plaintext can leak.
        let err = reader.open("guarded").unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure { name } if name == "guarded"));
    }
}
