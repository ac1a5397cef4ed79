//! One directory entry and its property mapping.
//!
//! The directory distinguishes two entry kinds structurally: regular file
//! entries carry digests, stage keys and a signature; the single header
//! entry carries the container's key material. Using an enum makes
//! wrong-kind access impossible instead of merely unchecked.

use super::properties::EntryProperties;
use crate::crypto::SymAlgorithm;
use crate::{Error, Result};

/// One recorded digest: the hash value and the byte count it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Digest {
    pub(crate) value: Vec<u8>,
    pub(crate) length: u64,
}

/// One encryption stage: the algorithm, the wrapped key, and the clear IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StageKey {
    pub(crate) algorithm: SymAlgorithm,
    pub(crate) wrapped_key: Vec<u8>,
    pub(crate) iv: Vec<u8>,
}

/// Metadata of a regular (encrypted) file entry.
///
/// Digest order is: stored entry digest first, then one post-encryption
/// debug digest per stage when `debug` is set, then the plaintext digest
/// last. So a file has `2 + stages.len()` digests in debug mode and 2
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileInfo {
    pub(crate) digests: Vec<Digest>,
    pub(crate) stages: Vec<StageKey>,
    pub(crate) signature: Vec<u8>,
    pub(crate) debug: bool,
}

impl FileInfo {
    /// The byte string the entry signature covers: the logical name, every
    /// digest, and every stage's key material, all length-delimited.
    pub(crate) fn signed_payload(&self, file_name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        push_field(&mut out, file_name.as_bytes());
        for digest in &self.digests {
            push_field(&mut out, &digest.value);
            out.extend_from_slice(&digest.length.to_le_bytes());
        }
        for stage in &self.stages {
            out.extend_from_slice(&(stage.algorithm.id() as u64).to_le_bytes());
            push_field(&mut out, &stage.iv);
            push_field(&mut out, &stage.wrapped_key);
        }
        out
    }
}

fn push_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u64).to_le_bytes());
    out.extend_from_slice(field);
}

/// Metadata of the header entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeaderInfo {
    /// Clear public encoding (exchange + verifying key).
    pub(crate) public_key: Vec<u8>,
    /// Secret encoding, encrypted under the password hash.
    pub(crate) wrapped_secret: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EntryKind {
    File(FileInfo),
    Header(HeaderInfo),
}

/// One entry of the container directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContainerEntry {
    /// Logical name the caller knows the file by.
    pub(crate) file_name: String,
    /// Physical name of the backing store entry.
    pub(crate) archive_name: String,
    /// Plaintext length in bytes.
    pub(crate) original_size: u64,
    /// Stored (compressed + encrypted) length in bytes.
    pub(crate) stored_size: u64,
    pub(crate) kind: EntryKind,
}

impl ContainerEntry {
    pub(crate) fn file_info(&self) -> Option<&FileInfo> {
        match &self.kind {
            EntryKind::File(info) => Some(info),
            EntryKind::Header(_) => None,
        }
    }

    pub(crate) fn header_info(&self) -> Option<&HeaderInfo> {
        match &self.kind {
            EntryKind::Header(info) => Some(info),
            EntryKind::File(_) => None,
        }
    }

    pub(crate) fn to_properties(&self) -> EntryProperties {
        let mut props = EntryProperties::new();
        props.set_bytes("name", self.file_name.as_bytes());
        props.set_long("name", self.original_size as i64);
        props.set_bytes("store", self.archive_name.as_bytes());
        props.set_long("store", self.stored_size as i64);
        match &self.kind {
            EntryKind::File(info) => {
                for (i, digest) in info.digests.iter().enumerate() {
                    let key = format!("dig{i}");
                    props.set_bytes(&key, digest.value.clone());
                    props.set_long(&key, digest.length as i64);
                }
                for (i, stage) in info.stages.iter().enumerate() {
                    let key = format!("key{i}");
                    props.set_bytes(&key, stage.wrapped_key.clone());
                    props.set_long(&key, stage.algorithm.id());
                    props.set_bytes(&format!("iv{i}"), stage.iv.clone());
                }
                props.set_bytes("sign", info.signature.clone());
                props.set_long("debug", i64::from(info.debug));
            }
            EntryKind::Header(info) => {
                props.set_long("header", 1);
                props.set_bytes("public", info.public_key.clone());
                props.set_bytes("private", info.wrapped_secret.clone());
            }
        }
        props
    }

    pub(crate) fn from_properties(props: &EntryProperties) -> Result<Self> {
        let file_name = utf8(props.require_bytes("name")?, "name")?;
        let original_size = props.require_long("name")? as u64;
        let archive_name = utf8(props.require_bytes("store")?, "store")?;
        let stored_size = props.require_long("store")? as u64;

        let kind = if props.contains("header") {
            EntryKind::Header(HeaderInfo {
                public_key: props.require_bytes("public")?.to_vec(),
                wrapped_secret: props.require_bytes("private")?.to_vec(),
            })
        } else {
            let mut digests = Vec::new();
            while props.contains(&format!("dig{}", digests.len())) {
                let key = format!("dig{}", digests.len());
                digests.push(Digest {
                    value: props.require_bytes(&key)?.to_vec(),
                    length: props.require_long(&key)? as u64,
                });
            }
            let mut stages = Vec::new();
            while props.contains(&format!("key{}", stages.len())) {
                let i = stages.len();
                let key = format!("key{i}");
                let id = props.require_long(&key)?;
                let algorithm = SymAlgorithm::from_id(id).ok_or_else(|| {
                    Error::MalformedMetadata(format!("unknown algorithm id {id}"))
                })?;
                stages.push(StageKey {
                    algorithm,
                    wrapped_key: props.require_bytes(&key)?.to_vec(),
                    iv: props.require_bytes(&format!("iv{i}"))?.to_vec(),
                });
            }
            let debug = props.require_long("debug")? != 0;
            let info = FileInfo {
                digests,
                stages,
                signature: props.require_bytes("sign")?.to_vec(),
                debug,
            };
            let expected = if debug { 2 + info.stages.len() } else { 2 };
            if info.digests.len() != expected {
                return Err(Error::MalformedMetadata(format!(
                    "entry '{file_name}' carries {} digests, expected {expected}",
                    info.digests.len()
                )));
            }
            EntryKind::File(info)
        };

        Ok(Self {
            file_name,
            archive_name,
            original_size,
            stored_size,
            kind,
        })
    }
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::MalformedMetadata(format!("property '{what}' is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file_entry(debug: bool) -> ContainerEntry {
        let stages = vec![
            StageKey {
                algorithm: SymAlgorithm::Aes256Cbc,
                wrapped_key: vec![1; 80],
                iv: vec![2; 16],
            },
            StageKey {
                algorithm: SymAlgorithm::ChaCha20,
                wrapped_key: vec![3; 80],
                iv: vec![4; 12],
            },
        ];
        let digest_count = if debug { 2 + stages.len() } else { 2 };
        let digests = (0..digest_count)
            .map(|i| Digest {
                value: vec![i as u8; 32],
                length: 1000 + i as u64,
            })
            .collect();
        ContainerEntry {
            file_name: "report.txt".into(),
            archive_name: "DataFile1".into(),
            original_size: 4096,
            stored_size: 2048,
            kind: EntryKind::File(FileInfo {
                digests,
                stages,
                signature: vec![9; 64],
                debug,
            }),
        }
    }

    #[test]
    fn test_file_entry_roundtrip() {
        for debug in [false, true] {
            let entry = sample_file_entry(debug);
            let decoded = ContainerEntry::from_properties(&entry.to_properties()).unwrap();
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn test_header_entry_roundtrip() {
        let entry = ContainerEntry {
            file_name: "header".into(),
            archive_name: "DataFile3".into(),
            original_size: 0,
            stored_size: 128,
            kind: EntryKind::Header(HeaderInfo {
                public_key: vec![5; 64],
                wrapped_secret: vec![6; 96],
            }),
        };
        let decoded = ContainerEntry::from_properties(&entry.to_properties()).unwrap();
        assert_eq!(decoded, entry);
        assert!(decoded.header_info().is_some());
        assert!(decoded.file_info().is_none());
    }

    #[test]
    fn test_digest_count_validated() {
        let mut entry = sample_file_entry(true);
        if let EntryKind::File(info) = &mut entry.kind {
            info.digests.pop();
        }
        let err = ContainerEntry::from_properties(&entry.to_properties()).unwrap_err();
        assert!(matches!(err, Error::MalformedMetadata(_)));
    }

    #[test]
    fn test_missing_signature_rejected() {
        let props = EntryProperties::decode("name=61!0/store=62!0/debug=!0").unwrap();
        let err = ContainerEntry::from_properties(&props).unwrap_err();
        assert!(matches!(err, Error::MalformedMetadata(_)));
    }

    #[test]
    fn test_signed_payload_binds_every_field() {
        let entry = sample_file_entry(false);
        let info = entry.file_info().unwrap();
        let base = info.signed_payload(&entry.file_name);

        assert_ne!(base, info.signed_payload("other.txt"));

        let mut tampered = info.clone();
        tampered.digests[0].value[0] ^= 1;
        assert_ne!(base, tampered.signed_payload(&entry.file_name));

        let mut tampered = info.clone();
        tampered.stages[1].iv[0] ^= 1;
        assert_ne!(base, tampered.signed_payload(&entry.file_name));

        let mut tampered = info.clone();
        tampered.stages[0].wrapped_key[0] ^= 1;
        assert_ne!(base, tampered.signed_payload(&entry.file_name));
    }
}
