//! The container directory.
//!
//! The directory maps logical names to entries, keeps them in sorted name
//! order so encoding is deterministic, and holds the single header entry
//! apart from the files. Its encoded form joins entry property strings with
//! `;`, header last; the whole string is what gets encrypted under the
//! password hash and stored in the container.

use std::collections::BTreeMap;

use super::entry::{ContainerEntry, EntryKind};
use super::properties::EntryProperties;
use crate::{Error, Result};

const ENTRY_SEP: char = ';';

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ContainerContents {
    files: BTreeMap<String, ContainerEntry>,
    header: Option<ContainerEntry>,
}

impl ContainerContents {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a file entry; logical names must be unique.
    pub(crate) fn insert(&mut self, entry: ContainerEntry) -> Result<()> {
        debug_assert!(matches!(entry.kind, EntryKind::File(_)));
        if self.files.contains_key(&entry.file_name) {
            return Err(Error::DuplicateEntry {
                name: entry.file_name,
            });
        }
        self.files.insert(entry.file_name.clone(), entry);
        Ok(())
    }

    /// Installs the header entry.
    pub(crate) fn set_header(&mut self, entry: ContainerEntry) {
        debug_assert!(matches!(entry.kind, EntryKind::Header(_)));
        self.header = Some(entry);
    }

    pub(crate) fn get(&self, name: &str) -> Option<&ContainerEntry> {
        self.files.get(name)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub(crate) fn header(&self) -> Option<&ContainerEntry> {
        self.header.as_ref()
    }

    /// File entries in name order; the header is not included.
    pub(crate) fn entries(&self) -> impl Iterator<Item = &ContainerEntry> {
        self.files.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.files.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Encodes the directory; the header entry always comes last.
    pub(crate) fn encode(&self) -> String {
        let mut parts: Vec<String> = self
            .files
            .values()
            .map(|e| e.to_properties().encode())
            .collect();
        if let Some(header) = &self.header {
            parts.push(header.to_properties().encode());
        }
        parts.join(&ENTRY_SEP.to_string())
    }

    pub(crate) fn decode(text: &str) -> Result<Self> {
        let mut contents = Self::new();
        if text.is_empty() {
            return Ok(contents);
        }
        for part in text.split(ENTRY_SEP) {
            let entry = ContainerEntry::from_properties(&EntryProperties::decode(part)?)?;
            match entry.kind {
                EntryKind::File(_) => contents.insert(entry)?,
                EntryKind::Header(_) => {
                    if contents.header.is_some() {
                        return Err(Error::MalformedMetadata(
                            "directory carries more than one header entry".into(),
                        ));
                    }
                    contents.header = Some(entry);
                }
            }
        }
        Ok(contents)
    }
}
