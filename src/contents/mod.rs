//! The container directory model and its text codec.
//!
//! The directory describes every entry in the container. It is never stored
//! in the clear: the writer encodes it to text, encrypts it under the
//! password hash, and stores the result as the final physical entry.

mod contents;
mod entry;
mod properties;

pub(crate) use contents::ContainerContents;
pub(crate) use entry::{ContainerEntry, Digest, EntryKind, FileInfo, HeaderInfo, StageKey};
