//! # gordian
//!
//! A password-protected secure container format with layered stream
//! encryption.
//!
//! Every file written to a container runs through its own pipeline: a
//! plaintext digest, LZMA compression on a background thread, a randomly
//! chosen chain of two to four symmetric encryption stages (AES-256-CBC,
//! AES-256-CTR, ChaCha20), and a ciphertext digest. Per-file stage keys are
//! wrapped under the container's x25519 key; entry metadata is signed with
//! its ed25519 key; and the directory tying it all together is encrypted
//! under an Argon2id password hash. The physical layer stores entries under
//! anonymous names, so a container without its password reveals nothing but
//! sizes.
//!
//! ## Quick Start
//!
//! ### Writing a Container
//!
//! ```rust,no_run
//! use std::io::Write;
//! use gordian::{ContainerWriter, Password, Result};
//!
//! fn main() -> Result<()> {
//!     let mut writer =
//!         ContainerWriter::create_path("backup.gkn", Some(Password::new("secret")))?;
//!
//!     let mut file = writer.begin_file("notes.txt")?;
//!     file.write_all(b"Hello, World!")?;
//!     file.finish()?;
//!
//!     writer.close()?;
//!     Ok(())
//! }
//! ```
//!
//! ### Reading a Container
//!
//! ```rust,no_run
//! use std::io::Read;
//! use gordian::{ContainerReader, Password, Result};
//!
//! fn main() -> Result<()> {
//!     let mut reader = ContainerReader::open_path("backup.gkn")?;
//!     reader.unlock(Password::new("secret"))?;
//!
//!     for entry in reader.entries() {
//!         println!("{}: {:?} bytes", entry.name, entry.original_size);
//!     }
//!
//!     let mut file = reader.open("notes.txt")?;
//!     let mut data = Vec::new();
//!     file.read_to_end(&mut data)?;
//!     // Digest validation runs at close.
//!     file.close()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Security Model
//!
//! - A wrong password fails closed before any data is decrypted
//!   ([`Error::WrongSecurityContext`]).
//! - Entry metadata is signature-checked before the first ciphertext byte
//!   is decrypted ([`Error::AuthenticationFailure`]).
//! - Payload corruption is caught by digests when a stream is read to its
//!   end and closed ([`Error::IntegrityViolation`]).

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod contents;
mod error;
mod reader;
mod stream;
mod vault;
mod writer;

pub mod crypto;

pub use error::{Error, Result};
pub use reader::{ContainerReader, EntryInfo, FileReader};
pub use vault::{FileVaultSource, MemoryVaultSource, VaultSource};
pub use writer::{ContainerWriter, FileWriter};

// The most commonly used crypto types, at the crate root.
pub use crypto::{FixedPicker, Password, RandomPicker, StagePicker, SymAlgorithm};
