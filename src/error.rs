//! Error types for secure container operations.
//!
//! This module provides the [`Error`] enum which represents all possible
//! failure modes when writing or reading a container, along with a convenient
//! [`Result<T>`] type alias.
//!
//! # Error Handling
//!
//! All fallible operations in this crate return `Result<T, Error>`:
//!
//! ```rust,no_run
//! use gordian::{ContainerReader, Password, Result};
//!
//! fn unlock_archive(path: &str, password: &str) -> Result<()> {
//!     let mut reader = ContainerReader::open_path(path)?;
//!     reader.unlock(Password::new(password))?;
//!     Ok(())
//! }
//! ```
//!
//! A wrong password surfaces as [`Error::WrongSecurityContext`] before any
//! file content is touched; tampering surfaces as
//! [`Error::AuthenticationFailure`] (caught by signature, before decryption)
//! or [`Error::IntegrityViolation`] (caught by digest, at stream close).

use std::io;

/// The main error type for container operations.
///
/// # Error Categories
///
/// | Category | Variants | Typical Cause |
/// |----------|----------|---------------|
/// | I/O | [`Io`][Self::Io] | File system operations |
/// | Format | [`MalformedMetadata`][Self::MalformedMetadata], [`MissingHeader`][Self::MissingHeader] | Invalid container data |
/// | Misuse | [`ProtocolViolation`][Self::ProtocolViolation], [`DuplicateEntry`][Self::DuplicateEntry] | Caller errors |
/// | Security | [`WrongSecurityContext`][Self::WrongSecurityContext], [`AuthenticationFailure`][Self::AuthenticationFailure] | Security checks |
/// | Integrity | [`IntegrityViolation`][Self::IntegrityViolation] | Data corruption |
/// | Crypto | [`CryptoFailure`][Self::CryptoFailure] | Provider failures |
/// | Compression | [`CompressionFailure`][Self::CompressionFailure] | Codec worker failures |
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred during container operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The metadata text (or the physical container framing) failed to parse.
    ///
    /// This is fatal: the container is unusable.
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    /// The caller misused the writer or reader state machine.
    ///
    /// Examples: opening a second file stream while one is live, or writing
    /// after close. This is a programming error, not a data error.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The supplied password hash does not match the container's recorded
    /// hash.
    ///
    /// Recoverable: the caller may retry with a different password.
    #[error("password hash does not match the container's security context")]
    WrongSecurityContext,

    /// A digest failed to validate at stream close.
    ///
    /// Fatal for that file; other entries in the container may still be
    /// valid.
    #[error("integrity violation: digest mismatch (expected {expected}, got {actual})")]
    IntegrityViolation {
        /// The expected digest, hex-encoded.
        expected: String,
        /// The digest computed over the bytes actually read, hex-encoded.
        actual: String,
    },

    /// An entry's signature check failed before decryption began.
    ///
    /// Fail-closed: no plaintext is ever released for this entry.
    #[error("authentication failure: signature check failed for entry '{name}'")]
    AuthenticationFailure {
        /// The logical name of the rejected entry.
        name: String,
    },

    /// A cryptographic provider operation failed.
    #[error("cryptographic failure: {0}")]
    CryptoFailure(String),

    /// The compression codec failed on its worker thread.
    ///
    /// Worker errors are captured and re-raised on the next caller-visible
    /// operation rather than crashing the worker silently.
    #[error("compression failure: {0}")]
    CompressionFailure(String),

    /// The decrypted container directory carried no header entry.
    #[error("container directory carries no header entry")]
    MissingHeader,

    /// An entry was not found in the container's directory.
    #[error("entry not found: {name}")]
    EntryNotFound {
        /// The logical name that was not found.
        name: String,
    },

    /// An entry with the same logical name already exists.
    #[error("entry already exists: {name}")]
    DuplicateEntry {
        /// The colliding logical name.
        name: String,
    },
}

impl Error {
    /// Returns `true` if this error might be recoverable.
    ///
    /// Recoverable errors are those where the operation could potentially
    /// succeed if tried again with different parameters:
    ///
    /// - `WrongSecurityContext`: retry with a different password
    /// - `Io` (transient kinds only): `WouldBlock`, `Interrupted`, `TimedOut`
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::WrongSecurityContext => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns `true` if this is a data corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::IntegrityViolation { .. } | Error::MalformedMetadata(_)
        )
    }

    /// Returns `true` if this error indicates a failed security check.
    pub fn is_security_error(&self) -> bool {
        matches!(
            self,
            Error::WrongSecurityContext | Error::AuthenticationFailure { .. }
        )
    }

    /// Wraps this error so it can travel through a `std::io` boundary.
    ///
    /// Stream layers implement `Read`/`Write`, whose methods return
    /// `io::Result`; [`Error::from_io`] recovers the original on the other
    /// side.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(e) => e,
            other => io::Error::other(other),
        }
    }

    /// Recovers a crate error smuggled through an `io::Error`, if any.
    pub(crate) fn from_io(e: io::Error) -> Error {
        match e.downcast::<Error>() {
            Ok(inner) => inner,
            Err(e) => Error::Io(e),
        }
    }
}

/// A specialized Result type for container operations.
pub type Result<T> = std::result::Result<T, Error>;
