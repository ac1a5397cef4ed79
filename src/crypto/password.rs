//! Password handling and the container's password hash.
//!
//! A [`PasswordHash`] splits 64 bytes of Argon2id output in two: the first
//! half is the *verification tag*, stored in the container so a reader can
//! check a candidate password without decrypting anything; the second half
//! is the *working secret*, never stored, used to encrypt the container
//! directory and the wrapped private keys.
//!
//! The stored form ("hash bytes") is `version || salt || tag`. An attacker
//! holding the container learns the salt and the tag but not the working
//! secret, since Argon2id output halves are independent.

use std::fmt;

use argon2::Argon2;
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::cipher::{self, BLOCK_SIZE};
use super::keys::KeyPair;
use crate::{Error, Result};

const SALT_LEN: usize = 16;
const TAG_LEN: usize = 32;
const SECRET_LEN: usize = 32;
const VERSION: u8 = 1;

/// Stored length of the hash bytes: version, salt, verification tag.
pub const HASH_LEN: usize = 1 + SALT_LEN + TAG_LEN;

/// A password for protecting containers.
///
/// The inner string is zeroized on drop and redacted from `Debug` output.
#[derive(Clone)]
pub struct Password(Zeroizing<String>);

impl Password {
    /// Creates a password from a string.
    pub fn new(password: impl Into<String>) -> Self {
        Self(Zeroizing::new(password.into()))
    }

    /// The password's UTF-8 bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

impl From<&str> for Password {
    fn from(password: &str) -> Self {
        Self::new(password)
    }
}

/// The derived security context of one container.
///
/// Holds the password (for [`reseed`][Self::reseed]), the salt, the stored
/// verification tag, and the never-stored working secret.
pub struct PasswordHash {
    password: Password,
    salt: [u8; SALT_LEN],
    tag: [u8; TAG_LEN],
    secret: Zeroizing<[u8; SECRET_LEN]>,
}

impl PasswordHash {
    /// Derives a fresh hash under a random salt, for writing a new container.
    pub fn random(password: Password) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self::from_salt(password, salt)
    }

    /// Re-derives a hash from the container's recorded hash bytes and a
    /// candidate password.
    ///
    /// Fails with [`Error::WrongSecurityContext`] when the candidate's tag
    /// does not match the recorded one; no decryption is attempted first.
    pub fn derive(recorded: &[u8], password: Password) -> Result<Self> {
        if recorded.len() != HASH_LEN {
            return Err(Error::MalformedMetadata(format!(
                "password hash bytes have length {}, expected {HASH_LEN}",
                recorded.len()
            )));
        }
        if recorded[0] != VERSION {
            return Err(Error::MalformedMetadata(format!(
                "unsupported password hash version {}",
                recorded[0]
            )));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&recorded[1..1 + SALT_LEN]);
        let hash = Self::from_salt(password, salt)?;
        if !bool::from(hash.tag.as_slice().ct_eq(&recorded[1 + SALT_LEN..])) {
            return Err(Error::WrongSecurityContext);
        }
        Ok(hash)
    }

    fn from_salt(password: Password, salt: [u8; SALT_LEN]) -> Result<Self> {
        let mut output = Zeroizing::new([0u8; TAG_LEN + SECRET_LEN]);
        Argon2::default()
            .hash_password_into(password.as_bytes(), &salt, output.as_mut())
            .map_err(|e| Error::CryptoFailure(format!("password hashing failed: {e}")))?;

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&output[..TAG_LEN]);
        let mut secret = Zeroizing::new([0u8; SECRET_LEN]);
        secret.copy_from_slice(&output[TAG_LEN..]);
        Ok(Self {
            password,
            salt,
            tag,
            secret,
        })
    }

    /// The stored form: `version || salt || tag`.
    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_LEN);
        out.push(VERSION);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Encrypts `plain` under the working secret with a random IV.
    ///
    /// Output is `iv || ciphertext` (AES-256-CBC, PKCS7).
    pub(crate) fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; BLOCK_SIZE];
        OsRng.fill_bytes(&mut iv);
        let mut out = Vec::with_capacity(BLOCK_SIZE + plain.len() + BLOCK_SIZE);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&cipher::cbc_encrypt(&self.secret, &iv, plain)?);
        Ok(out)
    }

    /// Decrypts an `iv || ciphertext` blob produced by [`encrypt`][Self::encrypt].
    pub(crate) fn decrypt(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if data.len() < BLOCK_SIZE * 2 || (data.len() - BLOCK_SIZE) % BLOCK_SIZE != 0 {
            return Err(Error::MalformedMetadata(format!(
                "encrypted blob has invalid length {}",
                data.len()
            )));
        }
        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&data[..BLOCK_SIZE]);
        Ok(Zeroizing::new(cipher::cbc_decrypt(
            &self.secret,
            &iv,
            &data[BLOCK_SIZE..],
        )?))
    }

    /// Decrypts a wrapped key-pair secret and reconstructs the pair.
    pub(crate) fn derive_keypair(&self, wrapped_secret: &[u8], public: &[u8]) -> Result<KeyPair> {
        let secret = self.decrypt(wrapped_secret)?;
        KeyPair::from_parts(&secret, public)
    }

    /// Re-randomizes the salt and re-derives, so a future container written
    /// with this hash shares nothing with the one just closed.
    pub(crate) fn reseed(&mut self) -> Result<()> {
        *self = Self::random(self.password.clone())?;
        Ok(())
    }
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordHash")
            .field("salt", &hex::encode(self.salt))
            .field("tag", &hex::encode(self.tag))
            .finish_non_exhaustive()
    }
}
