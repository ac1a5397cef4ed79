//! Cryptographic components for the secure container.
//!
//! This module provides the symmetric algorithm set used for per-file stage
//! encryption, the [`CipherBuffer`] adapter that exposes incremental
//! `update`/`finish` semantics over a growable output buffer, the container
//! key pair (key wrap + signatures), and the password-hash component.
//!
//! Every file in an encrypted container is protected by a randomly chosen
//! *chain* of symmetric stages; varying the algorithm and stage count per
//! file reduces the value of compromising any single algorithm.

mod cipher;
mod keys;
mod password;
mod picker;

pub use keys::KeyPair;
pub use password::{HASH_LEN, Password, PasswordHash};
pub use picker::{FixedPicker, MAX_STAGES, MIN_STAGES, RandomPicker, StagePicker};

pub(crate) use cipher::{BLOCK_SIZE, cbc_decrypt, cbc_encrypt};

use crate::Result;

/// A symmetric encryption algorithm usable as one stage of a file's
/// encryption chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SymAlgorithm {
    /// AES-256 in CBC mode with PKCS7 padding.
    Aes256Cbc,
    /// AES-256 in CTR mode (big-endian 128-bit counter).
    Aes256Ctr,
    /// ChaCha20 stream cipher.
    ChaCha20,
}

impl SymAlgorithm {
    /// All supported algorithms, in stable id order.
    pub const ALL: [SymAlgorithm; 3] = [
        SymAlgorithm::Aes256Cbc,
        SymAlgorithm::Aes256Ctr,
        SymAlgorithm::ChaCha20,
    ];

    /// Stable wire identifier recorded in entry metadata.
    pub fn id(self) -> i64 {
        match self {
            SymAlgorithm::Aes256Cbc => 1,
            SymAlgorithm::Aes256Ctr => 2,
            SymAlgorithm::ChaCha20 => 3,
        }
    }

    /// Looks an algorithm up by its wire identifier.
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(SymAlgorithm::Aes256Cbc),
            2 => Some(SymAlgorithm::Aes256Ctr),
            3 => Some(SymAlgorithm::ChaCha20),
            _ => None,
        }
    }

    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        32
    }

    /// Initialization-vector length in bytes.
    pub fn iv_len(self) -> usize {
        match self {
            SymAlgorithm::Aes256Cbc | SymAlgorithm::Aes256Ctr => 16,
            SymAlgorithm::ChaCha20 => 12,
        }
    }
}

/// A stream-cipher context paired with a single reusable output buffer.
///
/// `update` grows the buffer to the cipher's worst-case output size for the
/// given input and returns the byte count actually produced (block ciphers
/// buffer partial blocks internally, so this may be less). `finish` flushes
/// the cipher's buffered tail. Produced bytes are read back through
/// [`CipherBuffer::buffer`].
///
/// The adapter performs no cryptographic decisions of its own; any failure
/// from the underlying cipher surfaces as [`crate::Error::CryptoFailure`].
pub(crate) struct CipherBuffer {
    ctx: Box<dyn cipher::CipherCtx>,
    buffer: Vec<u8>,
}

impl CipherBuffer {
    /// Creates an adapter around an encryption context.
    pub(crate) fn encrypt(algorithm: SymAlgorithm, key: &[u8], iv: &[u8]) -> Result<Self> {
        Ok(Self {
            ctx: cipher::encrypt_ctx(algorithm, key, iv)?,
            buffer: Vec::new(),
        })
    }

    /// Creates an adapter around a decryption context.
    pub(crate) fn decrypt(algorithm: SymAlgorithm, key: &[u8], iv: &[u8]) -> Result<Self> {
        Ok(Self {
            ctx: cipher::decrypt_ctx(algorithm, key, iv)?,
            buffer: Vec::new(),
        })
    }

    /// Feeds `input` to the cipher, returning the number of bytes produced.
    pub(crate) fn update(&mut self, input: &[u8]) -> Result<usize> {
        self.reserve(self.ctx.output_len(input.len()));
        self.ctx.update(input, &mut self.buffer)
    }

    /// Flushes the cipher's buffered tail, returning the bytes produced.
    pub(crate) fn finish(&mut self) -> Result<usize> {
        self.reserve(self.ctx.output_len(0) + BLOCK_SIZE);
        self.ctx.finish(&mut self.buffer)
    }

    /// The shared output buffer; only the prefix reported by the last
    /// `update`/`finish` call is valid.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    fn reserve(&mut self, len: usize) {
        if self.buffer.len() < len {
            self.buffer.resize(len, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_id_roundtrip() {
        for algorithm in SymAlgorithm::ALL {
            assert_eq!(SymAlgorithm::from_id(algorithm.id()), Some(algorithm));
        }
        assert_eq!(SymAlgorithm::from_id(0), None);
        assert_eq!(SymAlgorithm::from_id(99), None);
    }

    #[test]
    fn test_iv_lengths() {
        assert_eq!(SymAlgorithm::Aes256Cbc.iv_len(), 16);
        assert_eq!(SymAlgorithm::Aes256Ctr.iv_len(), 16);
        assert_eq!(SymAlgorithm::ChaCha20.iv_len(), 12);
    }

    #[test]
    fn test_cipher_buffer_roundtrip() {
        let key = [5u8; 32];
        let iv = [6u8; 16];
        let data = b"cipher buffer adapter roundtrip payload";

        let mut enc = CipherBuffer::encrypt(SymAlgorithm::Aes256Cbc, &key, &iv).unwrap();
        let mut ciphertext = Vec::new();
        let n = enc.update(data).unwrap();
        ciphertext.extend_from_slice(&enc.buffer()[..n]);
        let n = enc.finish().unwrap();
        ciphertext.extend_from_slice(&enc.buffer()[..n]);

        let mut dec = CipherBuffer::decrypt(SymAlgorithm::Aes256Cbc, &key, &iv).unwrap();
        let mut plaintext = Vec::new();
        let n = dec.update(&ciphertext).unwrap();
        plaintext.extend_from_slice(&dec.buffer()[..n]);
        let n = dec.finish().unwrap();
        plaintext.extend_from_slice(&dec.buffer()[..n]);

        assert_eq!(plaintext, data);
    }

    #[test]
    fn test_cipher_buffer_grows_and_is_reused() {
        let key = [5u8; 32];
        let iv = [6u8; 16];
        let mut enc = CipherBuffer::encrypt(SymAlgorithm::Aes256Ctr, &key, &iv).unwrap();
        enc.update(&[0u8; 8]).unwrap();
        let small = enc.buffer().len();
        enc.update(&[0u8; 4096]).unwrap();
        let large = enc.buffer().len();
        assert!(large >= 4096 && large >= small);
        // A smaller follow-up update must not shrink the buffer.
        enc.update(&[0u8; 8]).unwrap();
        assert_eq!(enc.buffer().len(), large);
    }
}
