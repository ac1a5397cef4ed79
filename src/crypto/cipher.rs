//! Per-algorithm stream-cipher contexts with `update`/`finish` semantics.
//!
//! Each context transforms input incrementally. Block-mode contexts (CBC)
//! buffer partial blocks internally, so an `update` may produce fewer bytes
//! than the worst case; `finish` flushes the buffered tail. Pure stream
//! contexts (CTR, ChaCha20) are one-to-one and produce nothing at `finish`.

use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};

use super::SymAlgorithm;
use crate::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// AES block size in bytes.
pub(crate) const BLOCK_SIZE: usize = 16;

impl std::fmt::Debug for dyn CipherCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherCtx")
    }
}

/// One incremental symmetric transformation.
pub(crate) trait CipherCtx: Send {
    /// Worst-case output size for `input_len` more input bytes.
    fn output_len(&self, input_len: usize) -> usize;

    /// Feeds `input`, writing produced bytes into `out`.
    ///
    /// `out` must hold at least `output_len(input.len())` bytes. Returns the
    /// number of bytes actually produced, which may be less than the worst
    /// case when the cipher buffers a partial block.
    fn update(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize>;

    /// Flushes any internally buffered partial block into `out`.
    fn finish(&mut self, out: &mut [u8]) -> Result<usize>;
}

/// Builds an encryption context for `algorithm`.
pub(crate) fn encrypt_ctx(
    algorithm: SymAlgorithm,
    key: &[u8],
    iv: &[u8],
) -> Result<Box<dyn CipherCtx>> {
    check_lengths(algorithm, key, iv)?;
    Ok(match algorithm {
        SymAlgorithm::Aes256Cbc => Box::new(CbcEncryptCtx::new(key, iv)),
        SymAlgorithm::Aes256Ctr => Box::new(KeystreamCtx::aes_ctr(key, iv)),
        SymAlgorithm::ChaCha20 => Box::new(KeystreamCtx::chacha20(key, iv)),
    })
}

/// Builds a decryption context for `algorithm`.
pub(crate) fn decrypt_ctx(
    algorithm: SymAlgorithm,
    key: &[u8],
    iv: &[u8],
) -> Result<Box<dyn CipherCtx>> {
    check_lengths(algorithm, key, iv)?;
    Ok(match algorithm {
        SymAlgorithm::Aes256Cbc => Box::new(CbcDecryptCtx::new(key, iv)),
        // Keystream ciphers decrypt by re-applying the same keystream.
        SymAlgorithm::Aes256Ctr => Box::new(KeystreamCtx::aes_ctr(key, iv)),
        SymAlgorithm::ChaCha20 => Box::new(KeystreamCtx::chacha20(key, iv)),
    })
}

fn check_lengths(algorithm: SymAlgorithm, key: &[u8], iv: &[u8]) -> Result<()> {
    if key.len() != algorithm.key_len() {
        return Err(Error::CryptoFailure(format!(
            "{algorithm:?} requires a {}-byte key, got {}",
            algorithm.key_len(),
            key.len()
        )));
    }
    if iv.len() != algorithm.iv_len() {
        return Err(Error::CryptoFailure(format!(
            "{algorithm:?} requires a {}-byte IV, got {}",
            algorithm.iv_len(),
            iv.len()
        )));
    }
    Ok(())
}

/// AES-256-CBC encryption with PKCS7 padding on the final block.
///
/// Complete blocks are encrypted as they accumulate; the IV chains through
/// the last ciphertext block of each span.
struct CbcEncryptCtx {
    key: [u8; 32],
    iv: [u8; BLOCK_SIZE],
    pending: Vec<u8>,
}

impl CbcEncryptCtx {
    fn new(key: &[u8], iv: &[u8]) -> Self {
        let mut k = [0u8; 32];
        k.copy_from_slice(key);
        let mut v = [0u8; BLOCK_SIZE];
        v.copy_from_slice(iv);
        Self {
            key: k,
            iv: v,
            pending: Vec::new(),
        }
    }

    fn encrypt_blocks(&mut self, data: &mut [u8]) -> Result<()> {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len();
        let encryptor = Aes256CbcEnc::new(&self.key.into(), &self.iv.into());
        encryptor
            .encrypt_padded_mut::<NoPadding>(data, len)
            .map_err(|e| Error::CryptoFailure(e.to_string()))?;
        self.iv.copy_from_slice(&data[len - BLOCK_SIZE..]);
        Ok(())
    }
}

impl CipherCtx for CbcEncryptCtx {
    fn output_len(&self, input_len: usize) -> usize {
        // Buffered bytes plus input, rounded up one block for the pad.
        self.pending.len() + input_len + BLOCK_SIZE
    }

    fn update(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize> {
        self.pending.extend_from_slice(input);
        let complete = (self.pending.len() / BLOCK_SIZE) * BLOCK_SIZE;
        if complete == 0 {
            return Ok(0);
        }
        out[..complete].copy_from_slice(&self.pending[..complete]);
        self.encrypt_blocks(&mut out[..complete])?;
        self.pending.drain(..complete);
        Ok(complete)
    }

    fn finish(&mut self, out: &mut [u8]) -> Result<usize> {
        // PKCS7: always emit at least one padded block.
        let pad = BLOCK_SIZE - (self.pending.len() % BLOCK_SIZE);
        self.pending
            .extend(std::iter::repeat_n(pad as u8, pad));
        let len = self.pending.len();
        out[..len].copy_from_slice(&self.pending);
        self.encrypt_blocks(&mut out[..len])?;
        self.pending.clear();
        Ok(len)
    }
}

/// AES-256-CBC decryption with PKCS7 stripping on the final block.
///
/// One complete block is always held back: until end of input it is unknown
/// which block carries the padding.
struct CbcDecryptCtx {
    key: [u8; 32],
    iv: [u8; BLOCK_SIZE],
    pending: Vec<u8>,
}

impl CbcDecryptCtx {
    fn new(key: &[u8], iv: &[u8]) -> Self {
        let mut k = [0u8; 32];
        k.copy_from_slice(key);
        let mut v = [0u8; BLOCK_SIZE];
        v.copy_from_slice(iv);
        Self {
            key: k,
            iv: v,
            pending: Vec::new(),
        }
    }

    fn decrypt_blocks(&mut self, data: &mut [u8]) -> Result<()> {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len();
        let mut next_iv = [0u8; BLOCK_SIZE];
        next_iv.copy_from_slice(&data[len - BLOCK_SIZE..]);
        let decryptor = Aes256CbcDec::new(&self.key.into(), &self.iv.into());
        decryptor
            .decrypt_padded_mut::<NoPadding>(data)
            .map_err(|e| Error::CryptoFailure(e.to_string()))?;
        self.iv = next_iv;
        Ok(())
    }
}

impl CipherCtx for CbcDecryptCtx {
    fn output_len(&self, input_len: usize) -> usize {
        self.pending.len() + input_len
    }

    fn update(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize> {
        self.pending.extend_from_slice(input);
        let blocks = self.pending.len() / BLOCK_SIZE;
        if blocks <= 1 {
            return Ok(0);
        }
        let usable = (blocks - 1) * BLOCK_SIZE;
        out[..usable].copy_from_slice(&self.pending[..usable]);
        self.decrypt_blocks(&mut out[..usable])?;
        self.pending.drain(..usable);
        Ok(usable)
    }

    fn finish(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.pending.len() != BLOCK_SIZE {
            return Err(Error::CryptoFailure(format!(
                "ciphertext truncated: {} trailing bytes, expected one {BLOCK_SIZE}-byte block",
                self.pending.len()
            )));
        }
        out[..BLOCK_SIZE].copy_from_slice(&self.pending);
        self.decrypt_blocks(&mut out[..BLOCK_SIZE])?;
        self.pending.clear();

        let pad = out[BLOCK_SIZE - 1] as usize;
        if pad == 0 || pad > BLOCK_SIZE {
            return Err(Error::CryptoFailure("invalid PKCS7 padding".into()));
        }
        if out[BLOCK_SIZE - pad..BLOCK_SIZE].iter().any(|&b| b != pad as u8) {
            return Err(Error::CryptoFailure("invalid PKCS7 padding".into()));
        }
        Ok(BLOCK_SIZE - pad)
    }
}

/// One-to-one keystream transformation (AES-256-CTR or ChaCha20).
struct KeystreamCtx {
    cipher: KeystreamKind,
}

enum KeystreamKind {
    AesCtr(Aes256Ctr),
    ChaCha(chacha20::ChaCha20),
}

impl KeystreamCtx {
    fn aes_ctr(key: &[u8], iv: &[u8]) -> Self {
        // Lengths were validated by `check_lengths`.
        Self {
            cipher: KeystreamKind::AesCtr(
                Aes256Ctr::new_from_slices(key, iv).expect("validated key/iv lengths"),
            ),
        }
    }

    fn chacha20(key: &[u8], iv: &[u8]) -> Self {
        Self {
            cipher: KeystreamKind::ChaCha(
                chacha20::ChaCha20::new_from_slices(key, iv).expect("validated key/iv lengths"),
            ),
        }
    }
}

impl CipherCtx for KeystreamCtx {
    fn output_len(&self, input_len: usize) -> usize {
        input_len
    }

    fn update(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize> {
        let n = input.len();
        out[..n].copy_from_slice(input);
        match &mut self.cipher {
            KeystreamKind::AesCtr(c) => c.apply_keystream(&mut out[..n]),
            KeystreamKind::ChaCha(c) => c.apply_keystream(&mut out[..n]),
        }
        Ok(n)
    }

    fn finish(&mut self, _out: &mut [u8]) -> Result<usize> {
        Ok(0)
    }
}

/// One-shot AES-256-CBC encryption helper (random IV supplied by the caller).
pub(crate) fn cbc_encrypt(key: &[u8; 32], iv: &[u8; BLOCK_SIZE], plain: &[u8]) -> Result<Vec<u8>> {
    let mut ctx = CbcEncryptCtx::new(key, iv);
    let mut out = vec![0u8; ctx.output_len(plain.len())];
    let n = ctx.update(plain, &mut out)?;
    let m = ctx.finish(&mut out[n..])?;
    out.truncate(n + m);
    Ok(out)
}

/// One-shot AES-256-CBC decryption helper.
pub(crate) fn cbc_decrypt(key: &[u8; 32], iv: &[u8; BLOCK_SIZE], cipher: &[u8]) -> Result<Vec<u8>> {
    let mut ctx = CbcDecryptCtx::new(key, iv);
    let mut out = vec![0u8; ctx.output_len(cipher.len()).max(BLOCK_SIZE)];
    let n = ctx.update(cipher, &mut out)?;
    let m = ctx.finish(&mut out[n..])?;
    out.truncate(n + m);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algorithm: SymAlgorithm, data: &[u8]) {
        let key = vec![7u8; algorithm.key_len()];
        let iv = vec![3u8; algorithm.iv_len()];

        let mut enc = encrypt_ctx(algorithm, &key, &iv).unwrap();
        let mut ciphertext = Vec::new();
        let mut buf = vec![0u8; enc.output_len(data.len())];
        // Feed in uneven pieces to exercise partial-block buffering.
        for chunk in data.chunks(7) {
            let n = enc.update(chunk, &mut buf).unwrap();
            ciphertext.extend_from_slice(&buf[..n]);
        }
        let n = enc.finish(&mut buf).unwrap();
        ciphertext.extend_from_slice(&buf[..n]);

        let mut dec = decrypt_ctx(algorithm, &key, &iv).unwrap();
        let mut plaintext = Vec::new();
        let mut buf = vec![0u8; dec.output_len(ciphertext.len()).max(BLOCK_SIZE)];
        for chunk in ciphertext.chunks(5) {
            let n = dec.update(chunk, &mut buf).unwrap();
            plaintext.extend_from_slice(&buf[..n]);
        }
        let n = dec.finish(&mut buf).unwrap();
        plaintext.extend_from_slice(&buf[..n]);

        assert_eq!(plaintext, data, "{algorithm:?} roundtrip");
    }

    #[test]
    fn test_cbc_roundtrip() {
        roundtrip(SymAlgorithm::Aes256Cbc, b"Hello, World! CBC with uneven chunk sizes.");
    }

    #[test]
    fn test_cbc_roundtrip_empty() {
        roundtrip(SymAlgorithm::Aes256Cbc, b"");
    }

    #[test]
    fn test_cbc_roundtrip_exact_blocks() {
        roundtrip(SymAlgorithm::Aes256Cbc, &[0xAB; 64]);
    }

    #[test]
    fn test_ctr_roundtrip() {
        roundtrip(SymAlgorithm::Aes256Ctr, b"CTR mode is a pure keystream.");
    }

    #[test]
    fn test_chacha_roundtrip() {
        roundtrip(SymAlgorithm::ChaCha20, b"ChaCha20 is a pure keystream too.");
    }

    #[test]
    fn test_cbc_produces_less_than_worst_case() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let mut enc = encrypt_ctx(SymAlgorithm::Aes256Cbc, &key, &iv).unwrap();
        let mut buf = vec![0u8; enc.output_len(5)];
        // Five bytes is less than a block: nothing produced yet.
        assert_eq!(enc.update(b"12345", &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_cbc_decrypt_truncated_fails() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let mut dec = decrypt_ctx(SymAlgorithm::Aes256Cbc, &key, &iv).unwrap();
        let mut buf = vec![0u8; 64];
        dec.update(&[0u8; 8], &mut buf).unwrap();
        let err = dec.finish(&mut buf).unwrap_err();
        assert!(matches!(err, Error::CryptoFailure(_)));
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let err = encrypt_ctx(SymAlgorithm::Aes256Cbc, &[0u8; 16], &[0u8; 16]).unwrap_err();
        assert!(matches!(err, Error::CryptoFailure(_)));
    }

    #[test]
    fn test_one_shot_cbc_helpers() {
        let key = [9u8; 32];
        let iv = [4u8; 16];
        let data = b"one-shot helper payload";
        let ct = cbc_encrypt(&key, &iv, data).unwrap();
        assert_ne!(&ct[..data.len().min(ct.len())], data.as_slice());
        let pt = cbc_decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(pt, data);
    }
}
