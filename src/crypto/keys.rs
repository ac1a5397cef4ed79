//! The container key pair: key wrap and entry signatures.
//!
//! Each container carries one key pair with two halves sharing a lifetime:
//! an x25519 exchange key used to wrap per-stage symmetric keys, and an
//! ed25519 signing key used to authenticate entry metadata. The public
//! halves are stored in the header in the clear; the secret halves are
//! stored encrypted under the password hash.
//!
//! Key wrap is ECIES-style: a fresh ephemeral x25519 key per wrapped value,
//! HKDF-SHA256 over the shared secret, and an AES-256-CTR keystream over the
//! payload. The wrapped form is `ephemeral_public(32) || ciphertext`.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{Error, Result};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Length of the public encoding: x25519 public key || ed25519 verifying key.
pub const PUBLIC_LEN: usize = 64;

/// Length of the secret encoding: x25519 secret || ed25519 secret.
pub const SECRET_LEN: usize = 64;

/// Domain separation label for the key-wrap KDF.
const WRAP_INFO: &[u8] = b"gordian/key-wrap/v1";

/// An exchange + signing key pair bound to one container.
pub struct KeyPair {
    exchange: StaticSecret,
    signing: SigningKey,
}

impl KeyPair {
    /// Generates a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        Self {
            exchange: StaticSecret::random_from_rng(OsRng),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstructs a key pair from its secret encoding, validating that it
    /// matches the recorded public encoding.
    pub fn from_parts(secret: &[u8], public: &[u8]) -> Result<Self> {
        if secret.len() != SECRET_LEN || public.len() != PUBLIC_LEN {
            return Err(Error::CryptoFailure(format!(
                "key pair encoding has wrong length: secret {}, public {}",
                secret.len(),
                public.len()
            )));
        }
        let mut exchange_bytes = Zeroizing::new([0u8; 32]);
        exchange_bytes.copy_from_slice(&secret[..32]);
        let mut signing_bytes = Zeroizing::new([0u8; 32]);
        signing_bytes.copy_from_slice(&secret[32..]);

        let pair = Self {
            exchange: StaticSecret::from(*exchange_bytes),
            signing: SigningKey::from_bytes(&signing_bytes),
        };
        if pair.public_encoding() != public {
            return Err(Error::CryptoFailure(
                "secret key material does not match the recorded public keys".into(),
            ));
        }
        Ok(pair)
    }

    /// The stored public encoding: exchange public key then verifying key.
    pub fn public_encoding(&self) -> [u8; PUBLIC_LEN] {
        let mut out = [0u8; PUBLIC_LEN];
        out[..32].copy_from_slice(PublicKey::from(&self.exchange).as_bytes());
        out[32..].copy_from_slice(self.signing.verifying_key().as_bytes());
        out
    }

    /// The secret encoding, zeroized on drop. Stored only in encrypted form.
    pub fn secret_encoding(&self) -> Zeroizing<[u8; SECRET_LEN]> {
        let mut out = Zeroizing::new([0u8; SECRET_LEN]);
        out[..32].copy_from_slice(&self.exchange.to_bytes());
        out[32..].copy_from_slice(&self.signing.to_bytes());
        out
    }

    /// Wraps `plain` under a public encoding so that only the holder of the
    /// matching secret can recover it.
    pub fn wrap_key(public: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
        if public.len() != PUBLIC_LEN {
            return Err(Error::CryptoFailure(format!(
                "public encoding has wrong length: {}",
                public.len()
            )));
        }
        let mut recipient = [0u8; 32];
        recipient.copy_from_slice(&public[..32]);
        let recipient = PublicKey::from(recipient);

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient);

        let mut out = Vec::with_capacity(32 + plain.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(plain);
        apply_wrap_keystream(shared.as_bytes(), &mut out[32..])?;
        Ok(out)
    }

    /// Recovers a value wrapped under this pair's public encoding.
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if wrapped.len() < 32 {
            return Err(Error::CryptoFailure(
                "wrapped key material is shorter than the ephemeral public key".into(),
            ));
        }
        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(&wrapped[..32]);
        let shared = self.exchange.diffie_hellman(&PublicKey::from(ephemeral));

        let mut out = Zeroizing::new(wrapped[32..].to_vec());
        apply_wrap_keystream(shared.as_bytes(), &mut out)?;
        Ok(out)
    }

    /// Signs `message`, returning the 64-byte detached signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Verifies a detached signature against a public encoding.
    ///
    /// Returns `false` for malformed keys or signatures as well as for
    /// genuine mismatches; callers treat all of these as tampering.
    pub fn verify(public: &[u8], message: &[u8], signature: &[u8]) -> bool {
        if public.len() != PUBLIC_LEN {
            return false;
        }
        let mut verifying = [0u8; 32];
        verifying.copy_from_slice(&public[32..]);
        let Ok(verifying) = VerifyingKey::from_bytes(&verifying) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying.verify(message, &signature).is_ok()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public_encoding()))
            .finish_non_exhaustive()
    }
}

/// Derives the wrap key/IV from a DH shared secret and XORs the keystream
/// over `data` in place. Symmetric: the same call wraps and unwraps.
fn apply_wrap_keystream(shared: &[u8; 32], data: &mut [u8]) -> Result<()> {
    use cbc::cipher::{KeyIvInit, StreamCipher};

    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut okm = Zeroizing::new([0u8; 48]);
    hkdf.expand(WRAP_INFO, okm.as_mut())
        .map_err(|e| Error::CryptoFailure(format!("key-wrap KDF failed: {e}")))?;
    let mut cipher = Aes256Ctr::new_from_slices(&okm[..32], &okm[32..])
        .map_err(|e| Error::CryptoFailure(format!("key-wrap cipher init failed: {e}")))?;
    cipher.apply_keystream(data);
    Ok(())
}
