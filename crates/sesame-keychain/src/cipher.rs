//! AES-128-CBC payload encryption with PKCS#7 padding.
//!
//! This module provides:
//! - [`CryptoParams`] — cipher identifier + salt + iteration count for one payload
//! - [`encrypt`] / [`decrypt`] — derive a key/IV from a secret and the params,
//!   then run AES-128-CBC
//! - [`SaltedBlob`] — the OpenSSL `"Salted__" || salt || ciphertext` envelope
//!   that key entries, validation blobs and item payloads are stored in
//!
//! CBC provides no authentication. The only tamper signal is PKCS#7
//! padding, which surfaces as [`KeychainError::Integrity`].

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use data_encoding::BASE64;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::KeychainError;
use crate::kdf::{self, DerivedKey};
use crate::memory::SecretBuffer;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Salt length of the OpenSSL envelope in bytes.
pub const SALT_LEN: usize = 8;

/// AES block length in bytes.
pub const BLOCK_LEN: usize = 16;

/// Magic prefix of the OpenSSL salted envelope.
pub const SALTED_MAGIC: &[u8; 8] = b"Salted__";

/// `EVP_BytesToKey` rounds used for item payloads and validation blobs.
pub const ITEM_KEY_ROUNDS: u32 = 1;

const MAGIC_LEN: usize = 8;
const ENVELOPE_HEADER_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// How the payload key/IV is derived from the secret.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherId {
    /// AES-128-CBC keyed by OpenSSL `EVP_BytesToKey` (MD5) over the secret.
    Aes128OpenSslKey,
    /// AES-128-CBC keyed by PBKDF2-HMAC-SHA1 over the secret.
    Aes128Pbkdf2Sha1,
}

/// Per-payload encryption parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoParams {
    /// Key derivation + cipher combination.
    pub cipher: CipherId,
    /// Random per-payload salt.
    pub salt: [u8; SALT_LEN],
    /// Iteration (PBKDF2) or round (`EVP_BytesToKey`) count.
    pub iterations: u32,
}

impl CryptoParams {
    /// Build parameters from known values.
    #[must_use]
    pub const fn new(cipher: CipherId, salt: [u8; SALT_LEN], iterations: u32) -> Self {
        Self {
            cipher,
            salt,
            iterations,
        }
    }

    /// Fresh parameters with a random salt.
    #[must_use]
    pub fn random(cipher: CipherId, iterations: u32) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self::new(cipher, salt, iterations)
    }

    /// Fresh parameters for an item payload or validation blob.
    #[must_use]
    pub fn for_item() -> Self {
        Self::random(CipherId::Aes128OpenSslKey, ITEM_KEY_ROUNDS)
    }

    fn derive(&self, secret: &[u8]) -> Result<DerivedKey, KeychainError> {
        match self.cipher {
            CipherId::Aes128OpenSslKey => {
                kdf::openssl_bytes_to_key(secret, &self.salt, self.iterations)
            }
            CipherId::Aes128Pbkdf2Sha1 => kdf::pbkdf2_sha1(secret, &self.salt, self.iterations),
        }
    }
}

// ---------------------------------------------------------------------------
// Core encryption
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` under a key/IV derived from `secret` and `params`.
///
/// Returns the raw CBC ciphertext (no envelope).
///
/// # Errors
///
/// Returns `KeychainError::InvalidKeyMaterial` if `secret` is empty,
/// `KeychainError::KeyDerivation` for a zero iteration count.
pub fn encrypt(
    secret: &[u8],
    plaintext: &[u8],
    params: &CryptoParams,
) -> Result<Vec<u8>, KeychainError> {
    if secret.is_empty() {
        return Err(KeychainError::InvalidKeyMaterial(
            "encryption secret is empty".into(),
        ));
    }
    let derived = params.derive(secret)?;
    let encryptor = Aes128CbcEnc::new_from_slices(derived.key(), derived.iv())
        .map_err(|e| KeychainError::Encryption(format!("invalid AES-128 key/IV: {e}")))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt a raw CBC `ciphertext` under a key/IV derived from `secret` and
/// `params`.
///
/// # Errors
///
/// Returns `KeychainError::Integrity` if the ciphertext is empty, not a
/// whole number of blocks, or the PKCS#7 padding is malformed.
pub fn decrypt(
    secret: &[u8],
    ciphertext: &[u8],
    params: &CryptoParams,
) -> Result<SecretBuffer, KeychainError> {
    if secret.is_empty() {
        return Err(KeychainError::InvalidKeyMaterial(
            "decryption secret is empty".into(),
        ));
    }
    if ciphertext.is_empty() || ciphertext.len().checked_rem(BLOCK_LEN) != Some(0) {
        return Err(KeychainError::Integrity(format!(
            "ciphertext length {} is not a positive multiple of {BLOCK_LEN}",
            ciphertext.len()
        )));
    }

    let derived = params.derive(secret)?;
    let decryptor = Aes128CbcDec::new_from_slices(derived.key(), derived.iv())
        .map_err(|e| KeychainError::Encryption(format!("invalid AES-128 key/IV: {e}")))?;
    let plaintext = decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| KeychainError::Integrity("invalid PKCS#7 padding".into()))?;

    Ok(SecretBuffer::from_vec(plaintext))
}

// ---------------------------------------------------------------------------
// Salted envelope
// ---------------------------------------------------------------------------

/// OpenSSL salted envelope: `"Salted__" (8 B) || salt (8 B) || ciphertext`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaltedBlob {
    /// Salt fed to the key derivation.
    pub salt: [u8; SALT_LEN],
    /// Raw CBC ciphertext.
    pub ciphertext: Vec<u8>,
}

impl SaltedBlob {
    /// Encrypt `plaintext` and wrap it in an envelope.
    ///
    /// # Errors
    ///
    /// See [`encrypt`].
    pub fn seal(
        secret: &[u8],
        plaintext: &[u8],
        params: &CryptoParams,
    ) -> Result<Self, KeychainError> {
        Ok(Self {
            salt: params.salt,
            ciphertext: encrypt(secret, plaintext, params)?,
        })
    }

    /// Decrypt the envelope with the given cipher and iteration count.
    ///
    /// # Errors
    ///
    /// See [`decrypt`].
    pub fn open(
        &self,
        secret: &[u8],
        cipher: CipherId,
        iterations: u32,
    ) -> Result<SecretBuffer, KeychainError> {
        decrypt(secret, &self.ciphertext, &self.params(cipher, iterations))
    }

    /// The parameters this envelope's salt implies for `cipher`.
    #[must_use]
    pub const fn params(&self, cipher: CipherId, iterations: u32) -> CryptoParams {
        CryptoParams::new(cipher, self.salt, iterations)
    }

    /// Serialize to the binary envelope.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(ENVELOPE_HEADER_LEN.saturating_add(self.ciphertext.len()));
        out.extend_from_slice(SALTED_MAGIC);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the binary envelope.
    ///
    /// # Errors
    ///
    /// Returns `KeychainError::Integrity` if the magic prefix is missing or
    /// the envelope is shorter than its 16-byte header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeychainError> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(KeychainError::Integrity(format!(
                "salted envelope too short: {} bytes (minimum {ENVELOPE_HEADER_LEN})",
                bytes.len()
            )));
        }
        if &bytes[..MAGIC_LEN] != SALTED_MAGIC.as_slice() {
            return Err(KeychainError::Integrity(
                "missing Salted__ envelope prefix".into(),
            ));
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[MAGIC_LEN..ENVELOPE_HEADER_LEN]);
        Ok(Self {
            salt,
            ciphertext: bytes[ENVELOPE_HEADER_LEN..].to_vec(),
        })
    }

    /// Serialize to base64 text, as stored in keychain JSON files.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.to_bytes())
    }

    /// Parse base64 text. Embedded whitespace and trailing NUL characters,
    /// which some keychain writers emit, are ignored.
    ///
    /// # Errors
    ///
    /// Returns `KeychainError::Integrity` for invalid base64 or envelope.
    pub fn from_base64(text: &str) -> Result<Self, KeychainError> {
        let cleaned: Vec<u8> = text
            .bytes()
            .filter(|b| !b.is_ascii_whitespace() && *b != 0)
            .collect();
        let bytes = BASE64
            .decode(&cleaned)
            .map_err(|e| KeychainError::Integrity(format!("invalid base64 payload: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef-raw-master-key";

    fn item_params() -> CryptoParams {
        CryptoParams::new(CipherId::Aes128OpenSslKey, [9u8; SALT_LEN], ITEM_KEY_ROUNDS)
    }

    #[test]
    fn encrypt_decrypt_roundtrip_openssl_key() {
        let ct = encrypt(SECRET, b"{\"notesPlain\":\"hi\"}", &item_params())
            .expect("encrypt should succeed");
        let pt = decrypt(SECRET, &ct, &item_params()).expect("decrypt should succeed");
        assert_eq!(pt.expose(), b"{\"notesPlain\":\"hi\"}");
    }

    #[test]
    fn encrypt_decrypt_roundtrip_pbkdf2() {
        let params = CryptoParams::random(CipherId::Aes128Pbkdf2Sha1, 1000);
        let ct = encrypt(b"passphrase", &[0x42; 1024], &params).expect("encrypt should succeed");
        let pt = decrypt(b"passphrase", &ct, &params).expect("decrypt should succeed");
        assert_eq!(pt.expose(), &[0x42; 1024]);
    }

    #[test]
    fn ciphertext_is_padded_to_block_multiple() {
        let ct = encrypt(SECRET, &[0u8; 16], &item_params()).expect("encrypt should succeed");
        // A full block of plaintext gains a full block of padding.
        assert_eq!(ct.len(), 32);
        let ct = encrypt(SECRET, b"", &item_params()).expect("encrypt should succeed");
        assert_eq!(ct.len(), 16);
    }

    #[test]
    fn decrypt_rejects_partial_block() {
        let result = decrypt(SECRET, &[0u8; 17], &item_params());
        assert!(matches!(result, Err(KeychainError::Integrity(_))));
    }

    #[test]
    fn decrypt_rejects_empty_ciphertext() {
        let result = decrypt(SECRET, &[], &item_params());
        assert!(matches!(result, Err(KeychainError::Integrity(_))));
    }

    #[test]
    fn decrypt_rejects_malformed_padding() {
        // Encrypt a block of zeros without padding: it decrypts to a final
        // byte of 0x00, which is never valid PKCS#7.
        let params = item_params();
        let derived = params.derive(SECRET).expect("derive should succeed");
        let raw = Aes128CbcEnc::new_from_slices(derived.key(), derived.iv())
            .expect("valid key/iv")
            .encrypt_padded_vec_mut::<aes::cipher::block_padding::NoPadding>(&[0u8; 16]);

        let result = decrypt(SECRET, &raw, &params);
        assert!(matches!(result, Err(KeychainError::Integrity(_))));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(
            encrypt(b"", b"data", &item_params()),
            Err(KeychainError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn random_params_use_fresh_salts() {
        let a = CryptoParams::for_item();
        let b = CryptoParams::for_item();
        assert_eq!(a.cipher, CipherId::Aes128OpenSslKey);
        assert_eq!(a.iterations, ITEM_KEY_ROUNDS);
        assert_ne!(a.salt, b.salt);
    }

    #[test]
    fn salted_blob_layout() {
        let blob = SaltedBlob::seal(SECRET, b"payload", &item_params()).expect("seal");
        let bytes = blob.to_bytes();
        assert_eq!(&bytes[..8], b"Salted__");
        assert_eq!(&bytes[8..16], &[9u8; SALT_LEN]);
        assert_eq!(SaltedBlob::from_bytes(&bytes).expect("parse"), blob);
    }

    #[test]
    fn salted_blob_base64_tolerates_nul_and_newlines() {
        let blob = SaltedBlob::seal(SECRET, b"payload", &item_params()).expect("seal");
        let mut text = blob.to_base64();
        text.insert(10, '\n');
        text.push('\0');
        let parsed = SaltedBlob::from_base64(&text).expect("parse");
        let pt = parsed
            .open(SECRET, CipherId::Aes128OpenSslKey, ITEM_KEY_ROUNDS)
            .expect("open");
        assert_eq!(pt.expose(), b"payload");
    }

    #[test]
    fn salted_blob_requires_magic() {
        let result = SaltedBlob::from_bytes(b"Unsalted01234567abcdefghijklmnop");
        assert!(matches!(result, Err(KeychainError::Integrity(_))));
        assert!(SaltedBlob::from_bytes(b"Salted__").is_err());
    }
}
