//! Key/IV derivation for AES-128-CBC payloads.
//!
//! This module provides:
//! - [`pbkdf2_sha1`] — PBKDF2-HMAC-SHA1, used to wrap master keys under a passphrase
//! - [`openssl_bytes_to_key`] — OpenSSL `EVP_BytesToKey` (MD5), used for
//!   validation blobs and item payloads keyed by the raw master key
//! - [`DerivedKey`] — the 16-byte AES key and 16-byte IV produced by either
//!
//! Both functions emit 32 bytes: the first half is the AES-128 key, the
//! second half the CBC initialisation vector. This is the split the existing
//! keychain files were written with and must not change.

use std::num::NonZeroU32;

use md5::{Digest, Md5};
use ring::pbkdf2;
use zeroize::Zeroize;

use crate::error::KeychainError;
use crate::memory::SecretBytes;

/// AES-128 key length in bytes.
pub const AES_KEY_LEN: usize = 16;

/// AES-CBC initialisation vector length in bytes.
pub const IV_LEN: usize = 16;

/// Combined key + IV output length.
const DERIVED_LEN: usize = 32;

/// MD5 digest length.
const MD5_LEN: usize = 16;

/// Lowest PBKDF2 iteration count accepted for key entries.
///
/// Entries stored with a smaller (or missing) count are read as if they
/// had this many iterations.
pub const MIN_PBKDF2_ITERATIONS: u32 = 1000;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// AES-128 key and IV derived for a single payload.
pub struct DerivedKey {
    key: SecretBytes<AES_KEY_LEN>,
    iv: SecretBytes<IV_LEN>,
}

impl DerivedKey {
    fn split(output: &[u8; DERIVED_LEN]) -> Result<Self, KeychainError> {
        let (key, iv) = output.split_at(AES_KEY_LEN);
        Ok(Self {
            key: SecretBytes::from_slice(key)?,
            iv: SecretBytes::from_slice(iv)?,
        })
    }

    /// The AES-128 key.
    #[must_use]
    pub const fn key(&self) -> &[u8; AES_KEY_LEN] {
        self.key.expose()
    }

    /// The CBC initialisation vector.
    #[must_use]
    pub const fn iv(&self) -> &[u8; IV_LEN] {
        self.iv.expose()
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(***)")
    }
}

// ---------------------------------------------------------------------------
// Derivation functions
// ---------------------------------------------------------------------------

/// Derive an AES-128 key and IV with PBKDF2-HMAC-SHA1.
///
/// # Errors
///
/// Returns `KeychainError::KeyDerivation` if `iterations` is zero.
pub fn pbkdf2_sha1(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<DerivedKey, KeychainError> {
    let rounds = NonZeroU32::new(iterations)
        .ok_or_else(|| KeychainError::KeyDerivation("iteration count must be non-zero".into()))?;

    let mut output = [0u8; DERIVED_LEN];
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA1, rounds, salt, password, &mut output);

    let result = DerivedKey::split(&output);
    output.zeroize();
    result
}

/// Derive an AES-128 key and IV the way OpenSSL's `EVP_BytesToKey` does with
/// MD5: `D_i = MD5^rounds(D_{i-1} || password || salt)`, concatenated until
/// 32 bytes are available.
///
/// # Errors
///
/// Returns `KeychainError::KeyDerivation` if `rounds` is zero.
pub fn openssl_bytes_to_key(
    password: &[u8],
    salt: &[u8],
    rounds: u32,
) -> Result<DerivedKey, KeychainError> {
    if rounds == 0 {
        return Err(KeychainError::KeyDerivation(
            "round count must be non-zero".into(),
        ));
    }

    let mut output = [0u8; DERIVED_LEN];
    let mut previous: Vec<u8> = Vec::with_capacity(MD5_LEN);

    for chunk in output.chunks_mut(MD5_LEN) {
        let mut hasher = Md5::new();
        hasher.update(&previous);
        hasher.update(password);
        hasher.update(salt);
        let mut digest = hasher.finalize();
        for _ in 1..rounds {
            digest = Md5::digest(digest.as_slice());
        }

        chunk.copy_from_slice(&digest[..chunk.len()]);
        previous.zeroize();
        previous.extend_from_slice(digest.as_slice());
        digest.as_mut_slice().zeroize();
    }
    previous.zeroize();

    let result = DerivedKey::split(&output);
    output.zeroize();
    result
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pbkdf2_sha1_matches_rfc6070_first_block() {
        // RFC 6070: P="password", S="salt", c=1 →
        // 0c60c80f961f0e71f3a9b524af6012062fe037a6
        let derived = pbkdf2_sha1(b"password", b"salt", 1).expect("derive should succeed");
        assert_eq!(
            derived.key(),
            &[
                0x0c, 0x60, 0xc8, 0x0f, 0x96, 0x1f, 0x0e, 0x71, 0xf3, 0xa9, 0xb5, 0x24, 0xaf,
                0x60, 0x12, 0x06
            ]
        );
        assert_eq!(&derived.iv()[..4], &[0x2f, 0xe0, 0x37, 0xa6]);
    }

    #[test]
    fn pbkdf2_sha1_rejects_zero_iterations() {
        let result = pbkdf2_sha1(b"password", b"salt", 0);
        assert!(matches!(result, Err(KeychainError::KeyDerivation(_))));
    }

    #[test]
    fn pbkdf2_sha1_is_salt_sensitive() {
        let a = pbkdf2_sha1(b"logMEin", b"saltsalt", 1000).expect("derive should succeed");
        let b = pbkdf2_sha1(b"logMEin", b"saltpepr", 1000).expect("derive should succeed");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn openssl_single_round_empty_input_is_md5_of_empty() {
        // MD5("") = d41d8cd98f00b204e9800998ecf8427e
        let derived = openssl_bytes_to_key(b"", b"", 1).expect("derive should succeed");
        assert_eq!(
            derived.key(),
            &[
                0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec,
                0xf8, 0x42, 0x7e
            ]
        );
    }

    #[test]
    fn openssl_iv_chains_previous_digest() {
        let password = b"master key bytes";
        let salt = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let derived = openssl_bytes_to_key(password, &salt, 1).expect("derive should succeed");

        let d1 = Md5::new()
            .chain_update(password)
            .chain_update(salt)
            .finalize();
        let d2 = Md5::new()
            .chain_update(d1)
            .chain_update(password)
            .chain_update(salt)
            .finalize();
        assert_eq!(derived.key().as_slice(), d1.as_slice());
        assert_eq!(derived.iv().as_slice(), d2.as_slice());
    }

    #[test]
    fn openssl_extra_rounds_change_output() {
        let one = openssl_bytes_to_key(b"pw", b"saltsalt", 1).expect("derive should succeed");
        let two = openssl_bytes_to_key(b"pw", b"saltsalt", 2).expect("derive should succeed");
        assert_ne!(one.key(), two.key());
    }

    #[test]
    fn openssl_rejects_zero_rounds() {
        assert!(openssl_bytes_to_key(b"pw", b"saltsalt", 0).is_err());
    }

    #[test]
    fn derived_key_debug_is_masked() {
        let derived = openssl_bytes_to_key(b"pw", b"saltsalt", 1).expect("derive should succeed");
        assert_eq!(format!("{derived:?}"), "DerivedKey(***)");
    }
}
