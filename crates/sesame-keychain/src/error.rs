//! Error types for `sesame-keychain`.

use thiserror::Error;

/// Errors produced by keychain encoding and cryptographic operations.
#[derive(Debug, Error)]
pub enum KeychainError {
    /// Key derivation failed (bad iteration count, short output buffer).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// AES-CBC encryption failure or invalid cipher parameters.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Ciphertext could not be decoded: bad padding, truncated blob,
    /// missing salt envelope, or a decrypted payload that is not valid JSON.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// No key entry validated against the supplied passphrase.
    ///
    /// Deliberately carries no detail: a wrong passphrase and a corrupt
    /// entry are indistinguishable to the caller.
    #[error("authentication failed")]
    Authentication,

    /// Invalid key material (empty key, wrong derived-key length).
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Keychain file layout parsing or serialization error.
    #[error("keychain format error: {0}")]
    Format(String),

    /// Secure memory allocation failure.
    #[error("secure memory error: {0}")]
    SecureMemory(String),
}
