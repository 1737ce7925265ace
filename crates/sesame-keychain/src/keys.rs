//! Key table: passphrase-wrapped master keys.
//!
//! This module provides:
//! - [`read_key_entries`] / [`write_key_entries`] — the `encryptionKeys.js` codec
//! - [`decode_key_entries`] — the same read, one result per entry
//! - [`derive_and_validate`] — unwrap a [`KeyEntry`] with a passphrase
//! - [`rewrap_master_key`] — re-encrypt an unlocked key under a new passphrase
//! - [`verify_rewrap`] — confirm a rewrapped entry before it is stored
//! - [`create_master_key`] — generate a fresh key for a new vault
//!
//! # Key hierarchy
//!
//! ```text
//! Passphrase ──PBKDF2-SHA1──► wraps ──► Random 1024-byte Master Key
//! Master Key ──EVP_BytesToKey──► encrypts ──► validation blob (= Master Key)
//! Master Key ──EVP_BytesToKey──► encrypts ──► every item payload
//! ```
//!
//! Changing the passphrase only rewraps the master key; item payloads are
//! never touched.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cipher::{CipherId, CryptoParams, SaltedBlob, ITEM_KEY_ROUNDS};
use crate::error::KeychainError;
use crate::item::{generate_uuid, trim_trailing_nuls};
use crate::kdf::MIN_PBKDF2_ITERATIONS;
use crate::memory::{constant_time_eq, SecretBuffer};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Raw master key length in bytes.
pub const MASTER_KEY_LEN: usize = 1024;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Security level a key entry serves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// Lower-security level, used by legacy item types.
    #[serde(rename = "SL3")]
    Sl3,
    /// Standard level for all new items.
    #[default]
    #[serde(rename = "SL5")]
    Sl5,
}

impl SecurityLevel {
    /// Tag as written in keychain files.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sl3 => "SL3",
            Self::Sl5 => "SL5",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One passphrase-wrapped master key, as persisted in the key table.
#[must_use = "key entry must be written to the key table"]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEntry {
    /// Key identifier, referenced by item files as `keyID`.
    pub identifier: String,
    /// Security level this key serves.
    pub level: SecurityLevel,
    /// Master key wrapped under the passphrase (PBKDF2-SHA1 + AES-128-CBC).
    pub wrapped_key: SaltedBlob,
    /// PBKDF2 iteration count, never below [`MIN_PBKDF2_ITERATIONS`].
    pub iterations: u32,
    /// Master key encrypted under itself.
    pub validation: SaltedBlob,
}

impl KeyEntry {
    /// PBKDF2 salt of the wrapped key.
    #[must_use]
    pub const fn salt(&self) -> &[u8; crate::cipher::SALT_LEN] {
        &self.wrapped_key.salt
    }
}

/// An unlocked master key. Zeroized on drop.
pub struct MasterKey {
    /// Identifier of the key entry this key was unwrapped from.
    pub identifier: String,
    key: SecretBuffer,
}

impl MasterKey {
    /// Wrap raw key bytes under an identifier.
    pub const fn new(identifier: String, key: SecretBuffer) -> Self {
        Self { identifier, key }
    }

    /// Raw key bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.key.expose()
    }

    /// Split into identifier and key buffer.
    #[must_use]
    pub fn into_parts(self) -> (String, SecretBuffer) {
        (self.identifier, self.key)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("identifier", &self.identifier)
            .field("key", &"***")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// On-disk representation
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct KeyTableFile {
    list: Vec<KeyEntryFile>,
    #[serde(rename = "SL5", default, skip_serializing_if = "Option::is_none")]
    sl5: Option<String>,
    #[serde(rename = "SL3", default, skip_serializing_if = "Option::is_none")]
    sl3: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct KeyEntryFile {
    identifier: String,
    level: SecurityLevel,
    data: String,
    validation: String,
    #[serde(default)]
    iterations: Option<u32>,
}

/// Raise missing or legacy iteration counts to the floor.
const fn effective_iterations(stored: Option<u32>) -> u32 {
    match stored {
        Some(n) if n >= MIN_PBKDF2_ITERATIONS => n,
        _ => MIN_PBKDF2_ITERATIONS,
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Parse an `encryptionKeys.js` key table, decoding each entry on its own.
///
/// A table whose JSON is well formed yields one result per listed entry,
/// in file order. An entry with a broken base64 envelope is an `Err` in its
/// slot and does not affect its neighbours.
///
/// # Errors
///
/// Returns `KeychainError::Format` if the JSON itself is malformed.
pub fn decode_key_entries(
    bytes: &[u8],
) -> Result<Vec<Result<KeyEntry, KeychainError>>, KeychainError> {
    let table: KeyTableFile = serde_json::from_slice(trim_trailing_nuls(bytes))
        .map_err(|e| KeychainError::Format(format!("invalid key table: {e}")))?;

    Ok(table
        .list
        .into_iter()
        .map(|raw| {
            Ok(KeyEntry {
                wrapped_key: SaltedBlob::from_base64(&raw.data)?,
                validation: SaltedBlob::from_base64(&raw.validation)?,
                iterations: effective_iterations(raw.iterations),
                identifier: raw.identifier,
                level: raw.level,
            })
        })
        .collect())
}

/// Parse an `encryptionKeys.js` key table, requiring every entry to decode.
///
/// # Errors
///
/// Returns `KeychainError::Format` if the JSON is malformed, or
/// `KeychainError::Integrity` if an entry's base64 envelope is invalid.
pub fn read_key_entries(bytes: &[u8]) -> Result<Vec<KeyEntry>, KeychainError> {
    decode_key_entries(bytes)?.into_iter().collect()
}

/// Serialize a key table. The per-level map points at the first entry of
/// each level.
///
/// # Errors
///
/// Returns `KeychainError::Format` if JSON serialization fails.
pub fn write_key_entries(entries: &[KeyEntry]) -> Result<Vec<u8>, KeychainError> {
    let first_of = |level: SecurityLevel| {
        entries
            .iter()
            .find(|e| e.level == level)
            .map(|e| e.identifier.clone())
    };

    let table = KeyTableFile {
        list: entries
            .iter()
            .map(|e| KeyEntryFile {
                identifier: e.identifier.clone(),
                level: e.level,
                data: e.wrapped_key.to_base64(),
                validation: e.validation.to_base64(),
                iterations: Some(e.iterations),
            })
            .collect(),
        sl5: first_of(SecurityLevel::Sl5),
        sl3: first_of(SecurityLevel::Sl3),
    };

    serde_json::to_vec(&table)
        .map_err(|e| KeychainError::Format(format!("failed to serialize key table: {e}")))
}

// ---------------------------------------------------------------------------
// Key operations
// ---------------------------------------------------------------------------

/// Unwrap `entry` with `passphrase` and check the result against the
/// entry's validation blob.
///
/// # Errors
///
/// Returns `KeychainError::Authentication` for every failure: a wrong
/// passphrase and a corrupt entry are indistinguishable.
pub fn derive_and_validate(entry: &KeyEntry, passphrase: &[u8]) -> Result<MasterKey, KeychainError> {
    let raw_key = entry
        .wrapped_key
        .open(passphrase, CipherId::Aes128Pbkdf2Sha1, entry.iterations)
        .map_err(|_| KeychainError::Authentication)?;
    if raw_key.is_empty() {
        return Err(KeychainError::Authentication);
    }

    let validation = entry
        .validation
        .open(raw_key.expose(), CipherId::Aes128OpenSslKey, ITEM_KEY_ROUNDS)
        .map_err(|_| KeychainError::Authentication)?;

    if !constant_time_eq(validation.expose(), raw_key.expose()) {
        return Err(KeychainError::Authentication);
    }

    Ok(MasterKey::new(entry.identifier.clone(), raw_key))
}

/// Wrap an unlocked master key under `passphrase` with a fresh salt and a
/// fresh validation blob.
///
/// # Errors
///
/// Returns `KeychainError::InvalidKeyMaterial` if the passphrase or key is
/// empty.
pub fn rewrap_master_key(
    master: &MasterKey,
    level: SecurityLevel,
    passphrase: &[u8],
    iterations: u32,
) -> Result<KeyEntry, KeychainError> {
    if passphrase.is_empty() {
        return Err(KeychainError::InvalidKeyMaterial(
            "passphrase is empty".into(),
        ));
    }

    let iterations = effective_iterations(Some(iterations));
    let wrap_params = CryptoParams::random(CipherId::Aes128Pbkdf2Sha1, iterations);
    let wrapped_key = SaltedBlob::seal(passphrase, master.expose(), &wrap_params)?;
    let validation = SaltedBlob::seal(master.expose(), master.expose(), &CryptoParams::for_item())?;

    Ok(KeyEntry {
        identifier: master.identifier.clone(),
        level,
        wrapped_key,
        iterations,
        validation,
    })
}

/// Check that a freshly wrapped `entry` opens with `passphrase` and yields
/// exactly `expected`. Run before a rewrapped entry replaces a stored one.
///
/// # Errors
///
/// Returns `KeychainError::Integrity` if the entry does not unlock, or
/// unlocks to a different identifier or key.
pub fn verify_rewrap(
    entry: &KeyEntry,
    passphrase: &[u8],
    expected: &MasterKey,
) -> Result<(), KeychainError> {
    let recovered = derive_and_validate(entry, passphrase).map_err(|_| {
        KeychainError::Integrity(format!(
            "rewrapped key {} does not unlock with the new passphrase",
            entry.identifier
        ))
    })?;
    let (identifier, key) = recovered.into_parts();
    if identifier != expected.identifier || !key.ct_eq(expected.expose()) {
        return Err(KeychainError::Integrity(format!(
            "rewrapped key {} unlocks to a different master key",
            entry.identifier
        )));
    }
    Ok(())
}

/// Generate a random master key and its key entry for a new vault.
///
/// # Errors
///
/// Returns `KeychainError::InvalidKeyMaterial` if the passphrase is empty,
/// or `KeychainError::SecureMemory` if key allocation fails.
pub fn create_master_key(
    passphrase: &[u8],
    level: SecurityLevel,
    iterations: u32,
) -> Result<(KeyEntry, MasterKey), KeychainError> {
    let master = MasterKey::new(generate_uuid(), SecretBuffer::random(MASTER_KEY_LEN)?);
    let entry = rewrap_master_key(&master, level, passphrase, iterations)?;
    Ok((entry, master))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
