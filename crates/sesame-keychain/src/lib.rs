//! `sesame-keychain` — keychain codec and cryptographic primitives for SESAME.
//!
//! This crate is the audit target: zero network, zero async, no key custody.
//! It reads and writes the agile keychain layout (key table, item index,
//! item files) and performs every derivation and cipher operation on
//! caller-supplied key material.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod memory;

pub mod cipher;
pub mod kdf;

pub mod keys;

pub mod index;
pub mod item;

pub use cipher::{decrypt, encrypt, CipherId, CryptoParams, SaltedBlob, ITEM_KEY_ROUNDS};
pub use error::KeychainError;
pub use index::{read_item_index, write_item_index, ItemMetadata};
pub use item::{
    current_epoch_secs, generate_uuid, location_host, read_item_content, write_item_content,
    FieldKind, FormField, ItemContent, ItemField, ItemFile, ItemSection, ItemType, ItemUrl,
};
pub use kdf::MIN_PBKDF2_ITERATIONS;
pub use keys::{
    create_master_key, decode_key_entries, derive_and_validate, read_key_entries,
    rewrap_master_key, verify_rewrap, write_key_entries, KeyEntry, MasterKey, SecurityLevel,
    MASTER_KEY_LEN,
};
pub use memory::{disable_core_dumps, SecretBuffer, SecretBytes};
