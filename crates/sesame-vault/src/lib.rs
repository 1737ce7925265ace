//! `sesame-vault` — vault engine for SESAME.
//!
//! Binds a keychain on any [`Storage`] backend to a [`KeyAgent`] that holds
//! unlocked keys, and exposes the vault lifecycle (create, unlock, lock,
//! password change) and item operations (list, search, add, edit, trash,
//! remove).

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod agent;
pub mod config;
pub mod error;
pub mod items;
pub mod lifecycle;
pub mod queue;
pub mod search;
pub mod storage;

pub use agent::{KeyAgent, LocalKeyAgent, LockEvent, LockReason};
pub use config::VaultConfig;
pub use error::{StorageError, VaultError};
pub use lifecycle::{Vault, VaultState, DATA_DIR};
pub use queue::WriteQueue;
pub use search::{filter_by_location, match_items, matches, select_unique};
pub use storage::{copy_recursive, remove_recursive, FileEntry, LocalStorage, MemoryStorage, Storage};

pub use sesame_keychain::{ItemContent, ItemMetadata, ItemType, SecurityLevel};
