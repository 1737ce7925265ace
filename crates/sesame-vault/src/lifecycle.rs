//! Vault lifecycle: create, open, unlock, lock, password change.
//!
//! A vault is an agile keychain directory reached through a [`Storage`]
//! backend:
//!
//! - `data/default/encryptionKeys.js` — key table (passphrase-wrapped keys)
//! - `data/default/contents.js` — item index
//! - `data/default/<UUID>.1password` — one encrypted item per file
//! - `data/default/.password.hint` — optional plaintext hint
//!
//! Unlocked keys live in a [`KeyAgent`]; the vault only remembers which key
//! ids it registered, so an agent-side auto-lock is visible through
//! [`Vault::state`] without polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sesame_keychain::{
    create_master_key, decode_key_entries, derive_and_validate, read_item_index,
    rewrap_master_key, verify_rewrap, write_item_index, write_key_entries, ItemMetadata,
    KeyEntry, KeychainError, MasterKey, SecurityLevel,
};
use tokio::sync::broadcast;
use zeroize::Zeroizing;

use crate::agent::{KeyAgent, LockEvent};
use crate::config::VaultConfig;
use crate::error::{StorageError, VaultError};
use crate::queue::WriteQueue;
use crate::storage::{copy_recursive, join, remove_recursive, Storage};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Directory holding the keychain files, relative to the vault path.
pub const DATA_DIR: &str = "data/default";

/// Key table file name.
pub const KEY_TABLE_FILE: &str = "encryptionKeys.js";

/// Item index file name.
pub const INDEX_FILE: &str = "contents.js";

/// Passphrase hint file name.
pub const HINT_FILE: &str = ".password.hint";

/// Item file extension.
pub const ITEM_FILE_EXT: &str = "1password";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lock state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    Locked,
    /// An unlock is deriving keys.
    Unlocking,
    Unlocked,
}

/// Handle to one vault.
pub struct Vault {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) agent: Arc<dyn KeyAgent>,
    pub(crate) path: String,
    pub(crate) config: VaultConfig,
    pub(crate) queue: WriteQueue,
    unlocking: AtomicBool,
    /// Key id registered with the agent per security level.
    session: Mutex<HashMap<SecurityLevel, String>>,
}

/// Clears the unlocking flag however the unlock attempt ends.
struct UnlockingGuard<'a>(&'a AtomicBool);

impl<'a> UnlockingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for UnlockingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Run key derivation off the async executor.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, VaultError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, KeychainError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| VaultError::Internal(format!("crypto task failed: {e}")))?
        .map_err(VaultError::from)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

impl Vault {
    fn bind(
        storage: Arc<dyn Storage>,
        path: &str,
        agent: Arc<dyn KeyAgent>,
        config: VaultConfig,
    ) -> Self {
        Self {
            queue: WriteQueue::for_path(path),
            storage,
            agent,
            path: path.to_owned(),
            config,
            unlocking: AtomicBool::new(false),
            session: Mutex::new(HashMap::new()),
        }
    }

    /// Initialise an empty vault at `path`: one key entry at the configured
    /// security level, an empty index and an optional hint.
    ///
    /// The returned vault is locked.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::AlreadyExists` if a key table is already present,
    /// `VaultError::InvalidArgument` for an empty passphrase.
    pub async fn create(
        storage: Arc<dyn Storage>,
        path: &str,
        passphrase: &str,
        hint: Option<&str>,
        agent: Arc<dyn KeyAgent>,
        config: VaultConfig,
    ) -> Result<Self, VaultError> {
        if passphrase.is_empty() {
            return Err(VaultError::InvalidArgument("passphrase is empty".into()));
        }
        let vault = Self::bind(storage, path, agent, config);
        let _turn = vault.queue.acquire().await;

        match vault.storage.stat(&vault.data_path(KEY_TABLE_FILE)).await {
            Ok(_) => return Err(VaultError::AlreadyExists(path.to_owned())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let secret = Zeroizing::new(passphrase.as_bytes().to_vec());
        let level = vault.config.security_level;
        let iterations = vault.config.effective_iterations();
        let entry = blocking(move || {
            create_master_key(&secret, level, iterations).map(|(entry, _master)| entry)
        })
        .await?;

        vault.storage.mkpath(&vault.data_dir()).await?;
        vault.write_key_table(&[entry]).await?;
        vault
            .storage
            .write(&vault.data_path(INDEX_FILE), &write_item_index(&[])?)
            .await?;
        if let Some(hint) = hint {
            vault.write_hint(hint).await?;
        }

        tracing::info!(vault = %path, %level, iterations, "vault created");
        Ok(vault)
    }

    /// Bind to an existing vault at `path`. The vault starts locked.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::NotFound` if there is no key table at `path`.
    pub async fn open(
        storage: Arc<dyn Storage>,
        path: &str,
        agent: Arc<dyn KeyAgent>,
        config: VaultConfig,
    ) -> Result<Self, VaultError> {
        let vault = Self::bind(storage, path, agent, config);
        match vault.storage.stat(&vault.data_path(KEY_TABLE_FILE)).await {
            Ok(entry) if !entry.is_dir => Ok(vault),
            Ok(_) => Err(VaultError::Format(format!(
                "{KEY_TABLE_FILE} in {path} is a directory"
            ))),
            Err(e) if e.is_not_found() => Err(VaultError::NotFound(format!("vault {path}"))),
            Err(e) => Err(e.into()),
        }
    }

    /// Unlock with `passphrase`. Every key entry that validates is handed
    /// to the agent; entries that do not (another passphrase, a damaged
    /// envelope) are skipped.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Authentication` if no entry validates, and
    /// `VaultError::Format` if the key table is not valid JSON or is empty.
    /// The vault stays locked on error.
    pub async fn unlock(&self, passphrase: &str) -> Result<(), VaultError> {
        let _unlocking = UnlockingGuard::enter(&self.unlocking);

        let entries = self.read_key_table().await?;
        if entries.is_empty() {
            return Err(VaultError::Format("key table has no entries".into()));
        }
        let listed = entries.len();

        let secret = Zeroizing::new(passphrase.as_bytes().to_vec());
        let keys = blocking(move || {
            Ok::<_, KeychainError>(
                entries
                    .into_iter()
                    .filter_map(Result::ok)
                    .filter_map(|entry| {
                        derive_and_validate(&entry, &secret)
                            .ok()
                            .map(|key| (entry.level, key))
                    })
                    .collect::<Vec<_>>(),
            )
        })
        .await?;

        if keys.is_empty() {
            tracing::warn!(
                vault = %self.path,
                entries = listed,
                "unlock failed: no key entry validated"
            );
            return Err(VaultError::Authentication);
        }

        let mut session = HashMap::new();
        let count = keys.len();
        for (level, key) in keys {
            let (id, raw) = key.into_parts();
            self.agent.add_key(&id, raw).await?;
            session.entry(level).or_insert(id);
        }
        *self.session()? = session;

        if count < listed {
            tracing::warn!(
                vault = %self.path,
                skipped = listed.saturating_sub(count),
                "key entries did not validate"
            );
        }
        tracing::info!(vault = %self.path, keys = count, "vault unlocked");
        Ok(())
    }

    /// Forget all keys held by the agent.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Internal` if the agent fails.
    pub async fn lock(&self) -> Result<(), VaultError> {
        self.agent.forget_keys().await?;
        self.session()?.clear();
        tracing::info!(vault = %self.path, "vault locked");
        Ok(())
    }

    /// Current lock state. `Unlocked` only while the agent still holds every
    /// key this vault registered.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Internal` if the agent fails.
    pub async fn state(&self) -> Result<VaultState, VaultError> {
        if self.unlocking.load(Ordering::SeqCst) {
            return Ok(VaultState::Unlocking);
        }
        let ids: Vec<String> = self.session()?.values().cloned().collect();
        if ids.is_empty() {
            return Ok(VaultState::Locked);
        }
        let held = self.agent.list_keys().await?;
        if ids.iter().all(|id| held.contains(id)) {
            Ok(VaultState::Unlocked)
        } else {
            Ok(VaultState::Locked)
        }
    }

    /// Rewrap every key entry under `new_passphrase`. Item payloads are not
    /// touched. `hint`, when given, replaces the stored hint.
    ///
    /// Each rewrapped entry is unlocked again with the new passphrase and
    /// compared with the original key before the table is replaced.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Authentication` if `old_passphrase` does not
    /// unlock every entry, `VaultError::InvalidArgument` for an empty new
    /// passphrase, and `VaultError::Integrity` if a rewrapped entry fails
    /// to verify. Nothing is written on error.
    pub async fn change_password(
        &self,
        old_passphrase: &str,
        new_passphrase: &str,
        hint: Option<&str>,
    ) -> Result<(), VaultError> {
        self.change_password_with(old_passphrase, new_passphrase, hint, rewrap_master_key)
            .await
    }

    async fn change_password_with<R>(
        &self,
        old_passphrase: &str,
        new_passphrase: &str,
        hint: Option<&str>,
        rewrap: R,
    ) -> Result<(), VaultError>
    where
        R: Fn(&MasterKey, SecurityLevel, &[u8], u32) -> Result<KeyEntry, KeychainError>
            + Send
            + 'static,
    {
        if new_passphrase.is_empty() {
            return Err(VaultError::InvalidArgument("new passphrase is empty".into()));
        }
        let _turn = self.queue.acquire().await;

        let entries = self.read_key_table().await?;
        let old = Zeroizing::new(old_passphrase.as_bytes().to_vec());
        let new = Zeroizing::new(new_passphrase.as_bytes().to_vec());
        let iterations = self.config.effective_iterations();

        let rewrapped = blocking(move || {
            entries
                .into_iter()
                .map(|entry| {
                    let entry = entry.map_err(|_| KeychainError::Authentication)?;
                    let key = derive_and_validate(&entry, &old)?;
                    let fresh = rewrap(&key, entry.level, &new, iterations)?;
                    verify_rewrap(&fresh, &new, &key)?;
                    Ok(fresh)
                })
                .collect::<Result<Vec<KeyEntry>, KeychainError>>()
        })
        .await
        .inspect_err(|e| tracing::warn!(vault = %self.path, "password change failed: {e}"))?;

        self.write_key_table(&rewrapped).await?;
        if let Some(hint) = hint {
            self.write_hint(hint).await?;
        }

        tracing::info!(vault = %self.path, keys = rewrapped.len(), "vault passphrase changed");
        Ok(())
    }

    /// The stored passphrase hint, if any.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Storage` for backend failures other than a
    /// missing hint file.
    pub async fn password_hint(&self) -> Result<Option<String>, VaultError> {
        match self.storage.read(&self.data_path(HINT_FILE)).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).trim_end().to_owned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy the whole vault directory to `dest` on the same storage.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::AlreadyExists` if `dest` exists.
    pub async fn backup_to(&self, dest: &str) -> Result<(), VaultError> {
        let _turn = self.queue.acquire().await;
        match self.storage.stat(dest).await {
            Ok(_) => return Err(VaultError::AlreadyExists(dest.to_owned())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        copy_recursive(self.storage.as_ref(), &self.path, dest).await?;
        tracing::info!(vault = %self.path, backup = %dest, "vault backed up");
        Ok(())
    }

    /// Lock the vault and delete its directory tree.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Storage` if removal fails part-way.
    pub async fn destroy(self) -> Result<(), VaultError> {
        self.lock().await?;
        let _turn = self.queue.acquire().await;
        remove_recursive(self.storage.as_ref(), &self.path).await?;
        tracing::info!(vault = %self.path, "vault removed");
        Ok(())
    }

    /// Subscribe to the agent's lock notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.agent.subscribe()
    }

    /// Storage path of this vault.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn config(&self) -> &VaultConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Shared helpers (used by item operations)
// ---------------------------------------------------------------------------

impl Vault {
    fn session(&self) -> Result<MutexGuard<'_, HashMap<SecurityLevel, String>>, VaultError> {
        self.session
            .lock()
            .map_err(|_| VaultError::Internal("vault session lock poisoned".into()))
    }

    pub(crate) fn data_dir(&self) -> String {
        join(&self.path, DATA_DIR)
    }

    pub(crate) fn data_path(&self, name: &str) -> String {
        join(&self.data_dir(), name)
    }

    pub(crate) fn item_path(&self, uuid: &str) -> String {
        self.data_path(&format!("{uuid}.{ITEM_FILE_EXT}"))
    }

    /// Key id registered for `level`.
    pub(crate) fn session_key(&self, level: SecurityLevel) -> Result<String, VaultError> {
        self.session()?.get(&level).cloned().ok_or(VaultError::Locked)
    }

    pub(crate) async fn ensure_unlocked(&self) -> Result<(), VaultError> {
        match self.state().await? {
            VaultState::Unlocked => Ok(()),
            VaultState::Locked | VaultState::Unlocking => Err(VaultError::Locked),
        }
    }

    /// The key table, one decode result per entry.
    async fn read_key_table(&self) -> Result<Vec<Result<KeyEntry, KeychainError>>, VaultError> {
        let bytes = self
            .storage
            .read(&self.data_path(KEY_TABLE_FILE))
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => VaultError::NotFound(format!("vault {}", self.path)),
                other => other.into(),
            })?;
        Ok(decode_key_entries(&bytes)?)
    }

    async fn write_key_table(&self, entries: &[KeyEntry]) -> Result<(), VaultError> {
        let bytes = write_key_entries(entries)?;
        self.storage
            .write(&self.data_path(KEY_TABLE_FILE), &bytes)
            .await?;
        Ok(())
    }

    async fn write_hint(&self, hint: &str) -> Result<(), VaultError> {
        self.storage
            .write(&self.data_path(HINT_FILE), hint.as_bytes())
            .await?;
        Ok(())
    }

    /// The item index. A vault without one has no items.
    pub(crate) async fn read_index(&self) -> Result<Vec<ItemMetadata>, VaultError> {
        match self.storage.read(&self.data_path(INDEX_FILE)).await {
            Ok(bytes) => Ok(read_item_index(&bytes)?),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn write_index(&self, items: &[ItemMetadata]) -> Result<(), VaultError> {
        let bytes = write_item_index(items)?;
        self.storage
            .write(&self.data_path(INDEX_FILE), &bytes)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
