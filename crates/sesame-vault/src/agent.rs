//! Key agent: in-memory custody of unlocked master keys.
//!
//! - [`KeyAgent`] — the async contract (add, list, forget, encrypt, decrypt,
//!   lock notifications)
//! - [`LocalKeyAgent`] — in-process implementation with an idle auto-lock
//!
//! Raw keys never leave the agent: callers hand it ciphertext and
//! [`CryptoParams`] and get plaintext back. Cipher work runs on the
//! blocking pool.
//!
//! # Auto-lock
//!
//! A single timer task watches an idle deadline. Adding a key or a
//! successful encrypt/decrypt pushes the deadline out; on expiry the keys
//! are forgotten and a [`LockEvent`] with [`LockReason::Timeout`] is
//! broadcast. Every forget bumps a lock epoch, so an operation that started
//! before the forget reports [`VaultError::Locked`] instead of returning
//! its result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use sesame_keychain::{cipher, CryptoParams, SecretBuffer};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::VaultConfig;
use crate::error::VaultError;

/// Capacity of the lock notification channel. Slow subscribers that fall
/// further behind observe `RecvError::Lagged`.
const EVENT_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Why the agent forgot its keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockReason {
    /// `forget_keys` was called.
    Explicit,
    /// The idle timer expired.
    Timeout,
}

/// Broadcast to every subscriber each time the keys are forgotten.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockEvent {
    pub reason: LockReason,
}

/// Holder of decrypted key material.
#[async_trait]
pub trait KeyAgent: Send + Sync {
    /// Store `key` under `id`, replacing any previous key with that id.
    async fn add_key(&self, id: &str, key: SecretBuffer) -> Result<(), VaultError>;

    /// Ids of the keys currently held, sorted.
    async fn list_keys(&self) -> Result<Vec<String>, VaultError>;

    /// Zero and discard every key, then notify subscribers.
    async fn forget_keys(&self) -> Result<(), VaultError>;

    /// Decrypt `ciphertext` with the key held under `id`.
    async fn decrypt(
        &self,
        id: &str,
        ciphertext: &[u8],
        params: &CryptoParams,
    ) -> Result<SecretBuffer, VaultError>;

    /// Encrypt `plaintext` with the key held under `id`.
    async fn encrypt(
        &self,
        id: &str,
        plaintext: &[u8],
        params: &CryptoParams,
    ) -> Result<Vec<u8>, VaultError>;

    /// Subscribe to lock notifications. No replay: only events after the
    /// call are received.
    fn subscribe(&self) -> broadcast::Receiver<LockEvent>;
}

// ---------------------------------------------------------------------------
// In-process agent
// ---------------------------------------------------------------------------

struct AgentState {
    keys: Mutex<HashMap<String, Arc<SecretBuffer>>>,
    epoch: AtomicU64,
    idle_timeout: Option<Duration>,
    deadline: watch::Sender<Option<Instant>>,
    events: broadcast::Sender<LockEvent>,
}

impl AgentState {
    fn keys(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<SecretBuffer>>>, VaultError> {
        self.keys
            .lock()
            .map_err(|_| VaultError::Internal("key agent lock poisoned".into()))
    }

    /// Push the idle deadline out. Caller holds the key lock.
    fn touch(&self, keys: &HashMap<String, Arc<SecretBuffer>>) {
        let next = if keys.is_empty() {
            None
        } else {
            self.idle_timeout
                .and_then(|timeout| Instant::now().checked_add(timeout))
        };
        self.deadline.send_replace(next);
    }

    /// Clear keys and notify. Caller holds the key lock.
    fn forget(&self, keys: &mut HashMap<String, Arc<SecretBuffer>>, reason: LockReason) {
        let count = keys.len();
        keys.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.deadline.send_replace(None);
        // No subscribers is not an error.
        let _ = self.events.send(LockEvent { reason });
        tracing::info!(keys = count, ?reason, "key agent locked");
    }

    /// Held key and the epoch it was read under.
    fn key_for(&self, id: &str) -> Result<(Arc<SecretBuffer>, u64), VaultError> {
        let keys = self.keys()?;
        let key = keys.get(id).cloned().ok_or(VaultError::Locked)?;
        Ok((key, self.epoch.load(Ordering::SeqCst)))
    }

    /// Discard results computed across a forget; reset the idle timer
    /// after a successful operation.
    fn finish(&self, epoch: u64, succeeded: bool) -> Result<(), VaultError> {
        let keys = self.keys()?;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(VaultError::Locked);
        }
        if succeeded {
            self.touch(&keys);
        }
        Ok(())
    }

    fn expire(&self, at: Instant) -> Result<(), VaultError> {
        let mut keys = self.keys()?;
        if *self.deadline.borrow() != Some(at) {
            // Activity moved the deadline while the timer was waking.
            return Ok(());
        }
        tracing::info!("auto-lock idle timeout expired");
        self.forget(&mut keys, LockReason::Timeout);
        Ok(())
    }
}

/// In-process [`KeyAgent`] with an idle auto-lock timer.
pub struct LocalKeyAgent {
    state: Arc<AgentState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl LocalKeyAgent {
    /// Agent that forgets its keys after `idle_timeout` without activity.
    /// `None` disables auto-lock.
    #[must_use]
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        let (deadline, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(AgentState {
                keys: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
                idle_timeout: idle_timeout.filter(|t| !t.is_zero()),
                deadline,
                events,
            }),
            timer: Mutex::new(None),
        }
    }

    /// Agent using the idle timeout from `config`.
    #[must_use]
    pub fn from_config(config: &VaultConfig) -> Self {
        Self::new(config.auto_lock_timeout())
    }

    /// Start the timer task on first use. Requires a Tokio runtime.
    fn ensure_timer(&self) -> Result<(), VaultError> {
        if self.state.idle_timeout.is_none() {
            return Ok(());
        }
        let mut timer = self
            .timer
            .lock()
            .map_err(|_| VaultError::Internal("key agent timer lock poisoned".into()))?;
        if timer.is_some() {
            return Ok(());
        }

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| VaultError::Internal(format!("auto-lock needs a Tokio runtime: {e}")))?;
        let state = Arc::downgrade(&self.state);
        let deadline_rx = self.state.deadline.subscribe();
        *timer = Some(handle.spawn(run_timer(state, deadline_rx)));
        Ok(())
    }
}

impl Default for LocalKeyAgent {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Drop for LocalKeyAgent {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }
}

async fn run_timer(state: Weak<AgentState>, mut deadline_rx: watch::Receiver<Option<Instant>>) {
    loop {
        let deadline = *deadline_rx.borrow_and_update();
        let Some(at) = deadline else {
            if deadline_rx.changed().await.is_err() {
                return;
            }
            continue;
        };

        tokio::select! {
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            () = tokio::time::sleep_until(at) => {
                let Some(state) = state.upgrade() else {
                    return;
                };
                if let Err(e) = state.expire(at) {
                    tracing::warn!("auto-lock failed: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl KeyAgent for LocalKeyAgent {
    async fn add_key(&self, id: &str, key: SecretBuffer) -> Result<(), VaultError> {
        if id.is_empty() {
            return Err(VaultError::InvalidArgument("key id is empty".into()));
        }
        self.ensure_timer()?;

        let mut keys = self.state.keys()?;
        keys.insert(id.to_owned(), Arc::new(key));
        self.state.touch(&keys);
        tracing::debug!(key_id = %id, "key added to agent");
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, VaultError> {
        let mut ids: Vec<String> = self.state.keys()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn forget_keys(&self) -> Result<(), VaultError> {
        let mut keys = self.state.keys()?;
        self.state.forget(&mut keys, LockReason::Explicit);
        Ok(())
    }

    async fn decrypt(
        &self,
        id: &str,
        ciphertext: &[u8],
        params: &CryptoParams,
    ) -> Result<SecretBuffer, VaultError> {
        let (key, epoch) = self.state.key_for(id)?;
        let ciphertext = ciphertext.to_vec();
        let params = params.clone();

        let result = tokio::task::spawn_blocking(move || {
            cipher::decrypt(key.expose(), &ciphertext, &params)
        })
        .await
        .map_err(|e| VaultError::Internal(format!("decrypt task failed: {e}")))?;

        self.state.finish(epoch, result.is_ok())?;
        Ok(result?)
    }

    async fn encrypt(
        &self,
        id: &str,
        plaintext: &[u8],
        params: &CryptoParams,
    ) -> Result<Vec<u8>, VaultError> {
        let (key, epoch) = self.state.key_for(id)?;
        let plaintext = zeroize::Zeroizing::new(plaintext.to_vec());
        let params = params.clone();

        let result = tokio::task::spawn_blocking(move || {
            cipher::encrypt(key.expose(), &plaintext, &params)
        })
        .await
        .map_err(|e| VaultError::Internal(format!("encrypt task failed: {e}")))?;

        self.state.finish(epoch, result.is_ok())?;
        Ok(result?)
    }

    fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.state.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sesame_keychain::cipher::CipherId;

    fn key() -> SecretBuffer {
        SecretBuffer::new(b"0123456789abcdef0123456789abcdef").unwrap()
    }

    fn params() -> CryptoParams {
        CryptoParams::new(CipherId::Aes128OpenSslKey, [3u8; 8], 1)
    }

    #[tokio::test]
    async fn encrypt_decrypt_with_held_key() {
        let agent = LocalKeyAgent::default();
        agent.add_key("K1", key()).await.unwrap();

        let ct = agent.encrypt("K1", b"hello", &params()).await.unwrap();
        let pt = agent.decrypt("K1", &ct, &params()).await.unwrap();
        assert_eq!(pt.expose(), b"hello");
    }

    #[tokio::test]
    async fn unknown_id_is_locked() {
        let agent = LocalKeyAgent::default();
        let err = agent.decrypt("nope", &[0u8; 16], &params()).await.unwrap_err();
        assert!(matches!(err, VaultError::Locked));
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let agent = LocalKeyAgent::default();
        let err = agent.add_key("", key()).await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn forget_clears_keys_and_notifies() {
        let agent = LocalKeyAgent::default();
        let mut events = agent.subscribe();
        agent.add_key("B", key()).await.unwrap();
        agent.add_key("A", key()).await.unwrap();
        assert_eq!(agent.list_keys().await.unwrap(), vec!["A", "B"]);

        agent.forget_keys().await.unwrap();
        assert!(agent.list_keys().await.unwrap().is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            LockEvent {
                reason: LockReason::Explicit
            }
        );

        let err = agent.encrypt("A", b"x", &params()).await.unwrap_err();
        assert!(matches!(err, VaultError::Locked));
    }

    #[tokio::test]
    async fn bad_padding_is_integrity_error() {
        let agent = LocalKeyAgent::default();
        agent.add_key("K", key()).await.unwrap();
        let err = agent.decrypt("K", &[0u8; 15], &params()).await.unwrap_err();
        assert!(matches!(err, VaultError::Integrity(_)));
    }

    #[tokio::test]
    async fn add_key_overwrites() {
        let agent = LocalKeyAgent::default();
        agent.add_key("K", key()).await.unwrap();
        let ct = agent.encrypt("K", b"data", &params()).await.unwrap();

        agent
            .add_key("K", SecretBuffer::new(b"another key entirely").unwrap())
            .await
            .unwrap();
        assert_eq!(agent.list_keys().await.unwrap().len(), 1);
        let result = agent.decrypt("K", &ct, &params()).await;
        assert!(result.map_or(true, |pt| pt.expose() != b"data"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_forgets_keys() {
        let agent = LocalKeyAgent::new(Some(Duration::from_secs(60)));
        let mut events = agent.subscribe();
        agent.add_key("K", key()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(agent.list_keys().await.unwrap(), vec!["K"]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(agent.list_keys().await.unwrap().is_empty());
        assert_eq!(events.recv().await.unwrap().reason, LockReason::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn add_key_resets_idle_timer() {
        let agent = LocalKeyAgent::new(Some(Duration::from_secs(60)));
        agent.add_key("K", key()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(45)).await;
        agent.add_key("L", key()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(agent.list_keys().await.unwrap(), vec!["K", "L"]);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(agent.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn config_timeout_drives_auto_lock() {
        let config = VaultConfig {
            auto_lock_timeout_secs: 30,
            ..VaultConfig::default()
        };
        let agent = LocalKeyAgent::from_config(&config);
        agent.add_key("K", key()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(agent.list_keys().await.unwrap(), vec!["K"]);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(agent.list_keys().await.unwrap().is_empty());

        let disabled = LocalKeyAgent::from_config(&VaultConfig {
            auto_lock_timeout_secs: 0,
            ..VaultConfig::default()
        });
        disabled.add_key("K", key()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(86_400)).await;
        assert_eq!(disabled.list_keys().await.unwrap(), vec!["K"]);
    }

    #[test]
    fn result_across_forget_is_discarded() {
        let agent = LocalKeyAgent::default();
        agent.state.keys().unwrap().insert("K".into(), Arc::new(key()));

        let (_, epoch) = agent.state.key_for("K").unwrap();
        let mut keys = agent.state.keys().unwrap();
        agent.state.forget(&mut keys, LockReason::Explicit);
        drop(keys);

        assert!(matches!(
            agent.state.finish(epoch, true),
            Err(VaultError::Locked)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forget_during_decrypt_reports_locked() {
        let agent = LocalKeyAgent::default();
        agent.add_key("K", key()).await.unwrap();
        let plaintext = vec![0x5Au8; 8 * 1024 * 1024];
        let ct = agent.encrypt("K", &plaintext, &params()).await.unwrap();

        let p = params();
        let pending = agent.decrypt("K", &ct, &p);
        tokio::pin!(pending);
        // One poll hands the ciphertext to the blocking pool.
        let early = tokio::select! {
            biased;
            result = &mut pending => Some(result),
            () = std::future::ready(()) => None,
        };
        assert!(early.is_none(), "8 MiB decrypt finished within one poll");

        agent.forget_keys().await.unwrap();
        assert!(matches!(pending.await, Err(VaultError::Locked)));
    }

    #[tokio::test(start_paused = true)]
    async fn no_timeout_never_locks() {
        let agent = LocalKeyAgent::new(None);
        agent.add_key("K", key()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(86_400)).await;
        assert_eq!(agent.list_keys().await.unwrap(), vec!["K"]);
    }
}
