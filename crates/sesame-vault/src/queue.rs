//! Per-path write queue.
//!
//! Every mutation of a vault path runs while holding that path's queue
//! guard. The guard is a fair `tokio::sync::Mutex`, so writers proceed in
//! arrival order. Reads never take it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use tokio::sync::OwnedMutexGuard;

type QueueLock = tokio::sync::Mutex<()>;

fn registry() -> &'static Mutex<HashMap<String, Weak<QueueLock>>> {
    static QUEUES: OnceLock<Mutex<HashMap<String, Weak<QueueLock>>>> = OnceLock::new();
    QUEUES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// FIFO write queue shared by every handle on the same path in this process.
#[derive(Clone, Debug)]
pub struct WriteQueue {
    lock: Arc<QueueLock>,
}

impl WriteQueue {
    /// The queue for `path`, created on first use.
    #[must_use]
    pub fn for_path(path: &str) -> Self {
        let mut queues = registry().lock().unwrap_or_else(PoisonError::into_inner);
        queues.retain(|_, weak| weak.strong_count() > 0);

        if let Some(lock) = queues.get(path).and_then(Weak::upgrade) {
            return Self { lock };
        }
        let lock = Arc::new(QueueLock::new(()));
        queues.insert(path.to_owned(), Arc::downgrade(&lock));
        Self { lock }
    }

    /// Wait for this writer's turn.
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.lock).lock_owned().await
    }

    /// Whether two handles share one queue.
    #[must_use]
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.lock, &other.lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn same_path_shares_queue() {
        let a = WriteQueue::for_path("vaults/queue-test-a");
        let b = WriteQueue::for_path("vaults/queue-test-a");
        let c = WriteQueue::for_path("vaults/queue-test-c");
        assert!(a.same_queue(&b));
        assert!(!a.same_queue(&c));
    }

    #[test]
    fn released_queues_are_recreated() {
        let first = WriteQueue::for_path("vaults/queue-test-drop");
        drop(first);
        let second = WriteQueue::for_path("vaults/queue-test-drop");
        assert_eq!(Arc::strong_count(&second.lock), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writers_run_in_arrival_order() {
        let queue = WriteQueue::for_path("vaults/queue-test-order");
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = queue.acquire().await;
        let mut tasks = Vec::new();
        for i in 0..5u32 {
            let queue = queue.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _turn = queue.acquire().await;
                order.lock().unwrap().push(i);
            }));
            // Let each task enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        drop(guard);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
