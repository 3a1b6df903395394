//! Per-conversation serialization of handler work.
//!
//! Each conversation key maps to the tail of its lane: the ticket of the most
//! recently appended task and a shared signal that fires when that task
//! settles. A new task chains onto the previous tail, so tasks for one key run
//! strictly in submission order while distinct keys proceed concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{FutureExt, Shared};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

type ChatLaneSettleSignal = Shared<oneshot::Receiver<()>>;

struct ChatLaneTail {
    ticket: u64,
    settled: ChatLaneSettleSignal,
}

#[derive(Default)]
struct ChatLaneRegistry {
    lanes: Mutex<HashMap<String, ChatLaneTail>>,
    next_ticket: AtomicU64,
}

impl ChatLaneRegistry {
    fn lock_lanes(&self) -> MutexGuard<'_, HashMap<String, ChatLaneTail>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the lane entry when the owning task settles, but only if no later
/// task has been appended behind it, then releases the settle signal.
struct ChatLaneSettleGuard {
    registry: Arc<ChatLaneRegistry>,
    key: String,
    ticket: u64,
    signal: Option<oneshot::Sender<()>>,
}

impl Drop for ChatLaneSettleGuard {
    fn drop(&mut self) {
        {
            let mut lanes = self.registry.lock_lanes();
            if lanes
                .get(&self.key)
                .is_some_and(|tail| tail.ticket == self.ticket)
            {
                lanes.remove(&self.key);
            }
        }
        if let Some(signal) = self.signal.take() {
            let _ = signal.send(());
        }
    }
}

/// Runs tasks one at a time per key, in submission order.
#[derive(Clone, Default)]
pub struct ChatLaneSequencer {
    registry: Arc<ChatLaneRegistry>,
    permits: Option<Arc<Semaphore>>,
}

impl ChatLaneSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps how many lanes run a task at once. Waiters are served in FIFO order.
    pub fn with_max_concurrent_lanes(max_concurrent_lanes: usize) -> Self {
        Self {
            registry: Arc::default(),
            permits: Some(Arc::new(Semaphore::new(max_concurrent_lanes.max(1)))),
        }
    }

    /// Appends `task` to the lane for `key` and spawns it.
    ///
    /// The task starts once its predecessor has settled, whether that
    /// predecessor returned, failed or panicked; the predecessor's outcome is
    /// not observed. The returned handle yields this task's own outcome.
    pub fn run_exclusive<F, T>(&self, key: &str, task: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let ticket = self.registry.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (signal, settled) = oneshot::channel();
        let previous = self
            .registry
            .lock_lanes()
            .insert(
                key.to_string(),
                ChatLaneTail {
                    ticket,
                    settled: settled.shared(),
                },
            )
            .map(|tail| tail.settled);

        let guard = ChatLaneSettleGuard {
            registry: Arc::clone(&self.registry),
            key: key.to_string(),
            ticket,
            signal: Some(signal),
        };
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let _permit = match permits {
                Some(permits) => permits.acquire_owned().await.ok(),
                None => None,
            };
            task.await
        })
    }

    /// Number of keys with a queued or running task.
    pub fn active_lanes(&self) -> usize {
        self.registry.lock_lanes().len()
    }
}
