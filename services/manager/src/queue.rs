//! Per-key serialized action queue over a bounded worker pool.
//!
//! Guarantees:
//!
//! - At most one action per key is executing at any instant.
//! - Actions for the same key run in submission order.
//! - Actions for distinct keys run in parallel, bounded by the worker limit.
//! - On shutdown, in-flight actions finish; queued actions are dropped.
//! - A panicking action releases its key and surfaces a fatal event; the
//!   queue itself keeps running.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axle_id::InstanceId;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tracing::{debug, error, warn};

/// Key identifying the serialization domain of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKey {
    /// Per-instance actions: install, start, stop, update, state acceptance.
    Instance(InstanceId),
    /// Node-wide maintenance actions (service GC, orphan cleanup).
    Maintenance,
}

impl std::fmt::Display for ActionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instance(id) => write!(f, "{id}"),
            Self::Maintenance => f.write_str("maintenance"),
        }
    }
}

/// Executes queued actions. Implemented by the engine.
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    type Action: Send + 'static;

    /// Runs one action to completion. `shutdown` flips to true when the
    /// manager is stopping; long actions may honor it and return early.
    async fn execute(&self, action: Self::Action, shutdown: watch::Receiver<bool>);
}

/// Fatal event surfaced when an action panics.
#[derive(Debug, Clone)]
pub struct QueueFatal {
    pub key: String,
    pub message: String,
}

struct KeyState<A> {
    pending: VecDeque<A>,
    busy: bool,
}

struct QueueShared<A> {
    keys: Mutex<HashMap<ActionKey, KeyState<A>>>,
    permits: Semaphore,
    shutdown: watch::Receiver<bool>,
    fatal_tx: mpsc::UnboundedSender<QueueFatal>,
    idle: Notify,
}

/// The per-key FIFO serializer.
pub struct ActionQueue<E: ActionExecutor> {
    executor: Arc<E>,
    shared: Arc<QueueShared<E::Action>>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<QueueFatal>>>,
}

impl<E: ActionExecutor> ActionQueue<E> {
    /// Creates a queue with the given worker limit.
    pub fn new(executor: Arc<E>, workers: usize, shutdown: watch::Receiver<bool>) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        Self {
            executor,
            shared: Arc::new(QueueShared {
                keys: Mutex::new(HashMap::new()),
                permits: Semaphore::new(workers.max(1)),
                shutdown,
                fatal_tx,
                idle: Notify::new(),
            }),
            fatal_rx: Mutex::new(Some(fatal_rx)),
        }
    }

    /// Takes the fatal event receiver. Can be taken once.
    pub fn fatal_events(&self) -> Option<mpsc::UnboundedReceiver<QueueFatal>> {
        self.fatal_rx.lock().unwrap().take()
    }

    /// Enqueues an action for its key and returns immediately.
    ///
    /// After shutdown has been signaled, submissions are dropped.
    pub fn submit(&self, key: ActionKey, action: E::Action) {
        if *self.shared.shutdown.borrow() {
            warn!(key = %key, "queue is shutting down, dropping action");
            return;
        }

        let dispatch = {
            let mut keys = self.shared.keys.lock().unwrap();
            let state = keys.entry(key).or_insert_with(|| KeyState {
                pending: VecDeque::new(),
                busy: false,
            });
            state.pending.push_back(action);

            if state.busy {
                false
            } else {
                state.busy = true;
                true
            }
        };

        if dispatch {
            let shared = Arc::clone(&self.shared);
            let executor = Arc::clone(&self.executor);
            tokio::spawn(run_key(shared, executor, key));
        }
    }

    /// True when no key has pending or in-flight actions.
    pub fn is_empty(&self) -> bool {
        self.shared.keys.lock().unwrap().is_empty()
    }

    /// Waits until the queue is empty.
    pub async fn drained(&self) {
        loop {
            if self.is_empty() {
                return;
            }
            // The notify is an optimization; the timeout guards against a
            // wakeup lost between the emptiness check and the wait.
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(50),
                self.shared.idle.notified(),
            )
            .await;
        }
    }
}

/// Drains one key's deque, one action at a time, holding a worker permit
/// only while an action is actually executing.
async fn run_key<E: ActionExecutor>(
    shared: Arc<QueueShared<E::Action>>,
    executor: Arc<E>,
    key: ActionKey,
) {
    loop {
        let shutting_down = *shared.shutdown.borrow();

        let action = {
            let mut keys = shared.keys.lock().unwrap();
            let Some(state) = keys.get_mut(&key) else {
                break;
            };

            if shutting_down {
                let dropped = state.pending.len();
                if dropped > 0 {
                    debug!(key = %key, dropped, "dropping queued actions on shutdown");
                }
                keys.remove(&key);
                break;
            }

            match state.pending.pop_front() {
                Some(action) => action,
                None => {
                    keys.remove(&key);
                    break;
                }
            }
        };

        let permit = match shared.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        // Shutdown may have been signaled while waiting for a worker slot;
        // queued actions must not begin execution after that point.
        if *shared.shutdown.borrow() {
            drop(permit);
            continue;
        }

        let shutdown = shared.shutdown.clone();
        let exec = Arc::clone(&executor);
        let handle = tokio::spawn(async move {
            exec.execute(action, shutdown).await;
        });

        if let Err(join_err) = handle.await {
            if join_err.is_panic() {
                error!(key = %key, "action panicked");
                let _ = shared.fatal_tx.send(QueueFatal {
                    key: key.to_string(),
                    message: format!("action panicked: {join_err}"),
                });
            }
        }

        drop(permit);
    }

    if shared.keys.lock().unwrap().is_empty() {
        shared.idle.notify_waiters();
    }
}
