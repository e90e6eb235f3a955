//! Instance runner: bridges the supervisor's raw unit transitions into a
//! stable, debounced instance state.
//!
//! Embedded supervisors bounce units during startup (restart-on-failure,
//! slow dependencies); publishing every flap would flood the cloud and
//! corrupt the reconciler's view. The runner keeps, per instance:
//!
//! - `last_published`: the last stable state handed out,
//! - `pending`: the most recent raw transition's projection,
//! - a debounce deadline armed on every transition that differs from
//!   `last_published`.
//!
//! When the deadline fires and `pending` still differs, the pending state
//! becomes the published one. A failure that recovers inside the window
//! produces no status at all.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axle_id::InstanceId;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::model::{instance_id_from_unit, unit_name, InstanceState, InstanceStatus};
use crate::supervisor::{StartParams, SupervisorError, UnitState, UnitSupervisor, UnitTransition};

/// Synchronous first-shot result of a start.
#[derive(Debug, Clone)]
pub struct StartResult {
    pub state: InstanceState,
    pub err: Option<String>,
}

impl StartResult {
    fn active() -> Self {
        Self {
            state: InstanceState::Active,
            err: None,
        }
    }

    fn failed(err: impl Into<String>) -> Self {
        Self {
            state: InstanceState::Failed,
            err: Some(err.into()),
        }
    }
}

/// Answer delivered to a start waiter.
#[derive(Debug, Clone, Copy)]
enum FirstShot {
    State(UnitState),
    TimedOut,
}

/// Bounded queue of status batches with drop-oldest overflow.
///
/// The debouncer never blocks on a slow consumer: when the queue is full
/// the oldest batch is discarded and a backpressure counter increments.
#[derive(Clone)]
pub struct StatusStream {
    shared: Arc<StatusShared>,
}

struct StatusShared {
    batches: Mutex<VecDeque<Vec<InstanceStatus>>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl StatusStream {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(StatusShared {
                batches: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn push(&self, batch: Vec<InstanceStatus>) {
        if batch.is_empty() {
            return;
        }

        {
            let mut queue = self.shared.batches.lock().unwrap();
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "status consumer is lagging, dropped oldest batch");
            }
            queue.push_back(batch);
        }

        self.shared.notify.notify_waiters();
    }

    /// Waits for the next status batch.
    pub async fn recv(&self) -> Vec<InstanceStatus> {
        loop {
            if let Some(batch) = self.try_recv() {
                return batch;
            }
            // The timeout guards against a notification lost between the
            // queue check and the wait.
            let _ = tokio::time::timeout(
                Duration::from_millis(50),
                self.shared.notify.notified(),
            )
            .await;
        }
    }

    /// Pops a batch if one is ready.
    pub fn try_recv(&self) -> Option<Vec<InstanceStatus>> {
        self.shared.batches.lock().unwrap().pop_front()
    }

    /// Number of batches discarded under backpressure.
    pub fn dropped_batches(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

struct UnitEntry {
    instance_id: InstanceId,
    start_interval: Duration,
    last_published: InstanceState,
    pending: InstanceState,
    deadline: Option<Instant>,
    waiter: Option<oneshot::Sender<FirstShot>>,
}

struct RunnerInner {
    units: HashMap<String, UnitEntry>,
}

/// The runner. One per manager; owns the supervisor subscription.
pub struct Runner {
    supervisor: Arc<dyn UnitSupervisor>,
    inner: Arc<Mutex<RunnerInner>>,
    statuses: StatusStream,
    default_start_interval: Duration,
    /// Wakes the monitor when a caller arms a new deadline.
    recheck: Arc<Notify>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Runner {
    /// Creates the runner and spawns its monitor task.
    pub fn new(
        supervisor: Arc<dyn UnitSupervisor>,
        status_capacity: usize,
        default_start_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let runner = Arc::new(Self {
            supervisor,
            inner: Arc::new(Mutex::new(RunnerInner {
                units: HashMap::new(),
            })),
            statuses: StatusStream::new(status_capacity),
            default_start_interval,
            recheck: Arc::new(Notify::new()),
            monitor: Mutex::new(None),
        });

        let handle = tokio::spawn(monitor_loop(
            Arc::clone(&runner.supervisor),
            Arc::clone(&runner.inner),
            runner.statuses.clone(),
            runner.default_start_interval,
            Arc::clone(&runner.recheck),
            shutdown,
        ));
        *runner.monitor.lock().unwrap() = Some(handle);

        runner
    }

    /// Post-start stable transitions, batched.
    pub fn status_stream(&self) -> StatusStream {
        self.statuses.clone()
    }

    /// Starts the supervised unit of an instance and waits for the first
    /// stable verdict within `params.start_interval`.
    pub async fn start_instance(
        &self,
        instance_id: InstanceId,
        service_path: &Path,
        params: StartParams,
    ) -> StartResult {
        let unit = unit_name(&instance_id);
        info!(
            instance_id = %instance_id,
            unit = %unit,
            path = %service_path.display(),
            "starting instance"
        );

        let rx = {
            let mut inner = self.inner.lock().unwrap();
            let (tx, rx) = oneshot::channel();
            inner.units.insert(
                unit.clone(),
                UnitEntry {
                    instance_id,
                    start_interval: params.start_interval,
                    last_published: InstanceState::Activating,
                    pending: InstanceState::Activating,
                    deadline: Some(Instant::now() + params.start_interval),
                    waiter: Some(tx),
                },
            );
            rx
        };
        // notify_one stores a permit when the monitor is mid-iteration, so
        // the wakeup cannot be lost.
        self.recheck.notify_one();

        if let Err(e) = self.supervisor.start(&unit, params).await {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.units.get_mut(&unit) {
                entry.waiter = None;
                entry.deadline = None;
                entry.last_published = InstanceState::Failed;
                entry.pending = InstanceState::Failed;
            }
            return StartResult::failed(e.to_string());
        }

        match rx.await {
            Ok(FirstShot::State(UnitState::Active)) => StartResult::active(),
            Ok(FirstShot::State(state)) => {
                StartResult::failed(format!("unit entered {state:?} during start"))
            }
            Ok(FirstShot::TimedOut) => {
                StartResult::failed("no stable state within start interval")
            }
            Err(_) => StartResult::failed("start interrupted before a stable state was observed"),
        }
    }

    /// Stops the supervised unit of an instance. Succeeds for instances the
    /// runner never started.
    pub async fn stop_instance(&self, instance_id: InstanceId) -> Result<(), SupervisorError> {
        let unit = unit_name(&instance_id);
        info!(instance_id = %instance_id, unit = %unit, "stopping instance");

        // Untrack first so post-stop transitions are not republished.
        self.inner.lock().unwrap().units.remove(&unit);

        self.supervisor.stop(&unit).await
    }

    /// Waits for the monitor task to exit after shutdown was signaled.
    pub async fn join(&self) {
        let handle = self.monitor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Projects a raw unit state onto the stable state space. `None` for
/// transient states that never publish.
fn project(state: UnitState) -> Option<InstanceState> {
    match state {
        UnitState::Starting => None,
        UnitState::Active => Some(InstanceState::Active),
        UnitState::Failed | UnitState::Inactive => Some(InstanceState::Failed),
    }
}

async fn monitor_loop(
    supervisor: Arc<dyn UnitSupervisor>,
    inner: Arc<Mutex<RunnerInner>>,
    statuses: StatusStream,
    default_start_interval: Duration,
    recheck: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut transitions = supervisor.subscribe();

    loop {
        let next_deadline = inner
            .lock()
            .unwrap()
            .units
            .values()
            .filter_map(|entry| entry.deadline)
            .min();

        let sleep_until = next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(60));

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("runner monitor shutting down");
                    break;
                }
            }

            transition = transitions.recv() => {
                match transition {
                    Some(transition) => {
                        handle_transition(&inner, default_start_interval, transition);
                    }
                    None => {
                        // The subscription dropped; resync from scratch. No
                        // statuses are fabricated for the gap.
                        warn!("supervisor subscription lost, resubscribing");
                        transitions = supervisor.subscribe();
                    }
                }
            }

            _ = tokio::time::sleep_until(sleep_until) => {
                fire_deadlines(&inner, &statuses);
            }

            _ = recheck.notified() => {
                // A new deadline was armed; recompute the sleep.
            }
        }
    }
}

fn handle_transition(
    inner: &Mutex<RunnerInner>,
    default_start_interval: Duration,
    transition: UnitTransition,
) {
    let Some(stable) = project(transition.state) else {
        return;
    };

    let mut inner = inner.lock().unwrap();

    let entry = match inner.units.get_mut(&transition.unit) {
        Some(entry) => entry,
        None => {
            // An untracked unit went active: the supervisor restarted a
            // crashed instance on its own. Pick it up and let it debounce
            // to Active. Failure transitions for untracked units are
            // post-stop residue and stay ignored.
            if stable != InstanceState::Active {
                return;
            }
            let Some(instance_id) = instance_id_from_unit(&transition.unit) else {
                return;
            };
            debug!(unit = %transition.unit, "tracking crash-restarted unit");
            inner.units.insert(
                transition.unit.clone(),
                UnitEntry {
                    instance_id,
                    start_interval: default_start_interval,
                    last_published: InstanceState::Failed,
                    pending: InstanceState::Active,
                    deadline: Some(Instant::now() + default_start_interval),
                    waiter: None,
                },
            );
            return;
        }
    };

    if let Some(waiter) = entry.waiter.take() {
        match waiter.send(FirstShot::State(transition.state)) {
            Ok(()) => {
                // The synchronous first shot consumed this transition; it
                // seeds the published state instead of being republished.
                entry.last_published = stable;
                entry.pending = stable;
                entry.deadline = None;
                return;
            }
            Err(_) => {
                // The starter gave up; fall through to normal debouncing.
            }
        }
    }

    entry.pending = stable;
    if stable != entry.last_published {
        entry.deadline = Some(Instant::now() + entry.start_interval);
    }
}

fn fire_deadlines(inner: &Mutex<RunnerInner>, statuses: &StatusStream) {
    let now = Instant::now();
    let mut batch = Vec::new();

    {
        let mut inner = inner.lock().unwrap();
        for entry in inner.units.values_mut() {
            let due = matches!(entry.deadline, Some(deadline) if deadline <= now);
            if !due {
                continue;
            }
            entry.deadline = None;

            if let Some(waiter) = entry.waiter.take() {
                // The start window elapsed without a stable verdict.
                let _ = waiter.send(FirstShot::TimedOut);
                entry.last_published = InstanceState::Failed;
                entry.pending = InstanceState::Failed;
                continue;
            }

            if entry.pending != entry.last_published {
                entry.last_published = entry.pending;
                batch.push(InstanceStatus {
                    instance_id: entry.instance_id,
                    state: entry.pending,
                    err: None,
                });
            }
        }
    }

    statuses.push(batch);
}
