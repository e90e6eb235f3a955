//! Host supervisor adapter.
//!
//! Encapsulates the init daemon that actually runs unit files. The core
//! depends only on [`UnitSupervisor`]; production uses [`SystemdSupervisor`]
//! (driving `systemctl`), tests use [`MockSupervisor`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Raw unit state as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Starting,
    Active,
    Failed,
    Inactive,
}

/// One observed state change of a unit.
///
/// Transitions for a single unit are delivered in emission order;
/// transitions for distinct units may interleave.
#[derive(Debug, Clone)]
pub struct UnitTransition {
    pub unit: String,
    pub state: UnitState,
}

/// Parameters for starting a unit.
#[derive(Debug, Clone, Copy)]
pub struct StartParams {
    /// Observation window for the start and for post-start debouncing.
    pub start_interval: Duration,
}

/// Errors from the supervisor adapter.
#[derive(Debug, Error, Clone)]
pub enum SupervisorError {
    #[error("supervisor timeout during {0}")]
    Timeout(String),

    #[error("supervisor failure: {0}")]
    Failure(String),
}

/// Minimal interface the core needs from the host supervisor.
#[async_trait]
pub trait UnitSupervisor: Send + Sync {
    /// Makes the unit file visible to the supervisor and reloads it.
    /// Idempotent.
    async fn install(&self, unit: &str, unit_file: &Path) -> Result<(), SupervisorError>;

    /// Asks the supervisor to bring the unit up. Returns once the command
    /// is acknowledged, not once the process is healthy.
    async fn start(&self, unit: &str, params: StartParams) -> Result<(), SupervisorError>;

    /// Asks the supervisor to bring the unit down. Succeeds for unknown
    /// units.
    async fn stop(&self, unit: &str) -> Result<(), SupervisorError>;

    /// Disables and unlinks the unit.
    async fn remove(&self, unit: &str) -> Result<(), SupervisorError>;

    /// Unit names known to the supervisor that begin with `prefix`.
    async fn list_units(&self, prefix: &str) -> Result<Vec<String>, SupervisorError>;

    /// Opens a stream of raw unit transitions.
    fn subscribe(&self) -> mpsc::Receiver<UnitTransition>;
}

// =============================================================================
// systemd implementation
// =============================================================================

/// `systemctl`-driven supervisor adapter.
///
/// State observation polls `systemctl show` for the watched units; this
/// keeps the adapter free of a bus dependency at the cost of a small,
/// bounded polling interval.
pub struct SystemdSupervisor {
    shared: Arc<SystemdShared>,
}

struct SystemdShared {
    subscribers: Mutex<Vec<mpsc::Sender<UnitTransition>>>,
    watched: Mutex<HashMap<String, UnitState>>,
}

impl SystemdSupervisor {
    /// Creates the adapter and spawns its state poller.
    pub fn new(poll_interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        let shared = Arc::new(SystemdShared {
            subscribers: Mutex::new(Vec::new()),
            watched: Mutex::new(HashMap::new()),
        });

        tokio::spawn(poll_unit_states(
            Arc::clone(&shared),
            poll_interval,
            shutdown,
        ));

        Self { shared }
    }

    async fn systemctl(args: &[&str]) -> Result<Output, SupervisorError> {
        debug!(?args, "systemctl");
        Command::new("systemctl")
            .args(args)
            .output()
            .await
            .map_err(|e| SupervisorError::Failure(format!("spawning systemctl: {e}")))
    }

    fn check(output: Output, op: &str) -> Result<(), SupervisorError> {
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(SupervisorError::Failure(format!(
            "{op}: {}",
            stderr.trim()
        )))
    }

    fn watch_unit(&self, unit: &str) {
        self.shared
            .watched
            .lock()
            .unwrap()
            .entry(unit.to_string())
            .or_insert(UnitState::Inactive);
    }

    fn unwatch_unit(&self, unit: &str) {
        self.shared.watched.lock().unwrap().remove(unit);
    }
}

#[async_trait]
impl UnitSupervisor for SystemdSupervisor {
    async fn install(&self, unit: &str, unit_file: &Path) -> Result<(), SupervisorError> {
        let path = unit_file.to_string_lossy();
        let output = Self::systemctl(&["link", "--force", &path]).await?;
        Self::check(output, &format!("link {unit}"))?;

        let output = Self::systemctl(&["daemon-reload"]).await?;
        Self::check(output, "daemon-reload")?;

        self.watch_unit(unit);
        Ok(())
    }

    async fn start(&self, unit: &str, _params: StartParams) -> Result<(), SupervisorError> {
        self.watch_unit(unit);
        let output = Self::systemctl(&["start", "--no-block", unit]).await?;
        Self::check(output, &format!("start {unit}"))
    }

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
        let output = Self::systemctl(&["stop", unit]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Stopping a unit the supervisor has never seen is a success.
            if stderr.contains("not loaded") {
                return Ok(());
            }
            return Err(SupervisorError::Failure(format!(
                "stop {unit}: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn remove(&self, unit: &str) -> Result<(), SupervisorError> {
        let output = Self::systemctl(&["disable", unit]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("does not exist") && !stderr.contains("not loaded") {
                return Err(SupervisorError::Failure(format!(
                    "disable {unit}: {}",
                    stderr.trim()
                )));
            }
        }

        let output = Self::systemctl(&["daemon-reload"]).await?;
        Self::check(output, "daemon-reload")?;

        self.unwatch_unit(unit);
        Ok(())
    }

    async fn list_units(&self, prefix: &str) -> Result<Vec<String>, SupervisorError> {
        let pattern = format!("{prefix}*");
        let output = Self::systemctl(&[
            "list-unit-files",
            "--no-legend",
            "--plain",
            "--no-pager",
            &pattern,
        ])
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SupervisorError::Failure(format!(
                "list-unit-files: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    fn subscribe(&self) -> mpsc::Receiver<UnitTransition> {
        let (tx, rx) = mpsc::channel(256);
        self.shared.subscribers.lock().unwrap().push(tx);
        rx
    }
}

async fn poll_unit_states(
    shared: Arc<SystemdShared>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        let units: Vec<String> = shared.watched.lock().unwrap().keys().cloned().collect();

        for unit in units {
            let Ok(output) = Command::new("systemctl")
                .args(["show", unit.as_str(), "--property=ActiveState", "--value"])
                .output()
                .await
            else {
                continue;
            };

            let raw = String::from_utf8_lossy(&output.stdout);
            let state = match raw.trim() {
                "activating" | "reloading" => UnitState::Starting,
                "active" => UnitState::Active,
                "failed" => UnitState::Failed,
                "inactive" | "deactivating" => UnitState::Inactive,
                _ => continue,
            };

            let changed = {
                let mut watched = shared.watched.lock().unwrap();
                match watched.get_mut(&unit) {
                    Some(previous) if *previous != state => {
                        *previous = state;
                        true
                    }
                    Some(_) => false,
                    None => false,
                }
            };

            if changed {
                broadcast(&shared.subscribers, &unit, state);
            }
        }
    }
}

fn broadcast(
    subscribers: &Mutex<Vec<mpsc::Sender<UnitTransition>>>,
    unit: &str,
    state: UnitState,
) {
    let mut subs = subscribers.lock().unwrap();
    subs.retain(|tx| {
        match tx.try_send(UnitTransition {
            unit: unit.to_string(),
            state,
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(unit, "transition subscriber is full, dropping transition");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

// =============================================================================
// Mock implementation
// =============================================================================

/// How a mock unit behaves when started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBehavior {
    /// Emits `starting` then `active`.
    Healthy,
    /// The start command is acknowledged but the unit fails shortly after
    /// (e.g. the service binary is missing).
    FailAfterStart,
    /// The start command itself is rejected.
    RejectStart,
    /// The start command is acknowledged and no transition ever arrives.
    Silent,
}

/// Scripted supervisor for tests and development.
///
/// Tracks install/start/stop/remove calls, emits transitions according to
/// per-unit behaviors, and lets tests inject arbitrary transitions to
/// simulate crash-restarts and flaps.
pub struct MockSupervisor {
    inner: Arc<Mutex<MockInner>>,
}

struct MockInner {
    subscribers: Vec<mpsc::Sender<UnitTransition>>,
    behaviors: HashMap<String, StartBehavior>,
    default_behavior: StartBehavior,
    /// Units the supervisor currently knows about (installed or injected).
    units: HashMap<String, PathBuf>,
    started: Vec<String>,
    stopped: Vec<String>,
    removed: Vec<String>,
    /// Delay before emitted post-ack transitions, to mimic a real init.
    transition_delay: Duration,
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                subscribers: Vec::new(),
                behaviors: HashMap::new(),
                default_behavior: StartBehavior::Healthy,
                units: HashMap::new(),
                started: Vec::new(),
                stopped: Vec::new(),
                removed: Vec::new(),
                transition_delay: Duration::from_millis(10),
            })),
        }
    }

    /// Sets the behavior used for units without an explicit override.
    pub fn set_default_behavior(&self, behavior: StartBehavior) {
        self.inner.lock().unwrap().default_behavior = behavior;
    }

    /// Overrides the behavior of one unit.
    pub fn set_behavior(&self, unit: &str, behavior: StartBehavior) {
        self.inner
            .lock()
            .unwrap()
            .behaviors
            .insert(unit.to_string(), behavior);
    }

    /// Registers a unit without going through `install`, like an orphan
    /// left behind by a previous run.
    pub fn inject_unit(&self, unit: &str) {
        self.inner
            .lock()
            .unwrap()
            .units
            .insert(unit.to_string(), PathBuf::new());
    }

    /// Emits a raw transition, as the host supervisor would.
    pub fn emit(&self, unit: &str, state: UnitState) {
        let mut inner = self.inner.lock().unwrap();
        let unit = unit.to_string();
        inner.subscribers.retain(|tx| {
            !matches!(
                tx.try_send(UnitTransition {
                    unit: unit.clone(),
                    state
                }),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }

    pub fn started_units(&self) -> Vec<String> {
        self.inner.lock().unwrap().started.clone()
    }

    pub fn stopped_units(&self) -> Vec<String> {
        self.inner.lock().unwrap().stopped.clone()
    }

    pub fn removed_units(&self) -> Vec<String> {
        self.inner.lock().unwrap().removed.clone()
    }

    pub fn installed_units(&self) -> Vec<String> {
        self.inner.lock().unwrap().units.keys().cloned().collect()
    }

    fn behavior_for(&self, unit: &str) -> StartBehavior {
        let inner = self.inner.lock().unwrap();
        inner
            .behaviors
            .get(unit)
            .copied()
            .unwrap_or(inner.default_behavior)
    }

    fn emit_later(&self, unit: String, states: Vec<UnitState>) {
        let inner = Arc::clone(&self.inner);
        let delay = self.inner.lock().unwrap().transition_delay;

        tokio::spawn(async move {
            for state in states {
                tokio::time::sleep(delay).await;
                let mut guard = inner.lock().unwrap();
                let unit = unit.clone();
                guard.subscribers.retain(|tx| {
                    !matches!(
                        tx.try_send(UnitTransition {
                            unit: unit.clone(),
                            state
                        }),
                        Err(mpsc::error::TrySendError::Closed(_))
                    )
                });
            }
        });
    }
}

impl Default for MockSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnitSupervisor for MockSupervisor {
    async fn install(&self, unit: &str, unit_file: &Path) -> Result<(), SupervisorError> {
        self.inner
            .lock()
            .unwrap()
            .units
            .insert(unit.to_string(), unit_file.to_path_buf());
        Ok(())
    }

    async fn start(&self, unit: &str, _params: StartParams) -> Result<(), SupervisorError> {
        let behavior = self.behavior_for(unit);
        self.inner.lock().unwrap().started.push(unit.to_string());

        match behavior {
            StartBehavior::Healthy => {
                self.emit(unit, UnitState::Starting);
                self.emit_later(unit.to_string(), vec![UnitState::Active]);
                Ok(())
            }
            StartBehavior::FailAfterStart => {
                self.emit(unit, UnitState::Starting);
                self.emit_later(unit.to_string(), vec![UnitState::Failed]);
                Ok(())
            }
            StartBehavior::RejectStart => Err(SupervisorError::Failure(format!(
                "start {unit}: unit not found"
            ))),
            StartBehavior::Silent => Ok(()),
        }
    }

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
        self.inner.lock().unwrap().stopped.push(unit.to_string());
        Ok(())
    }

    async fn remove(&self, unit: &str) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.units.remove(unit);
        inner.removed.push(unit.to_string());
        Ok(())
    }

    async fn list_units(&self, prefix: &str) -> Result<Vec<String>, SupervisorError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .units
            .keys()
            .filter(|unit| unit.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> mpsc::Receiver<UnitTransition> {
        let (tx, rx) = mpsc::channel(256);
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }
}
