//! The service manager engine: executes per-instance actions and exposes
//! the inbound API consumed by the cloud collaborator.
//!
//! All collaborators arrive as constructor arguments; the engine owns their
//! lifecycle from [`ServiceManager::new`] to [`ServiceManager::shutdown`].
//! Every mutation of an instance travels through the action queue, keyed by
//! instance ID, so per-instance transitions are atomic and serialized while
//! unrelated instances progress in parallel.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axle_id::{InstanceId, InstanceIdent, ServiceId};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::devices::{DeviceBroker, DeviceError};
use crate::model::{
    instance_id_from_unit, unit_name, DesiredInstance, InstanceRecord, InstanceState,
    InstanceStatus, Model, Principal, ServiceDescriptor, ServiceRecord, ServiceStatus,
    ServiceStatusKind, StateAck, UNIT_PREFIX,
};
use crate::queue::{ActionExecutor, ActionKey, ActionQueue, QueueFatal};
use crate::reconciler::{self, VersionRegression};
use crate::runner::{Runner, StartResult, StatusStream};
use crate::state::{Storage, StoreError};
use crate::supervisor::{StartParams, SupervisorError, UnitSupervisor};

/// Default unit template, materialized into the working directory on first
/// boot so operators can adjust it.
const UNIT_TEMPLATE: &str = r#"# Template for axle service units.
# Variables:
#   ${INSTANCE}     - supervisor unit base name
#   ${SERVICEPATH}  - path to the unpacked service image
#   ${INSTANCEPATH} - path to the per-instance directory
#   ${UID}, ${GID}  - credentials the service runs under
[Unit]
Description=Axle Service
After=network.target

[Service]
Type=simple
Restart=always
RestartSec=1
ExecStart=${SERVICEPATH}/bin/run
WorkingDirectory=${SERVICEPATH}
EnvironmentFile=-${INSTANCEPATH}/env
User=${UID}
Group=${GID}

[Install]
WantedBy=multi-user.target
"#;

/// Errors attached to per-instance outcomes and status events.
#[derive(Debug, Error, Clone)]
pub enum ActionError {
    #[error("not exist: {0}")]
    NotExist(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("version regression for {ident}: desired {desired} < installed {current}")]
    VersionRegression {
        ident: InstanceIdent,
        desired: u64,
        current: u64,
    },

    #[error("principal is not set")]
    UnsetPrincipal,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<StoreError> for ActionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotExist(what) => ActionError::NotExist(what),
            StoreError::AlreadyExists(what) => ActionError::AlreadyExists(what),
            StoreError::Backend(msg) => ActionError::Storage(msg),
        }
    }
}

/// Per-instance result of a reconcile or removal.
#[derive(Debug, Clone)]
pub struct InstanceOutcome {
    pub ident: InstanceIdent,
    pub instance_id: Option<InstanceId>,
    pub result: Result<(), ActionError>,
}

/// Snapshot entry reported to the cloud.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub service_id: ServiceId,
    pub version: u64,
    pub is_active: bool,
}

type OutcomeTx = mpsc::Sender<InstanceOutcome>;

/// Tagged per-instance action, dispatched by the queue.
pub(crate) enum Action {
    /// Prepare an instance on disk and register its unit. Emits an outcome
    /// only on failure; the paired `Start` reports success.
    Install {
        instance_id: InstanceId,
        desired: DesiredInstance,
        outcomes: OutcomeTx,
    },

    /// Admit devices and bring the unit up.
    Start {
        instance_id: InstanceId,
        desired: DesiredInstance,
        /// True when a fresh `Install` precedes this start on the same key.
        after_install: bool,
        outcomes: OutcomeTx,
    },

    /// Stop the old version, install the new one, start it.
    Update {
        record: InstanceRecord,
        desired: DesiredInstance,
        outcomes: OutcomeTx,
    },

    /// Stop without removing the record (principal cleared).
    Stop {
        record: InstanceRecord,
        outcomes: OutcomeTx,
    },

    /// Stop, unregister the unit, and delete the record.
    StopRemove {
        record: InstanceRecord,
        outcomes: OutcomeTx,
    },

    /// Register a service version delivered by the cloud.
    InstallService { descriptor: ServiceDescriptor },

    /// Persist a state snapshot acceptance.
    StateAcceptance {
        instance_id: InstanceId,
        accepted: bool,
        reason: Option<String>,
    },

    /// Garbage-collect retired service versions past the grace period.
    CleanupServices,
}

struct Core {
    config: Config,
    model: Model,
    storage: Arc<dyn Storage>,
    broker: Arc<DeviceBroker>,
    runner: Arc<Runner>,
    supervisor: Arc<dyn UnitSupervisor>,
    principal: Mutex<Option<Principal>>,
    unit_template: String,
    instance_events: StatusStream,
    service_events: mpsc::UnboundedSender<ServiceStatus>,
}

/// The service manager.
pub struct ServiceManager {
    core: Arc<Core>,
    queue: ActionQueue<Core>,
    shutdown_tx: watch::Sender<bool>,
    reconcile_lock: tokio::sync::Mutex<()>,
    service_events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServiceStatus>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceManager {
    /// Boots the engine.
    ///
    /// Fatal here, per the propagation policy: invalid device declarations,
    /// unreachable storage, unreachable supervisor.
    pub async fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        supervisor: Arc<dyn UnitSupervisor>,
        broker: Arc<DeviceBroker>,
    ) -> Result<Self, ActionError> {
        broker
            .validate()
            .map_err(|e| ActionError::Fatal(format!("device validation: {e}")))?;

        // Probe the supervisor before accepting work.
        supervisor
            .list_units(UNIT_PREFIX)
            .await
            .map_err(|e| ActionError::Fatal(format!("supervisor unreachable: {e}")))?;

        std::fs::create_dir_all(config.instances_dir())
            .map_err(|e| ActionError::Fatal(format!("creating instances dir: {e}")))?;

        let unit_template = load_unit_template(&config)
            .map_err(|e| ActionError::Fatal(format!("unit template: {e}")))?;

        let model = Model::load(Arc::clone(&storage))
            .map_err(|e| ActionError::Fatal(format!("loading state: {e}")))?;

        broker.restore_grants(
            storage
                .load_grants()
                .map_err(|e| ActionError::Fatal(format!("loading grants: {e}")))?,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = Runner::new(
            Arc::clone(&supervisor),
            config.status_channel_capacity,
            config.start_interval,
            shutdown_rx.clone(),
        );

        let (service_tx, service_rx) = mpsc::unbounded_channel();

        let core = Arc::new(Core {
            instance_events: StatusStream::new(config.status_channel_capacity),
            config,
            model,
            storage,
            broker,
            runner,
            supervisor,
            principal: Mutex::new(None),
            unit_template,
            service_events: service_tx,
        });

        let queue = ActionQueue::new(
            Arc::clone(&core),
            core.config.worker_count,
            shutdown_rx.clone(),
        );

        let forwarder = tokio::spawn(forward_statuses(Arc::clone(&core), shutdown_rx));

        Ok(Self {
            core,
            queue,
            shutdown_tx,
            reconcile_lock: tokio::sync::Mutex::new(()),
            service_events_rx: Mutex::new(Some(service_rx)),
            forwarder: Mutex::new(Some(forwarder)),
        })
    }

    /// Stable instance state changes, batched.
    pub fn instance_status_stream(&self) -> StatusStream {
        self.core.instance_events.clone()
    }

    /// Service install/remove outcomes. Can be taken once.
    pub fn service_status_events(&self) -> Option<mpsc::UnboundedReceiver<ServiceStatus>> {
        self.service_events_rx.lock().unwrap().take()
    }

    /// Fatal queue events (panicking actions). Can be taken once.
    pub fn fatal_events(&self) -> Option<mpsc::UnboundedReceiver<QueueFatal>> {
        self.queue.fatal_events()
    }

    /// Replaces the node principal.
    ///
    /// Clearing it stops every running instance and leaves the node gated:
    /// the next reconcile refuses installs until a principal is set again.
    /// Switching to a (new) principal stops whatever the old one ran,
    /// revalidates the device declarations, and restarts the stored
    /// instances belonging to the new principal's subjects.
    pub async fn set_principal(&self, principal: Option<Principal>) -> Vec<InstanceOutcome> {
        let _guard = self.reconcile_lock.lock().await;

        {
            let mut current = self.core.principal.lock().unwrap();
            if *current == principal {
                return Vec::new();
            }
            info!(?principal, "principal changed");
            *current = principal.clone();
        }

        // Instances of the old principal must not keep running under the
        // new identity.
        let mut outcomes = self.stop_all_running().await;

        let Some(principal) = principal else {
            return outcomes;
        };

        // Devices must still match the host before stored instances come
        // back up.
        if let Err(e) = self.core.broker.validate() {
            warn!(error = %e, "device revalidation failed, stored instances stay stopped");
            return outcomes;
        }

        outcomes.extend(self.restart_stored_instances(&principal).await);
        outcomes
    }

    /// Applies a complete desired instance set. Returns one outcome per
    /// affected instance; sibling failures never abort the pass.
    pub async fn reconcile(&self, desired: Vec<DesiredInstance>) -> Vec<InstanceOutcome> {
        let _guard = self.reconcile_lock.lock().await;

        info!(desired = desired.len(), "reconciling desired instance set");

        let principal = self.core.principal.lock().unwrap().clone();
        let Some(principal) = principal else {
            // Never run user code under an unauthenticated node.
            let mut outcomes: Vec<InstanceOutcome> = desired
                .iter()
                .map(|entry| InstanceOutcome {
                    ident: entry.ident.clone(),
                    instance_id: None,
                    result: Err(ActionError::UnsetPrincipal),
                })
                .collect();
            outcomes.extend(self.stop_all_running().await);
            return outcomes;
        };

        // Higher-priority instances are submitted first, so under a
        // saturated worker pool they also start first.
        let mut desired = desired;
        desired.sort_by(|a, b| b.priority.cmp(&a.priority));

        let current = self.core.model.instances();
        let plan = reconciler::plan(&desired, &current);

        debug!(
            installs = plan.installs.len(),
            updates = plan.updates.len(),
            ensure = plan.ensure_running.len(),
            stops = plan.stops.len(),
            rejected = plan.rejected.len(),
            "computed plan"
        );

        let mut outcomes = Vec::new();
        let mut expected = 0usize;
        let (tx, mut rx) = mpsc::channel(plan.action_count().max(1));

        for regression in &plan.rejected {
            outcomes.push(regression_outcome(regression));
        }

        // Mint records for fresh installs up front; the instance ID is the
        // durable name everything else hangs off.
        let mut install_ids = Vec::new();
        for entry in &plan.installs {
            match self.mint_instance(entry, &principal) {
                Ok(record) => install_ids.push((record.instance_id, entry.clone())),
                Err(e) => outcomes.push(InstanceOutcome {
                    ident: entry.ident.clone(),
                    instance_id: None,
                    result: Err(e),
                }),
            }
        }

        // Wave 1: install-type actions.
        for (instance_id, entry) in &install_ids {
            expected += 1;
            self.queue.submit(
                ActionKey::Instance(*instance_id),
                Action::Install {
                    instance_id: *instance_id,
                    desired: entry.clone(),
                    outcomes: tx.clone(),
                },
            );
        }
        for (record, entry) in &plan.updates {
            expected += 1;
            self.queue.submit(
                ActionKey::Instance(record.instance_id),
                Action::Update {
                    record: record.clone(),
                    desired: entry.clone(),
                    outcomes: tx.clone(),
                },
            );
        }

        // Wave 2: stops and removals.
        for record in &plan.stops {
            expected += 1;
            self.queue.submit(
                ActionKey::Instance(record.instance_id),
                Action::StopRemove {
                    record: record.clone(),
                    outcomes: tx.clone(),
                },
            );
        }

        // Wave 3: starts. Per-key FIFO guarantees each start runs after its
        // own install.
        for (instance_id, entry) in &install_ids {
            self.queue.submit(
                ActionKey::Instance(*instance_id),
                Action::Start {
                    instance_id: *instance_id,
                    desired: entry.clone(),
                    after_install: true,
                    outcomes: tx.clone(),
                },
            );
        }
        for (record, entry) in &plan.ensure_running {
            if record.running {
                // Already converged; an idempotent reconcile emits nothing.
                outcomes.push(InstanceOutcome {
                    ident: record.ident(),
                    instance_id: Some(record.instance_id),
                    result: Ok(()),
                });
                continue;
            }
            expected += 1;
            self.queue.submit(
                ActionKey::Instance(record.instance_id),
                Action::Start {
                    instance_id: record.instance_id,
                    desired: entry.clone(),
                    after_install: false,
                    outcomes: tx.clone(),
                },
            );
        }

        drop(tx);

        let mut received = 0usize;
        while received < expected {
            match rx.recv().await {
                Some(outcome) => {
                    received += 1;
                    outcomes.push(outcome);
                }
                None => {
                    warn!(received, expected, "reconcile drained early (shutdown)");
                    break;
                }
            }
        }

        self.core.cleanup_orphans().await;
        self.queue
            .submit(ActionKey::Maintenance, Action::CleanupServices);

        outcomes
    }

    /// Registers a service version. Idempotent; outcome arrives on the
    /// service status events.
    pub fn install_service(&self, descriptor: ServiceDescriptor) {
        self.queue
            .submit(ActionKey::Maintenance, Action::InstallService { descriptor });
    }

    /// Removes one instance, equivalent to reconciling with it absent.
    pub async fn remove_instance(&self, ident: &InstanceIdent) -> InstanceOutcome {
        let record = match self.core.model.lookup_instance_by_ident(ident) {
            Ok(record) => record,
            Err(e) => {
                return InstanceOutcome {
                    ident: ident.clone(),
                    instance_id: None,
                    result: Err(e.into()),
                }
            }
        };

        let (tx, mut rx) = mpsc::channel(1);
        self.queue.submit(
            ActionKey::Instance(record.instance_id),
            Action::StopRemove {
                record: record.clone(),
                outcomes: tx,
            },
        );

        rx.recv().await.unwrap_or(InstanceOutcome {
            ident: ident.clone(),
            instance_id: Some(record.instance_id),
            result: Err(ActionError::Fatal("queue shut down".to_string())),
        })
    }

    /// Stores environment overrides, merged into the unit environment at
    /// the next start of each instance.
    pub fn override_env_vars(
        &self,
        idents: &[InstanceIdent],
        vars: &HashMap<String, String>,
    ) -> Vec<(InstanceIdent, Result<(), ActionError>)> {
        idents
            .iter()
            .map(|ident| {
                let result = match self.core.model.lookup_instance_by_ident(ident) {
                    Ok(_) => self
                        .core
                        .storage
                        .save_env_override(ident, vars)
                        .map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
                (ident.clone(), result)
            })
            .collect()
    }

    /// Records acceptance of an instance state snapshot.
    pub fn state_acceptance(&self, instance_id: InstanceId, accepted: bool, reason: Option<String>) {
        self.queue.submit(
            ActionKey::Instance(instance_id),
            Action::StateAcceptance {
                instance_id,
                accepted,
                reason,
            },
        );
    }

    /// Snapshot of installed services for cloud status reporting.
    pub fn services_info(&self) -> Vec<ServiceInfo> {
        let mut info: Vec<ServiceInfo> = self
            .core
            .model
            .services()
            .into_iter()
            .map(|s| ServiceInfo {
                service_id: s.service_id,
                version: s.version,
                is_active: s.is_active,
            })
            .collect();
        info.sort_by(|a, b| (a.service_id.as_str(), a.version).cmp(&(b.service_id.as_str(), b.version)));
        info
    }

    /// Read-only instance lookup for collaborators.
    pub fn instance(&self, ident: &InstanceIdent) -> Option<InstanceRecord> {
        self.core.model.lookup_instance_by_ident(ident).ok()
    }

    /// Signals shutdown, lets in-flight actions finish, drops queued ones,
    /// and joins the background tasks.
    pub async fn shutdown(&self) {
        info!("service manager shutting down");
        let _ = self.shutdown_tx.send(true);

        self.queue.drained().await;
        self.core.runner.join().await;

        let forwarder = self.forwarder.lock().unwrap().take();
        if let Some(handle) = forwarder {
            let _ = handle.await;
        }
    }

    fn mint_instance(
        &self,
        entry: &DesiredInstance,
        principal: &Principal,
    ) -> Result<InstanceRecord, ActionError> {
        let uid = self.core.storage.allocate_uid()?;
        let record = InstanceRecord {
            instance_id: InstanceId::new(),
            service_id: entry.ident.service_id.clone(),
            subject_id: entry.ident.subject_id.clone(),
            instance_index: entry.ident.instance_index,
            version: entry.version,
            unit_subject: principal.contains(&entry.ident.subject_id),
            running: false,
            uid,
            last_error: None,
        };
        self.core.model.upsert_instance(record.clone())?;
        Ok(record)
    }

    /// Restarts the stored instances whose subject belongs to the new
    /// principal, refreshing every record's subject flag along the way.
    async fn restart_stored_instances(&self, principal: &Principal) -> Vec<InstanceOutcome> {
        let mut to_start = Vec::new();

        for mut record in self.core.model.instances() {
            let unit_subject = principal.contains(&record.subject_id);
            if record.unit_subject != unit_subject {
                record.unit_subject = unit_subject;
                if let Err(e) = self.core.model.upsert_instance(record.clone()) {
                    warn!(instance_id = %record.instance_id, error = %e,
                        "failed to refresh subject flag");
                    continue;
                }
            }
            if unit_subject {
                to_start.push(record);
            }
        }

        if to_start.is_empty() {
            return Vec::new();
        }

        info!(
            count = to_start.len(),
            "restarting stored instances for new principal"
        );

        let (tx, mut rx) = mpsc::channel(to_start.len());
        let expected = to_start.len();

        for record in to_start {
            self.queue.submit(
                ActionKey::Instance(record.instance_id),
                Action::Start {
                    instance_id: record.instance_id,
                    desired: record.as_desired(),
                    after_install: false,
                    outcomes: tx.clone(),
                },
            );
        }
        drop(tx);

        let mut outcomes = Vec::new();
        for _ in 0..expected {
            match rx.recv().await {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        outcomes
    }

    /// Stops every running instance without removing records.
    async fn stop_all_running(&self) -> Vec<InstanceOutcome> {
        let running: Vec<InstanceRecord> = self
            .core
            .model
            .instances()
            .into_iter()
            .filter(|record| record.running)
            .collect();

        if running.is_empty() {
            return Vec::new();
        }

        info!(count = running.len(), "stopping all running instances");

        let (tx, mut rx) = mpsc::channel(running.len());
        let expected = running.len();

        for record in running {
            self.queue.submit(
                ActionKey::Instance(record.instance_id),
                Action::Stop {
                    record,
                    outcomes: tx.clone(),
                },
            );
        }
        drop(tx);

        let mut outcomes = Vec::new();
        for _ in 0..expected {
            match rx.recv().await {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        outcomes
    }
}

fn regression_outcome(regression: &VersionRegression) -> InstanceOutcome {
    warn!(
        ident = %regression.ident,
        desired = regression.desired,
        current = regression.current,
        "rejecting version regression"
    );
    InstanceOutcome {
        ident: regression.ident.clone(),
        instance_id: None,
        result: Err(ActionError::VersionRegression {
            ident: regression.ident.clone(),
            desired: regression.desired,
            current: regression.current,
        }),
    }
}

fn load_unit_template(config: &Config) -> std::io::Result<String> {
    let path = config.unit_template_file();
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(&config.working_dir)?;
            std::fs::write(&path, UNIT_TEMPLATE)?;
            Ok(UNIT_TEMPLATE.to_string())
        }
        Err(e) => Err(e),
    }
}

/// Forwards debounced runner statuses to the outbound stream, updating the
/// model along the way.
async fn forward_statuses(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    let runner_statuses = core.runner.status_stream();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }

            batch = runner_statuses.recv() => {
                let mut enriched = Vec::with_capacity(batch.len());
                for status in batch {
                    let running = status.state == InstanceState::Active;
                    match core.model.set_running(&status.instance_id, running) {
                        Ok(()) => {}
                        Err(e) if e.is_not_exist() => {
                            // The instance was removed while the status was
                            // in flight; nothing to report.
                            continue;
                        }
                        Err(e) => {
                            warn!(instance_id = %status.instance_id, error = %e,
                                "failed to persist running flag");
                        }
                    }
                    enriched.push(status);
                }
                core.instance_events.push(enriched);
            }
        }
    }
}

#[async_trait]
impl ActionExecutor for Core {
    type Action = Action;

    async fn execute(&self, action: Action, _shutdown: watch::Receiver<bool>) {
        match action {
            Action::Install {
                instance_id,
                desired,
                outcomes,
            } => {
                if let Err(e) = self.install_instance(instance_id, &desired).await {
                    error!(instance_id = %instance_id, error = %e, "install failed");
                    self.record_error(&instance_id, &e);
                    let _ = outcomes
                        .send(InstanceOutcome {
                            ident: desired.ident.clone(),
                            instance_id: Some(instance_id),
                            result: Err(e),
                        })
                        .await;
                }
            }

            Action::Start {
                instance_id,
                desired,
                after_install,
                outcomes,
            } => {
                // A failed install already reported this instance; the start
                // half of the pair is skipped.
                if after_install {
                    if let Ok(record) = self.model.lookup_instance(&instance_id) {
                        if record.last_error.is_some() {
                            return;
                        }
                    } else {
                        return;
                    }
                }

                let result = self.start_instance(instance_id, &desired).await;
                let _ = outcomes
                    .send(InstanceOutcome {
                        ident: desired.ident.clone(),
                        instance_id: Some(instance_id),
                        result,
                    })
                    .await;
            }

            Action::Update {
                record,
                desired,
                outcomes,
            } => {
                let instance_id = record.instance_id;
                let result = self.update_instance(record, &desired).await;
                if let Err(e) = &result {
                    self.record_error(&instance_id, e);
                }
                let _ = outcomes
                    .send(InstanceOutcome {
                        ident: desired.ident.clone(),
                        instance_id: Some(instance_id),
                        result,
                    })
                    .await;
            }

            Action::Stop { record, outcomes } => {
                let ident = record.ident();
                let instance_id = record.instance_id;
                let result = self.stop_instance(&record).await;
                let _ = outcomes
                    .send(InstanceOutcome {
                        ident,
                        instance_id: Some(instance_id),
                        result,
                    })
                    .await;
            }

            Action::StopRemove { record, outcomes } => {
                let ident = record.ident();
                let instance_id = record.instance_id;
                let result = self.stop_remove_instance(record).await;
                let _ = outcomes
                    .send(InstanceOutcome {
                        ident,
                        instance_id: Some(instance_id),
                        result,
                    })
                    .await;
            }

            Action::InstallService { descriptor } => {
                self.install_service(descriptor);
            }

            Action::StateAcceptance {
                instance_id,
                accepted,
                reason,
            } => {
                debug!(instance_id = %instance_id, accepted, "state acceptance");
                if let Err(e) = self.storage.save_state_ack(&StateAck {
                    instance_id,
                    accepted,
                    reason,
                }) {
                    warn!(instance_id = %instance_id, error = %e, "failed to persist state ack");
                }
            }

            Action::CleanupServices => {
                if let Err(e) = self.cleanup_services() {
                    warn!(error = %e, "service cleanup failed");
                }
            }
        }
    }
}

impl Core {
    /// Wraps a supervisor call with the configured per-call timeout.
    async fn sup<T>(
        &self,
        op: &str,
        fut: impl std::future::Future<Output = Result<T, SupervisorError>>,
    ) -> Result<T, SupervisorError> {
        match tokio::time::timeout(self.config.supervisor_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::Timeout(op.to_string())),
        }
    }

    fn instance_dir(&self, instance_id: &InstanceId) -> PathBuf {
        self.config.instances_dir().join(instance_id.to_string())
    }

    fn record_error(&self, instance_id: &InstanceId, error: &ActionError) {
        if let Err(e) = self
            .model
            .set_last_error(instance_id, Some(error.to_string()))
        {
            warn!(instance_id = %instance_id, error = %e, "failed to record error");
        }
    }

    fn emit_instance_status(&self, instance_id: InstanceId, state: InstanceState, err: Option<String>) {
        self.instance_events.push(vec![InstanceStatus {
            instance_id,
            state,
            err,
        }]);
    }

    fn emit_service_status(&self, status: ServiceStatus) {
        let _ = self.service_events.send(status);
    }

    /// Prepares the per-instance directory and registers the unit.
    async fn install_instance(
        &self,
        instance_id: InstanceId,
        desired: &DesiredInstance,
    ) -> Result<(), ActionError> {
        let record = self.model.lookup_instance(&instance_id)?;
        let service = self
            .model
            .lookup_service_version(&desired.ident.service_id, desired.version)?;

        let dir = self.instance_dir(&instance_id);
        std::fs::create_dir_all(&dir).map_err(|e| ActionError::Storage(e.to_string()))?;

        self.write_env_file(&dir, &desired.ident)?;

        let unit = unit_name(&instance_id);
        let unit_file = dir.join(&unit);
        let rendered = render_unit(&self.unit_template, &unit, &service, &dir, record.uid);
        std::fs::write(&unit_file, rendered).map_err(|e| ActionError::Storage(e.to_string()))?;

        self.sup("install", self.supervisor.install(&unit, &unit_file))
            .await?;

        self.model.set_last_error(&instance_id, None)?;

        info!(instance_id = %instance_id, service = %desired.ident.service_id,
            version = desired.version, "instance installed");
        Ok(())
    }

    fn write_env_file(&self, dir: &std::path::Path, ident: &InstanceIdent) -> Result<(), ActionError> {
        let overrides = self.storage.env_override(ident)?;
        let mut content = String::new();
        let mut keys: Vec<_> = overrides.keys().collect();
        keys.sort();
        for key in keys {
            content.push_str(&format!("{key}={}\n", overrides[key]));
        }
        std::fs::write(dir.join("env"), content).map_err(|e| ActionError::Storage(e.to_string()))
    }

    /// Requests devices and brings the unit up, rolling back grants on
    /// failure.
    async fn start_instance(
        &self,
        instance_id: InstanceId,
        desired: &DesiredInstance,
    ) -> Result<(), ActionError> {
        let record = self.model.lookup_instance(&instance_id)?;
        if record.running {
            return Ok(());
        }

        let service = self
            .model
            .lookup_service_version(&desired.ident.service_id, record.version)?;

        // Refresh the env file so overrides stored since install take
        // effect on this start.
        let dir = self.instance_dir(&instance_id);
        if dir.exists() {
            self.write_env_file(&dir, &desired.ident)?;
        }

        let mut requested: Vec<String> = service.devices.clone();
        for extra in &desired.resources {
            if !requested.contains(extra) {
                requested.push(extra.clone());
            }
        }

        let mut acquired = Vec::new();
        for device in &requested {
            match self.broker.request(device, instance_id) {
                Ok(()) => acquired.push(device.clone()),
                Err(e) => {
                    // Roll back every grant of this attempt.
                    for granted in &acquired {
                        let _ = self.broker.release(granted, instance_id);
                    }
                    self.persist_grants(&requested);
                    let err: ActionError = e.into();
                    self.record_error(&instance_id, &err);
                    self.emit_instance_status(
                        instance_id,
                        InstanceState::Failed,
                        Some(err.to_string()),
                    );
                    return Err(err);
                }
            }
        }
        self.persist_grants(&requested);

        let params = StartParams {
            start_interval: self.config.start_interval,
        };

        let start = tokio::time::timeout(
            self.config.supervisor_timeout + params.start_interval,
            self.runner
                .start_instance(instance_id, &service.image_path, params),
        )
        .await
        .unwrap_or_else(|_| StartResult {
            state: InstanceState::Failed,
            err: Some(SupervisorError::Timeout("start".to_string()).to_string()),
        });

        match start.state {
            InstanceState::Active => {
                self.model.set_running(&instance_id, true)?;
                self.model.set_last_error(&instance_id, None)?;
                self.model.activate_service_version(
                    &service.service_id,
                    service.version,
                    Utc::now(),
                )?;
                self.emit_instance_status(instance_id, InstanceState::Active, None);
                info!(instance_id = %instance_id, "instance active");
                Ok(())
            }
            _ => {
                let message = start
                    .err
                    .unwrap_or_else(|| "instance failed to start".to_string());

                // Roll back to stopped: no unit left running, no grants held.
                let _ = self
                    .sup("stop", self.runner.stop_instance(instance_id))
                    .await;
                self.broker.release_all(instance_id);
                self.persist_grants(&requested);
                let _ = self.model.set_running(&instance_id, false);

                let err = ActionError::Supervisor(SupervisorError::Failure(message.clone()));
                self.record_error(&instance_id, &err);
                self.emit_instance_status(instance_id, InstanceState::Failed, Some(message));
                Err(err)
            }
        }
    }

    /// Stops the unit and releases everything the instance holds. The
    /// record stays.
    async fn stop_instance(&self, record: &InstanceRecord) -> Result<(), ActionError> {
        let instance_id = record.instance_id;

        let result = self
            .sup("stop", self.runner.stop_instance(instance_id))
            .await;

        let released = self.broker.release_all(instance_id);
        self.persist_grants(&released);

        self.model.set_running(&instance_id, false)?;

        result?;
        info!(instance_id = %instance_id, "instance stopped");
        Ok(())
    }

    /// Stops the instance, unregisters its unit, and deletes its state.
    async fn stop_remove_instance(&self, record: InstanceRecord) -> Result<(), ActionError> {
        let instance_id = record.instance_id;
        let unit = record.unit_name();

        let stop_result = self
            .sup("stop", self.runner.stop_instance(instance_id))
            .await;

        let released = self.broker.release_all(instance_id);
        self.persist_grants(&released);

        let remove_result = self.sup("remove", self.supervisor.remove(&unit)).await;

        let dir = self.instance_dir(&instance_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(instance_id = %instance_id, error = %e, "failed to remove instance dir");
            }
        }

        let ident = record.ident();
        self.model.remove_instance(&instance_id)?;
        let _ = self.storage.remove_env_override(&ident);
        self.model
            .retire_if_unused(&record.service_id, record.version, Utc::now())?;

        stop_result?;
        remove_result?;

        info!(instance_id = %instance_id, "instance removed");
        Ok(())
    }

    /// Stop old, install new, start new. On failure the instance lands in
    /// Failed and the next reconcile retries.
    async fn update_instance(
        &self,
        record: InstanceRecord,
        desired: &DesiredInstance,
    ) -> Result<(), ActionError> {
        let instance_id = record.instance_id;
        let old_version = record.version;

        info!(
            instance_id = %instance_id,
            from = old_version,
            to = desired.version,
            "updating instance"
        );

        self.sup("stop", self.runner.stop_instance(instance_id))
            .await?;
        let released = self.broker.release_all(instance_id);
        self.persist_grants(&released);
        self.model.set_running(&instance_id, false)?;

        let mut updated = record;
        updated.version = desired.version;
        updated.running = false;
        self.model.upsert_instance(updated)?;

        if let Err(e) = self.install_instance(instance_id, desired).await {
            self.record_error(&instance_id, &e);
            self.emit_instance_status(instance_id, InstanceState::Failed, Some(e.to_string()));
            return Err(e);
        }

        let result = self.start_instance(instance_id, desired).await;

        if result.is_ok() {
            self.model
                .retire_if_unused(&desired.ident.service_id, old_version, Utc::now())?;
        }

        result
    }

    /// Registers a service version. Same digest twice is a no-op.
    fn install_service(&self, descriptor: ServiceDescriptor) {
        let status_base = ServiceStatus {
            service_id: descriptor.service_id.clone(),
            version: descriptor.version,
            status: ServiceStatusKind::Installed,
            error: None,
        };

        match self
            .model
            .lookup_service_version(&descriptor.service_id, descriptor.version)
        {
            Ok(existing) => {
                if existing.manifest_digest == descriptor.manifest_digest {
                    debug!(service = %descriptor.service_id, version = descriptor.version,
                        "service version already installed");
                    self.emit_service_status(status_base);
                } else {
                    self.emit_service_status(ServiceStatus {
                        status: ServiceStatusKind::Error,
                        error: Some(format!(
                            "version {} already exists with digest {}",
                            descriptor.version, existing.manifest_digest
                        )),
                        ..status_base
                    });
                }
                return;
            }
            Err(e) if e.is_not_exist() => {}
            Err(e) => {
                self.emit_service_status(ServiceStatus {
                    status: ServiceStatusKind::Error,
                    error: Some(e.to_string()),
                    ..status_base
                });
                return;
            }
        }

        let record = ServiceRecord {
            service_id: descriptor.service_id.clone(),
            version: descriptor.version,
            provider: descriptor.provider,
            image_path: descriptor.image_path,
            gid: descriptor.gid,
            manifest_digest: descriptor.manifest_digest,
            devices: descriptor.devices,
            is_active: false,
            retired_at: None,
        };

        match self.model.upsert_service(record) {
            Ok(()) => {
                info!(service = %descriptor.service_id, version = descriptor.version,
                    "service installed");
                self.emit_service_status(status_base);
            }
            Err(e) => {
                self.emit_service_status(ServiceStatus {
                    status: ServiceStatusKind::Error,
                    error: Some(e.to_string()),
                    ..status_base
                });
            }
        }
    }

    /// Deletes retired service versions whose grace period elapsed.
    fn cleanup_services(&self) -> Result<(), ActionError> {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.config.service_gc_grace)
            .unwrap_or_else(|_| chrono::Duration::hours(24));

        for service in self.model.services() {
            if service.is_active {
                continue;
            }
            let Some(retired_at) = service.retired_at else {
                continue;
            };
            if now - retired_at < grace {
                continue;
            }
            let in_use = self
                .model
                .instances_of(&service.service_id)
                .iter()
                .any(|i| i.version == service.version);
            if in_use {
                continue;
            }

            info!(service = %service.service_id, version = service.version,
                "garbage collecting retired service version");
            self.model
                .remove_service(&service.service_id, service.version)?;
            self.emit_service_status(ServiceStatus {
                service_id: service.service_id.clone(),
                version: service.version,
                status: ServiceStatusKind::Removed,
                error: None,
            });
        }

        Ok(())
    }

    /// Stops and removes supervisor units bearing our prefix that no known
    /// instance accounts for.
    async fn cleanup_orphans(&self) {
        let units = match self.sup("list", self.supervisor.list_units(UNIT_PREFIX)).await {
            Ok(units) => units,
            Err(e) => {
                warn!(error = %e, "orphan scan failed");
                return;
            }
        };

        let known: HashSet<String> = self
            .model
            .instances()
            .iter()
            .map(|record| record.unit_name())
            .collect();

        for unit in units {
            if known.contains(&unit) {
                continue;
            }
            let orphaned_instance = instance_id_from_unit(&unit);
            warn!(unit = %unit, instance = ?orphaned_instance, "removing orphaned unit");

            if let Err(e) = self.sup("stop", self.supervisor.stop(&unit)).await {
                warn!(unit = %unit, error = %e, "failed to stop orphan");
            }
            if let Err(e) = self.sup("remove", self.supervisor.remove(&unit)).await {
                warn!(unit = %unit, error = %e, "failed to remove orphan");
            }
        }
    }

    /// Writes the current holder sets of the named devices through to
    /// storage.
    fn persist_grants(&self, devices: &[String]) {
        for device in devices {
            let holders = self.broker.grants(device);
            if let Err(e) = self.storage.save_grants(device, &holders) {
                warn!(device = %device, error = %e, "failed to persist grants");
            }
        }
    }
}

fn render_unit(
    template: &str,
    unit: &str,
    service: &ServiceRecord,
    instance_dir: &std::path::Path,
    uid: u32,
) -> String {
    let mut rendered = String::new();
    for line in template.lines() {
        if line.starts_with('#') {
            continue;
        }
        let line = line
            .replace("${INSTANCE}", unit.trim_end_matches(".service"))
            .replace("${SERVICEPATH}", &service.image_path.to_string_lossy())
            .replace("${INSTANCEPATH}", &instance_dir.to_string_lossy())
            .replace("${UID}", &uid.to_string())
            .replace("${GID}", &service.gid.to_string());
        rendered.push_str(&line);
        rendered.push('\n');
    }
    rendered
}
