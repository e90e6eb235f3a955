//! End-to-end instance lifecycle tests against the mock supervisor and an
//! in-memory state store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axle_id::{InstanceIdent, ServiceId, SubjectId};
use axle_service_manager::config::Config;
use axle_service_manager::devices::{DeviceBroker, DeviceResource, HostInventory};
use axle_service_manager::engine::{ActionError, ServiceManager};
use axle_service_manager::model::{
    unit_name, DesiredInstance, InstanceState, Principal, ServiceDescriptor, ServiceStatusKind,
};
use axle_service_manager::state::{SqliteStore, Storage};
use axle_service_manager::supervisor::{MockSupervisor, StartBehavior, UnitState, UnitSupervisor};
use tokio::sync::mpsc;

const START_INTERVAL: Duration = Duration::from_millis(100);

struct Harness {
    manager: ServiceManager,
    supervisor: Arc<MockSupervisor>,
    storage: Arc<SqliteStore>,
    service_events: mpsc::UnboundedReceiver<axle_service_manager::model::ServiceStatus>,
    tmp: tempfile::TempDir,
}

fn test_config(tmp: &tempfile::TempDir) -> Config {
    Config {
        working_dir: tmp.path().to_path_buf(),
        state_db: tmp.path().join("manager.db"),
        resources_file: tmp.path().join("resources.json"),
        worker_count: 8,
        start_interval: START_INTERVAL,
        supervisor_timeout: Duration::from_secs(2),
        status_channel_capacity: 32,
        service_gc_grace: Duration::from_secs(3600),
        log_level: "debug".to_string(),
    }
}

fn host_inventory() -> HostInventory {
    HostInventory {
        devices: vec!["/dev/can0".to_string()],
        groups: vec!["dialout".to_string()],
    }
}

async fn harness(declarations: Vec<DeviceResource>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);

    let supervisor = Arc::new(MockSupervisor::new());
    let broker = Arc::new(DeviceBroker::new(declarations, host_inventory()));
    let storage = Arc::new(SqliteStore::open_in_memory().unwrap());

    let manager = ServiceManager::new(
        config,
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::clone(&supervisor) as Arc<dyn UnitSupervisor>,
        broker,
    )
    .await
    .unwrap();

    manager
        .set_principal(Some(Principal {
            subjects: vec![subject()],
        }))
        .await;

    let service_events = manager.service_status_events().unwrap();

    Harness {
        manager,
        supervisor,
        storage,
        service_events,
        tmp,
    }
}

fn subject() -> SubjectId {
    SubjectId::new("vehicle-owner").unwrap()
}

fn service_id(name: &str) -> ServiceId {
    ServiceId::new(name).unwrap()
}

fn ident(service: &str, index: u32) -> InstanceIdent {
    InstanceIdent::new(service_id(service), subject(), index)
}

fn descriptor(service: &str, version: u64) -> ServiceDescriptor {
    ServiceDescriptor {
        service_id: service_id(service),
        version,
        provider: "acme".to_string(),
        image_path: PathBuf::from(format!("/srv/images/{service}/{version}")),
        gid: 1200,
        manifest_digest: format!("sha256:{service}-{version}"),
        devices: vec![],
    }
}

fn desired(service: &str, index: u32, version: u64) -> DesiredInstance {
    DesiredInstance {
        ident: ident(service, index),
        version,
        priority: 0,
        network: Default::default(),
        resources: vec![],
        labels: HashMap::new(),
    }
}

async fn install_service(h: &mut Harness, d: ServiceDescriptor) {
    h.manager.install_service(d);
    let status = tokio::time::timeout(Duration::from_secs(2), h.service_events.recv())
        .await
        .expect("service status")
        .expect("channel open");
    assert_eq!(status.status, ServiceStatusKind::Installed, "{status:?}");
}

#[tokio::test]
async fn install_start_and_remove() {
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("telemetry", 1)).await;

    let statuses = h.manager.instance_status_stream();

    let outcomes = h.manager.reconcile(vec![desired("telemetry", 0, 1)]).await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].result.is_ok(), "{:?}", outcomes[0].result);
    let instance_id = outcomes[0].instance_id.unwrap();

    // Exactly one Active status within the start interval.
    let batch = tokio::time::timeout(START_INTERVAL, statuses.recv())
        .await
        .expect("active status");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].instance_id, instance_id);
    assert_eq!(batch[0].state, InstanceState::Active);

    let record = h.manager.instance(&ident("telemetry", 0)).unwrap();
    assert!(record.running);
    assert!(h
        .supervisor
        .started_units()
        .contains(&unit_name(&instance_id)));

    // Removal is clean: no Failed status, instance gone from storage.
    let outcome = h.manager.remove_instance(&ident("telemetry", 0)).await;
    assert!(outcome.result.is_ok());
    assert!(h.manager.instance(&ident("telemetry", 0)).is_none());
    assert!(h
        .supervisor
        .removed_units()
        .contains(&unit_name(&instance_id)));

    tokio::time::sleep(START_INTERVAL * 3).await;
    assert!(statuses.try_recv().is_none(), "stop must not publish a status");
}

#[tokio::test]
async fn failed_start_reports_and_recovers_after_repair() {
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("diag", 2)).await;

    // The service binary is missing: the unit fails right after start.
    h.supervisor.set_default_behavior(StartBehavior::FailAfterStart);

    let statuses = h.manager.instance_status_stream();
    let outcomes = h.manager.reconcile(vec![desired("diag", 0, 2)]).await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].result.is_err());

    let batch = tokio::time::timeout(Duration::from_secs(2), statuses.recv())
        .await
        .expect("failed status");
    assert_eq!(batch[0].state, InstanceState::Failed);
    assert!(batch[0].err.is_some());

    let record = h.manager.instance(&ident("diag", 0)).unwrap();
    assert!(!record.running);
    assert!(record.last_error.is_some());

    // After repair, the next reconcile retries and the instance comes up.
    h.supervisor.set_default_behavior(StartBehavior::Healthy);
    let outcomes = h.manager.reconcile(vec![desired("diag", 0, 2)]).await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].result.is_ok(), "{:?}", outcomes[0].result);

    let batch = tokio::time::timeout(Duration::from_secs(2), statuses.recv())
        .await
        .expect("active status");
    assert_eq!(batch[0].state, InstanceState::Active);
    assert!(h.manager.instance(&ident("diag", 0)).unwrap().running);
}

#[tokio::test]
async fn supervisor_flap_within_window_is_suppressed() {
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("gateway", 1)).await;

    let statuses = h.manager.instance_status_stream();
    let outcomes = h.manager.reconcile(vec![desired("gateway", 0, 1)]).await;
    let instance_id = outcomes[0].instance_id.unwrap();

    // Drain the start event.
    let batch = tokio::time::timeout(Duration::from_secs(2), statuses.recv())
        .await
        .expect("active status");
    assert_eq!(batch[0].state, InstanceState::Active);

    // The unit fails and the supervisor restarts it inside half the
    // debounce window.
    let unit = unit_name(&instance_id);
    h.supervisor.emit(&unit, UnitState::Failed);
    tokio::time::sleep(START_INTERVAL / 2).await;
    h.supervisor.emit(&unit, UnitState::Active);

    tokio::time::sleep(START_INTERVAL * 3).await;
    assert!(statuses.try_recv().is_none(), "flap must not publish");
    assert!(h.manager.instance(&ident("gateway", 0)).unwrap().running);
}

#[tokio::test]
async fn sustained_crash_publishes_failed_once() {
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("audio", 1)).await;

    let statuses = h.manager.instance_status_stream();
    let outcomes = h.manager.reconcile(vec![desired("audio", 0, 1)]).await;
    let instance_id = outcomes[0].instance_id.unwrap();

    let _ = tokio::time::timeout(Duration::from_secs(2), statuses.recv()).await;

    h.supervisor.emit(&unit_name(&instance_id), UnitState::Failed);

    let batch = tokio::time::timeout(Duration::from_secs(2), statuses.recv())
        .await
        .expect("failed status");
    assert_eq!(batch[0].state, InstanceState::Failed);

    // The stable projection flips the persisted running flag.
    assert!(!h.manager.instance(&ident("audio", 0)).unwrap().running);
}

#[tokio::test]
async fn env_overrides_validate_idents() {
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("nav", 1)).await;
    h.manager.reconcile(vec![desired("nav", 0, 1)]).await;

    let vars: HashMap<String, String> = [("LOG_LEVEL".to_string(), "trace".to_string())].into();
    let results = h
        .manager
        .override_env_vars(&[ident("nav", 0), ident("ghost", 0)], &vars);

    assert_eq!(results.len(), 2);
    assert!(results[0].1.is_ok());
    assert!(matches!(results[1].1, Err(ActionError::NotExist(_))));
}

#[tokio::test]
async fn install_service_is_idempotent_and_version_unique() {
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("maps", 1)).await;

    // Same descriptor again: still Installed.
    install_service(&mut h, descriptor("maps", 1)).await;

    // Same version, different digest: rejected.
    let mut conflicting = descriptor("maps", 1);
    conflicting.manifest_digest = "sha256:other".to_string();
    h.manager.install_service(conflicting);

    let status = tokio::time::timeout(Duration::from_secs(2), h.service_events.recv())
        .await
        .expect("service status")
        .unwrap();
    assert_eq!(status.status, ServiceStatusKind::Error);
    assert!(status.error.unwrap().contains("already exists"));
}

#[tokio::test]
async fn state_acceptance_is_persisted() {
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("logger", 1)).await;

    let outcomes = h.manager.reconcile(vec![desired("logger", 0, 1)]).await;
    let instance_id = outcomes[0].instance_id.unwrap();

    h.manager
        .state_acceptance(instance_id, false, Some("checksum mismatch".to_string()));

    // The acceptance runs on the instance's action key; give it a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ack = h.storage.state_ack(&instance_id).unwrap();
    assert!(!ack.accepted);
    assert_eq!(ack.reason.as_deref(), Some("checksum mismatch"));

    // A later acceptance overwrites the rejection.
    h.manager.state_acceptance(instance_id, true, None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ack = h.storage.state_ack(&instance_id).unwrap();
    assert!(ack.accepted);
    assert!(ack.reason.is_none());
}

#[tokio::test]
async fn env_override_applies_at_next_start() {
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("telemetry", 1)).await;

    let outcomes = h.manager.reconcile(vec![desired("telemetry", 0, 1)]).await;
    assert!(outcomes[0].result.is_ok());
    let instance_id = outcomes[0].instance_id.unwrap();

    let env_file = h
        .tmp
        .path()
        .join("instances")
        .join(instance_id.to_string())
        .join("env");
    assert_eq!(std::fs::read_to_string(&env_file).unwrap(), "");

    let vars: HashMap<String, String> = [
        ("LOG_LEVEL".to_string(), "trace".to_string()),
        ("REGION".to_string(), "emea".to_string()),
    ]
    .into();
    let results = h
        .manager
        .override_env_vars(&[ident("telemetry", 0)], &vars);
    assert!(results[0].1.is_ok());

    // Stored immediately, applied at the next start: the running unit's
    // env file is untouched until then.
    assert_eq!(std::fs::read_to_string(&env_file).unwrap(), "");

    // Cycle the principal to restart the stored set.
    h.manager.set_principal(None).await;
    assert!(!h.manager.instance(&ident("telemetry", 0)).unwrap().running);

    let outcomes = h
        .manager
        .set_principal(Some(Principal {
            subjects: vec![subject()],
        }))
        .await;
    assert!(outcomes.iter().all(|o| o.result.is_ok()), "{outcomes:?}");
    assert!(h.manager.instance(&ident("telemetry", 0)).unwrap().running);

    let content = std::fs::read_to_string(&env_file).unwrap();
    assert_eq!(content, "LOG_LEVEL=trace\nREGION=emea\n");
}

#[tokio::test]
async fn shutdown_completes_with_work_in_flight() {
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("ota", 1)).await;

    // Kick off work and shut down mid-flight.
    let reconcile = h.manager.reconcile(vec![
        desired("ota", 0, 1),
        desired("ota", 1, 1),
        desired("ota", 2, 1),
    ]);
    let outcomes = reconcile.await;
    assert_eq!(outcomes.len(), 3);

    h.manager.shutdown().await;
}
