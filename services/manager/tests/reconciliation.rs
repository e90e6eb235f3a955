//! Reconcile-level tests: version handling, device admission, orphan
//! cleanup, principal gating, and idempotence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axle_id::{InstanceId, InstanceIdent, ServiceId, SubjectId};
use axle_service_manager::config::Config;
use axle_service_manager::devices::{DeviceBroker, DeviceError, DeviceResource, HostInventory};
use axle_service_manager::engine::{ActionError, ServiceManager};
use axle_service_manager::model::{
    unit_name, DesiredInstance, InstanceState, Principal, ServiceDescriptor, ServiceStatusKind,
};
use axle_service_manager::state::SqliteStore;
use axle_service_manager::supervisor::{MockSupervisor, UnitSupervisor};
use tokio::sync::mpsc;

const START_INTERVAL: Duration = Duration::from_millis(100);

struct Harness {
    manager: ServiceManager,
    supervisor: Arc<MockSupervisor>,
    broker: Arc<DeviceBroker>,
    service_events: mpsc::UnboundedReceiver<axle_service_manager::model::ServiceStatus>,
    _tmp: tempfile::TempDir,
}

fn host_inventory() -> HostInventory {
    HostInventory {
        devices: vec!["/dev/can0".to_string(), "/dev/video0".to_string()],
        groups: vec!["dialout".to_string()],
    }
}

async fn harness_with(
    declarations: Vec<DeviceResource>,
    gc_grace: Duration,
    principal: bool,
) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        working_dir: tmp.path().to_path_buf(),
        state_db: tmp.path().join("manager.db"),
        resources_file: tmp.path().join("resources.json"),
        worker_count: 8,
        start_interval: START_INTERVAL,
        supervisor_timeout: Duration::from_secs(2),
        status_channel_capacity: 32,
        service_gc_grace: gc_grace,
        log_level: "debug".to_string(),
    };

    let supervisor = Arc::new(MockSupervisor::new());
    let broker = Arc::new(DeviceBroker::new(declarations, host_inventory()));
    let storage = Arc::new(SqliteStore::open_in_memory().unwrap());

    let manager = ServiceManager::new(
        config,
        storage,
        Arc::clone(&supervisor) as Arc<dyn UnitSupervisor>,
        Arc::clone(&broker),
    )
    .await
    .unwrap();

    if principal {
        manager
            .set_principal(Some(Principal {
                subjects: vec![subject()],
            }))
            .await;
    }

    let service_events = manager.service_status_events().unwrap();

    Harness {
        manager,
        supervisor,
        broker,
        service_events,
        _tmp: tmp,
    }
}

async fn harness(declarations: Vec<DeviceResource>) -> Harness {
    harness_with(declarations, Duration::from_secs(3600), true).await
}

fn subject() -> SubjectId {
    SubjectId::new("fleet-user").unwrap()
}

fn ident(service: &str, index: u32) -> InstanceIdent {
    InstanceIdent::new(ServiceId::new(service).unwrap(), subject(), index)
}

fn descriptor(service: &str, version: u64, devices: Vec<String>) -> ServiceDescriptor {
    ServiceDescriptor {
        service_id: ServiceId::new(service).unwrap(),
        version,
        provider: "acme".to_string(),
        image_path: PathBuf::from(format!("/srv/images/{service}/{version}")),
        gid: 1200,
        manifest_digest: format!("sha256:{service}-{version}"),
        devices,
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
async fn version_regression_is_rejected_while_siblings_progress() {
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("alpha", 5, vec![])).await;
    install_service(&mut h, descriptor("beta", 7, vec![])).await;

    // Bring beta@7 up first.
    let outcomes = h.manager.reconcile(vec![desired("beta", 0, 7)]).await;
    assert!(outcomes[0].result.is_ok());
    let beta_id = outcomes[0].instance_id.unwrap();
    let statuses = h.manager.instance_status_stream();
    while statuses.try_recv().is_some() {}

    // alpha@5 is new; beta@3 is a regression against the installed beta@7.
    let outcomes = h
        .manager
        .reconcile(vec![desired("alpha", 0, 5), desired("beta", 0, 3)])
        .await;
    assert_eq!(outcomes.len(), 2);

    let alpha = outcomes
        .iter()
        .find(|o| o.ident == ident("alpha", 0))
        .unwrap();
    assert!(alpha.result.is_ok(), "{:?}", alpha.result);

    let beta = outcomes
        .iter()
        .find(|o| o.ident == ident("beta", 0))
        .unwrap();
    assert!(matches!(
        beta.result,
        Err(ActionError::VersionRegression {
            desired: 3,
            current: 7,
            ..
        })
    ));

    // Beta is untouched: still at version 7, still running, never stopped.
    let record = h.manager.instance(&ident("beta", 0)).unwrap();
    assert_eq!(record.version, 7);
    assert!(record.running);
    assert!(!h
        .supervisor
        .stopped_units()
        .contains(&unit_name(&beta_id)));

    // Exactly one status (alpha Active); nothing for beta.
    let batch = tokio::time::timeout(Duration::from_secs(2), statuses.recv())
        .await
        .expect("alpha active");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].state, InstanceState::Active);
    tokio::time::sleep(START_INTERVAL * 2).await;
    assert!(statuses.try_recv().is_none());
}

#[tokio::test]
async fn device_exhaustion_fails_one_instance_and_recovers() {
    let can = DeviceResource {
        name: "can".to_string(),
        shared_count: 2,
        groups: vec!["dialout".to_string()],
        host_devices: vec!["/dev/can0".to_string()],
    };
    let mut h = harness(vec![can]).await;
    install_service(&mut h, descriptor("drive", 1, vec!["can".to_string()])).await;

    let desired_set = vec![
        desired("drive", 0, 1),
        desired("drive", 1, 1),
        desired("drive", 2, 1),
    ];
    let outcomes = h.manager.reconcile(desired_set).await;
    assert_eq!(outcomes.len(), 3);

    let ok: Vec<_> = outcomes.iter().filter(|o| o.result.is_ok()).collect();
    let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
    assert_eq!(ok.len(), 2);
    assert_eq!(failed.len(), 1);
    assert!(matches!(
        failed[0].result,
        Err(ActionError::Device(DeviceError::Unavailable(_)))
    ));
    assert_eq!(h.broker.grants("can").len(), 2);

    // Stop one holder; the starved instance comes up on the next pass.
    let removed_ident = ok[0].ident.clone();
    let starved_ident = failed[0].ident.clone();
    let outcome = h.manager.remove_instance(&removed_ident).await;
    assert!(outcome.result.is_ok());
    assert_eq!(h.broker.grants("can").len(), 1);

    let keep: Vec<DesiredInstance> = [&ok[1].ident, &starved_ident]
        .iter()
        .map(|ident| DesiredInstance {
            ident: (*ident).clone(),
            version: 1,
            priority: 0,
            network: Default::default(),
            resources: vec![],
            labels: HashMap::new(),
        })
        .collect();

    let outcomes = h.manager.reconcile(keep).await;
    assert!(outcomes.iter().all(|o| o.result.is_ok()), "{outcomes:?}");
    assert_eq!(h.broker.grants("can").len(), 2);
    assert!(h.manager.instance(&starved_ident).unwrap().running);
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("hud", 1, vec![])).await;

    let set = vec![desired("hud", 0, 1), desired("hud", 1, 1)];
    let first = h.manager.reconcile(set.clone()).await;
    assert!(first.iter().all(|o| o.result.is_ok()));

    let starts_after_first = h.supervisor.started_units().len();
    let statuses = h.manager.instance_status_stream();
    while statuses.try_recv().is_some() {}

    let second = h.manager.reconcile(set).await;
    assert_eq!(second.len(), 2);
    assert!(second.iter().all(|o| o.result.is_ok()));

    // No new starts, no new statuses.
    assert_eq!(h.supervisor.started_units().len(), starts_after_first);
    tokio::time::sleep(START_INTERVAL * 2).await;
    assert!(statuses.try_recv().is_none());
}

#[tokio::test]
async fn update_replaces_old_version_and_retires_it() {
    let mut h = harness_with(vec![], Duration::ZERO, true).await;
    install_service(&mut h, descriptor("maps", 1, vec![])).await;
    install_service(&mut h, descriptor("maps", 2, vec![])).await;

    let outcomes = h.manager.reconcile(vec![desired("maps", 0, 1)]).await;
    assert!(outcomes[0].result.is_ok());
    let instance_id = outcomes[0].instance_id.unwrap();

    let outcomes = h.manager.reconcile(vec![desired("maps", 0, 2)]).await;
    assert!(outcomes[0].result.is_ok(), "{:?}", outcomes[0].result);

    let record = h.manager.instance(&ident("maps", 0)).unwrap();
    assert_eq!(record.version, 2);
    assert!(record.running);
    // The instance keeps its identity across the update.
    assert_eq!(record.instance_id, instance_id);

    // With a zero grace period the retired version is collected.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let info = h.manager.services_info();
    assert_eq!(info.len(), 1, "{info:?}");
    assert_eq!(info[0].version, 2);
    assert!(info[0].is_active);
}

#[tokio::test]
async fn orphaned_units_are_removed_after_reconcile() {
    let h = harness(vec![]).await;

    let orphan = unit_name(&InstanceId::new());
    h.supervisor.inject_unit(&orphan);
    h.supervisor.inject_unit("sshd.service");

    h.manager.reconcile(vec![]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.supervisor.removed_units().contains(&orphan));
    let units = h.supervisor.list_units("").await.unwrap();
    assert!(units.contains(&"sshd.service".to_string()));
    assert!(!units.contains(&orphan));
}

#[tokio::test]
async fn unset_principal_refuses_installs_and_stops_running() {
    // Boot with a principal, start an instance, then clear it.
    let mut h = harness(vec![]).await;
    install_service(&mut h, descriptor("radio", 1, vec![])).await;

    let outcomes = h.manager.reconcile(vec![desired("radio", 0, 1)]).await;
    assert!(outcomes[0].result.is_ok());
    let instance_id = outcomes[0].instance_id.unwrap();

    h.manager.set_principal(None).await;
    assert!(!h.manager.instance(&ident("radio", 0)).unwrap().running);
    assert!(h
        .supervisor
        .stopped_units()
        .contains(&unit_name(&instance_id)));

    // Reconciling without a principal refuses every install.
    let outcomes = h
        .manager
        .reconcile(vec![desired("radio", 0, 1), desired("radio", 1, 1)])
        .await;
    let refused = outcomes
        .iter()
        .filter(|o| matches!(o.result, Err(ActionError::UnsetPrincipal)))
        .count();
    assert_eq!(refused, 2);

    // The record survives; only execution is gated.
    assert!(h.manager.instance(&ident("radio", 0)).is_some());
}

#[tokio::test]
async fn principal_switch_restarts_only_new_principals_instances() {
    let mut h = harness_with(vec![], Duration::from_secs(3600), false).await;
    install_service(&mut h, descriptor("infotainment", 1, vec![])).await;

    let subj_a = SubjectId::new("driver-a").unwrap();
    let subj_b = SubjectId::new("driver-b").unwrap();
    let ident_a = InstanceIdent::new(
        ServiceId::new("infotainment").unwrap(),
        subj_a.clone(),
        0,
    );
    let ident_b = InstanceIdent::new(
        ServiceId::new("infotainment").unwrap(),
        subj_b.clone(),
        0,
    );

    h.manager
        .set_principal(Some(Principal {
            subjects: vec![subj_a],
        }))
        .await;

    let entry = |ident: &InstanceIdent| DesiredInstance {
        ident: ident.clone(),
        version: 1,
        priority: 0,
        network: Default::default(),
        resources: vec![],
        labels: HashMap::new(),
    };

    let outcomes = h
        .manager
        .reconcile(vec![entry(&ident_a), entry(&ident_b)])
        .await;
    assert!(outcomes.iter().all(|o| o.result.is_ok()), "{outcomes:?}");

    let record_a = h.manager.instance(&ident_a).unwrap();
    let record_b = h.manager.instance(&ident_b).unwrap();
    assert!(record_a.running && record_b.running);
    assert!(record_a.unit_subject);
    assert!(!record_b.unit_subject);

    // Hand the node to driver B: A's instances stop, B's stored instances
    // come back up after device revalidation.
    let outcomes = h
        .manager
        .set_principal(Some(Principal {
            subjects: vec![subj_b],
        }))
        .await;
    assert!(!outcomes.is_empty());
    assert!(outcomes.iter().all(|o| o.result.is_ok()), "{outcomes:?}");

    let record_a = h.manager.instance(&ident_a).unwrap();
    let record_b = h.manager.instance(&ident_b).unwrap();
    assert!(!record_a.running);
    assert!(!record_a.unit_subject);
    assert!(record_b.running);
    assert!(record_b.unit_subject);

    // Both instances were stopped during the handover; only B's restarted.
    assert!(h
        .supervisor
        .stopped_units()
        .contains(&unit_name(&record_a.instance_id)));
    let starts_for_b = h
        .supervisor
        .started_units()
        .iter()
        .filter(|unit| **unit == unit_name(&record_b.instance_id))
        .count();
    assert_eq!(starts_for_b, 2);
}

#[tokio::test]
async fn cold_boot_without_principal_refuses_everything() {
    let mut h = harness_with(vec![], Duration::from_secs(3600), false).await;
    install_service(&mut h, descriptor("radio", 1, vec![])).await;

    let outcomes = h.manager.reconcile(vec![desired("radio", 0, 1)]).await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0].result,
        Err(ActionError::UnsetPrincipal)
    ));
    assert!(h.manager.instance(&ident("radio", 0)).is_none());
}

#[tokio::test]
async fn missing_service_version_fails_the_install() {
    let h = harness(vec![]).await;

    // No install_service call: the reconcile references an unknown image.
    let outcomes = h.manager.reconcile(vec![desired("unknown", 0, 1)]).await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0].result,
        Err(ActionError::NotExist(_))
    ));
}

#[tokio::test]
async fn per_instance_device_requests_are_admitted() {
    let camera = DeviceResource {
        name: "camera".to_string(),
        shared_count: 1,
        groups: vec![],
        host_devices: vec!["/dev/video0".to_string()],
    };
    let mut h = harness(vec![camera]).await;
    install_service(&mut h, descriptor("vision", 1, vec![])).await;

    let mut entry = desired("vision", 0, 1);
    entry.resources = vec!["camera".to_string()];

    let outcomes = h.manager.reconcile(vec![entry]).await;
    assert!(outcomes[0].result.is_ok(), "{:?}", outcomes[0].result);
    assert_eq!(h.broker.grants("camera").len(), 1);

    // Removing the instance releases the grant.
    h.manager.remove_instance(&ident("vision", 0)).await;
    assert!(h.broker.grants("camera").is_empty());
}
