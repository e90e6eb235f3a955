//! In-memory entities of the service manager and the events it emits.
//!
//! The tables here are the node's authoritative view of installed services
//! and instances. Every mutation persists through the storage collaborator
//! *before* the in-memory table reflects the change, so a crash never leaves
//! memory ahead of disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axle_id::{InstanceId, InstanceIdent, ServiceId, SubjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{Storage, StoreError};

/// Prefix of every supervisor unit owned by this manager.
pub const UNIT_PREFIX: &str = "axle-";

/// Derives the supervisor unit name for an instance.
pub fn unit_name(instance_id: &InstanceId) -> String {
    format!("{UNIT_PREFIX}{instance_id}.service")
}

/// Recovers the instance ID from a unit name bearing our prefix.
///
/// Returns `None` for units that do not belong to the manager.
pub fn instance_id_from_unit(unit: &str) -> Option<InstanceId> {
    let rest = unit.strip_prefix(UNIT_PREFIX)?;
    let id = rest.strip_suffix(".service")?;
    InstanceId::parse(id).ok()
}

/// An installed service version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service_id: ServiceId,
    pub version: u64,
    pub provider: String,
    /// Path of the unpacked image rootfs on disk.
    pub image_path: PathBuf,
    pub gid: u32,
    pub manifest_digest: String,
    /// Host devices this service requires when started.
    pub devices: Vec<String>,
    /// True for at most one version per service ID.
    pub is_active: bool,
    /// Set when the version stops being active with no instances; drives
    /// grace-period garbage collection.
    pub retired_at: Option<DateTime<Utc>>,
}

/// An installed service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub service_id: ServiceId,
    pub subject_id: SubjectId,
    pub instance_index: u32,
    pub version: u64,
    /// True when the instance subject matches the node principal.
    pub unit_subject: bool,
    pub running: bool,
    pub uid: u32,
    /// Most recent per-instance action error, if any.
    pub last_error: Option<String>,
}

impl InstanceRecord {
    pub fn ident(&self) -> InstanceIdent {
        InstanceIdent::new(
            self.service_id.clone(),
            self.subject_id.clone(),
            self.instance_index,
        )
    }

    pub fn unit_name(&self) -> String {
        unit_name(&self.instance_id)
    }

    /// Desired-state view of an installed record, used when restarting the
    /// stored set after a principal change. Per-entry device requests and
    /// labels are not persisted; the service declaration still supplies
    /// its devices.
    pub fn as_desired(&self) -> DesiredInstance {
        DesiredInstance {
            ident: self.ident(),
            version: self.version,
            priority: 0,
            network: NetworkParams::default(),
            resources: Vec::new(),
            labels: HashMap::new(),
        }
    }
}

/// One entry of the desired instance set pushed down from the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredInstance {
    pub ident: InstanceIdent,
    pub version: u64,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub network: NetworkParams,
    /// Additional per-instance device requests, merged with the service's
    /// own declaration.
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Network parameters forwarded to the CNI collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkParams {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Stable instance state, as projected by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Activating,
    Active,
    Failed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A stable state change for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// Outcome of an install or remove action on a service version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_id: ServiceId,
    pub version: u64,
    pub status: ServiceStatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatusKind {
    Installed,
    Removed,
    Error,
}

/// Descriptor handed to `install_service` by the cloud collaborator after
/// the image has been downloaded, verified, and unpacked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub service_id: ServiceId,
    pub version: u64,
    pub provider: String,
    pub image_path: PathBuf,
    pub gid: u32,
    pub manifest_digest: String,
    #[serde(default)]
    pub devices: Vec<String>,
}

/// The authenticated subject set for the node, established by identity
/// bootstrap. Installs are refused while it is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subjects: Vec<SubjectId>,
}

impl Principal {
    pub fn contains(&self, subject: &SubjectId) -> bool {
        self.subjects.iter().any(|s| s == subject)
    }
}

/// Persisted state acceptance for an instance snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateAck {
    pub instance_id: InstanceId,
    pub accepted: bool,
    pub reason: Option<String>,
}

/// In-memory service/instance tables with write-through persistence.
///
/// A single coarse mutex protects both tables; all writers go through the
/// action queue, so contention is low.
pub struct Model {
    storage: Arc<dyn Storage>,
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    /// Keyed by (service ID, version).
    services: HashMap<(ServiceId, u64), ServiceRecord>,
    instances: HashMap<InstanceId, InstanceRecord>,
    by_ident: HashMap<InstanceIdent, InstanceId>,
}

impl Model {
    /// Loads the tables from storage.
    pub fn load(storage: Arc<dyn Storage>) -> Result<Self, StoreError> {
        let mut tables = Tables::default();

        for service in storage.services()? {
            tables
                .services
                .insert((service.service_id.clone(), service.version), service);
        }

        for instance in storage.instances()? {
            tables
                .by_ident
                .insert(instance.ident(), instance.instance_id);
            tables.instances.insert(instance.instance_id, instance);
        }

        Ok(Self {
            storage,
            tables: Mutex::new(tables),
        })
    }

    /// Latest installed version of a service.
    pub fn lookup_service(&self, service_id: &ServiceId) -> Result<ServiceRecord, StoreError> {
        let tables = self.tables.lock().unwrap();
        tables
            .services
            .values()
            .filter(|s| &s.service_id == service_id)
            .max_by_key(|s| s.version)
            .cloned()
            .ok_or_else(|| StoreError::NotExist(format!("service {service_id}")))
    }

    pub fn lookup_service_version(
        &self,
        service_id: &ServiceId,
        version: u64,
    ) -> Result<ServiceRecord, StoreError> {
        let tables = self.tables.lock().unwrap();
        tables
            .services
            .get(&(service_id.clone(), version))
            .cloned()
            .ok_or_else(|| StoreError::NotExist(format!("service {service_id}@{version}")))
    }

    pub fn services(&self) -> Vec<ServiceRecord> {
        self.tables.lock().unwrap().services.values().cloned().collect()
    }

    pub fn lookup_instance(&self, instance_id: &InstanceId) -> Result<InstanceRecord, StoreError> {
        let tables = self.tables.lock().unwrap();
        tables
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| StoreError::NotExist(format!("instance {instance_id}")))
    }

    pub fn lookup_instance_by_ident(
        &self,
        ident: &InstanceIdent,
    ) -> Result<InstanceRecord, StoreError> {
        let tables = self.tables.lock().unwrap();
        tables
            .by_ident
            .get(ident)
            .and_then(|id| tables.instances.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotExist(format!("instance {ident}")))
    }

    pub fn instances(&self) -> Vec<InstanceRecord> {
        self.tables.lock().unwrap().instances.values().cloned().collect()
    }

    pub fn instances_of(&self, service_id: &ServiceId) -> Vec<InstanceRecord> {
        let tables = self.tables.lock().unwrap();
        tables
            .instances
            .values()
            .filter(|i| &i.service_id == service_id)
            .cloned()
            .collect()
    }

    pub fn upsert_service(&self, record: ServiceRecord) -> Result<(), StoreError> {
        self.storage.upsert_service(&record)?;
        let mut tables = self.tables.lock().unwrap();
        tables
            .services
            .insert((record.service_id.clone(), record.version), record);
        Ok(())
    }

    pub fn remove_service(&self, service_id: &ServiceId, version: u64) -> Result<(), StoreError> {
        self.storage.remove_service(service_id, version)?;
        let mut tables = self.tables.lock().unwrap();
        tables.services.remove(&(service_id.clone(), version));
        Ok(())
    }

    pub fn upsert_instance(&self, record: InstanceRecord) -> Result<(), StoreError> {
        self.storage.upsert_instance(&record)?;
        let mut tables = self.tables.lock().unwrap();
        tables.by_ident.insert(record.ident(), record.instance_id);
        tables.instances.insert(record.instance_id, record);
        Ok(())
    }

    pub fn remove_instance(&self, instance_id: &InstanceId) -> Result<(), StoreError> {
        self.storage.remove_instance(instance_id)?;
        let mut tables = self.tables.lock().unwrap();
        if let Some(record) = tables.instances.remove(instance_id) {
            tables.by_ident.remove(&record.ident());
        }
        Ok(())
    }

    /// Mutator used by the runner forwarder upon stable transitions.
    pub fn set_running(&self, instance_id: &InstanceId, running: bool) -> Result<(), StoreError> {
        self.storage.set_instance_running(instance_id, running)?;
        let mut tables = self.tables.lock().unwrap();
        if let Some(record) = tables.instances.get_mut(instance_id) {
            record.running = running;
        }
        Ok(())
    }

    pub fn set_last_error(
        &self,
        instance_id: &InstanceId,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.storage
            .set_instance_error(instance_id, error.as_deref())?;
        let mut tables = self.tables.lock().unwrap();
        if let Some(record) = tables.instances.get_mut(instance_id) {
            record.last_error = error;
        }
        Ok(())
    }

    /// Marks `version` the single active version of `service_id`.
    ///
    /// Versions losing the flag with no remaining instances are stamped
    /// `retired_at` so the garbage collector can reclaim them after the
    /// grace period.
    pub fn activate_service_version(
        &self,
        service_id: &ServiceId,
        version: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let records: Vec<ServiceRecord> = {
            let tables = self.tables.lock().unwrap();
            tables
                .services
                .values()
                .filter(|s| &s.service_id == service_id)
                .cloned()
                .collect()
        };

        let instance_versions: Vec<u64> = self
            .instances_of(service_id)
            .iter()
            .map(|i| i.version)
            .collect();

        for mut record in records {
            if record.version == version {
                if record.is_active && record.retired_at.is_none() {
                    continue;
                }
                record.is_active = true;
                record.retired_at = None;
                self.upsert_service(record)?;
            } else {
                let unused = !instance_versions.contains(&record.version);
                let wants_retire = unused && record.retired_at.is_none();
                if !record.is_active && !wants_retire {
                    continue;
                }
                record.is_active = false;
                if wants_retire {
                    record.retired_at = Some(now);
                }
                self.upsert_service(record)?;
            }
        }

        Ok(())
    }

    /// Stamps `retired_at` on a version that has just lost its last
    /// instance, unless it is the active version.
    pub fn retire_if_unused(
        &self,
        service_id: &ServiceId,
        version: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = match self.lookup_service_version(service_id, version) {
            Ok(record) => record,
            Err(StoreError::NotExist(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if record.is_active || record.retired_at.is_some() {
            return Ok(());
        }

        let in_use = self
            .instances_of(service_id)
            .iter()
            .any(|i| i.version == version);
        if in_use {
            return Ok(());
        }

        let mut record = record;
        record.retired_at = Some(now);
        self.upsert_service(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::store::SqliteStore;

    fn service_id(s: &str) -> ServiceId {
        ServiceId::new(s).unwrap()
    }

    fn subject_id(s: &str) -> SubjectId {
        SubjectId::new(s).unwrap()
    }

    fn model() -> Model {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        Model::load(store).unwrap()
    }

    fn service(id: &str, version: u64) -> ServiceRecord {
        ServiceRecord {
            service_id: service_id(id),
            version,
            provider: "acme".to_string(),
            image_path: PathBuf::from(format!("/srv/{id}/{version}")),
            gid: 1000,
            manifest_digest: format!("sha256:{id}{version}"),
            devices: vec![],
            is_active: false,
            retired_at: None,
        }
    }

    fn instance(id: &str, version: u64) -> InstanceRecord {
        InstanceRecord {
            instance_id: InstanceId::new(),
            service_id: service_id(id),
            subject_id: subject_id("subj"),
            instance_index: 0,
            version,
            unit_subject: true,
            running: false,
            uid: 5000,
            last_error: None,
        }
    }

    #[test]
    fn unit_name_roundtrip() {
        let id = InstanceId::new();
        let unit = unit_name(&id);
        assert!(unit.starts_with("axle-inst_"));
        assert_eq!(instance_id_from_unit(&unit), Some(id));
        assert_eq!(instance_id_from_unit("sshd.service"), None);
        assert_eq!(instance_id_from_unit("axle-garbage.service"), None);
    }

    #[test]
    fn lookup_service_returns_latest() {
        let model = model();
        model.upsert_service(service("svc", 1)).unwrap();
        model.upsert_service(service("svc", 3)).unwrap();
        model.upsert_service(service("svc", 2)).unwrap();

        let latest = model.lookup_service(&service_id("svc")).unwrap();
        assert_eq!(latest.version, 3);

        assert!(matches!(
            model.lookup_service(&service_id("other")),
            Err(StoreError::NotExist(_))
        ));
    }

    #[test]
    fn instance_indexes_stay_consistent() {
        let model = model();
        let rec = instance("svc", 1);
        let ident = rec.ident();
        let id = rec.instance_id;

        model.upsert_instance(rec).unwrap();
        assert_eq!(
            model.lookup_instance_by_ident(&ident).unwrap().instance_id,
            id
        );

        model.remove_instance(&id).unwrap();
        assert!(model.lookup_instance(&id).is_err());
        assert!(model.lookup_instance_by_ident(&ident).is_err());
    }

    #[test]
    fn activation_is_exclusive() {
        let model = model();
        let mut v1 = service("svc", 1);
        v1.is_active = true;
        model.upsert_service(v1).unwrap();
        model.upsert_service(service("svc", 2)).unwrap();

        model
            .activate_service_version(&service_id("svc"), 2, Utc::now())
            .unwrap();

        let v1 = model
            .lookup_service_version(&service_id("svc"), 1)
            .unwrap();
        let v2 = model
            .lookup_service_version(&service_id("svc"), 2)
            .unwrap();
        assert!(!v1.is_active);
        assert!(v1.retired_at.is_some());
        assert!(v2.is_active);
        assert!(v2.retired_at.is_none());
    }

    #[test]
    fn retire_skips_versions_in_use() {
        let model = model();
        model.upsert_service(service("svc", 1)).unwrap();
        model.upsert_instance(instance("svc", 1)).unwrap();

        model
            .retire_if_unused(&service_id("svc"), 1, Utc::now())
            .unwrap();
        let rec = model
            .lookup_service_version(&service_id("svc"), 1)
            .unwrap();
        assert!(rec.retired_at.is_none());
    }
}
