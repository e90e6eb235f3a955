//! Persistent state for the service manager.
//!
//! The core owns the shape of its state but delegates durability to a
//! storage collaborator behind the narrow [`Storage`] trait. Writes are
//! durable when the call returns; the in-memory tables in [`crate::model`]
//! are updated only afterwards.

pub mod store;

use std::collections::{BTreeSet, HashMap};

use axle_id::{InstanceId, InstanceIdent, ServiceId};
use thiserror::Error;

use crate::model::{InstanceRecord, ServiceRecord, StateAck};

pub use store::SqliteStore;

/// Errors surfaced by the storage collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested key does not exist. Distinguishable so callers can
    /// treat it as a recoverable condition.
    #[error("not exist: {0}")]
    NotExist(String),

    /// A uniqueness constraint was violated on insert.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The backing store failed.
    #[error("storage failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_exist(&self) -> bool {
        matches!(self, StoreError::NotExist(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotExist("row".to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Contract the core requires from its persistence collaborator.
///
/// Implementations must serialize conflicting writes; the core calls from
/// multiple workers without further coordination.
pub trait Storage: Send + Sync {
    // Services, keyed by (service ID, version).
    fn upsert_service(&self, record: &ServiceRecord) -> Result<(), StoreError>;
    fn remove_service(&self, service_id: &ServiceId, version: u64) -> Result<(), StoreError>;
    fn service(&self, service_id: &ServiceId, version: u64) -> Result<ServiceRecord, StoreError>;
    fn services(&self) -> Result<Vec<ServiceRecord>, StoreError>;

    // Instances, keyed by instance ID with a unique ident index.
    fn upsert_instance(&self, record: &InstanceRecord) -> Result<(), StoreError>;
    fn remove_instance(&self, instance_id: &InstanceId) -> Result<(), StoreError>;
    fn instance(&self, instance_id: &InstanceId) -> Result<InstanceRecord, StoreError>;
    fn instance_by_ident(&self, ident: &InstanceIdent) -> Result<InstanceRecord, StoreError>;
    fn instances(&self) -> Result<Vec<InstanceRecord>, StoreError>;
    fn set_instance_running(
        &self,
        instance_id: &InstanceId,
        running: bool,
    ) -> Result<(), StoreError>;
    fn set_instance_error(
        &self,
        instance_id: &InstanceId,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    // Device grants, keyed by device name.
    fn save_grants(
        &self,
        device: &str,
        holders: &BTreeSet<InstanceId>,
    ) -> Result<(), StoreError>;
    fn load_grants(&self) -> Result<HashMap<String, BTreeSet<InstanceId>>, StoreError>;

    // Per-instance environment overrides, applied at the next start.
    fn save_env_override(
        &self,
        ident: &InstanceIdent,
        vars: &HashMap<String, String>,
    ) -> Result<(), StoreError>;
    fn env_override(
        &self,
        ident: &InstanceIdent,
    ) -> Result<HashMap<String, String>, StoreError>;
    fn remove_env_override(&self, ident: &InstanceIdent) -> Result<(), StoreError>;

    // Per-instance state acceptance metadata.
    fn save_state_ack(&self, ack: &StateAck) -> Result<(), StoreError>;
    fn state_ack(&self, instance_id: &InstanceId) -> Result<StateAck, StoreError>;

    /// Allocates the next free UID for a new instance. Never reused.
    fn allocate_uid(&self) -> Result<u32, StoreError>;
}
