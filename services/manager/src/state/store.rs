//! SQLite-backed storage.
//!
//! WAL mode keeps readers unblocked while action workers write. A single
//! connection behind a mutex is sufficient at the write rates of a node
//! manager.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use axle_id::{InstanceId, InstanceIdent, ServiceId, SubjectId};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{Storage, StoreError};
use crate::model::{InstanceRecord, ServiceRecord, StateAck};

/// UIDs handed to instances start here.
const UID_BASE: u32 = 5000;

/// SQLite storage for services, instances, grants, and instance metadata.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                service_id      TEXT NOT NULL,
                version         INTEGER NOT NULL,
                provider        TEXT NOT NULL,
                image_path      TEXT NOT NULL,
                gid             INTEGER NOT NULL,
                manifest_digest TEXT NOT NULL,
                devices         TEXT NOT NULL DEFAULT '[]',
                is_active       INTEGER NOT NULL DEFAULT 0,
                retired_at      TEXT,
                PRIMARY KEY (service_id, version)
            );

            CREATE TABLE IF NOT EXISTS instances (
                instance_id    TEXT PRIMARY KEY,
                service_id     TEXT NOT NULL,
                subject_id     TEXT NOT NULL,
                instance_index INTEGER NOT NULL,
                version        INTEGER NOT NULL,
                unit_subject   INTEGER NOT NULL DEFAULT 0,
                running        INTEGER NOT NULL DEFAULT 0,
                uid            INTEGER NOT NULL,
                last_error     TEXT,
                UNIQUE (service_id, subject_id, instance_index)
            );

            CREATE INDEX IF NOT EXISTS idx_instances_service ON instances(service_id);

            CREATE TABLE IF NOT EXISTS device_grants (
                device  TEXT PRIMARY KEY,
                holders TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS env_overrides (
                service_id     TEXT NOT NULL,
                subject_id     TEXT NOT NULL,
                instance_index INTEGER NOT NULL,
                vars           TEXT NOT NULL,
                PRIMARY KEY (service_id, subject_id, instance_index)
            );

            CREATE TABLE IF NOT EXISTS state_acks (
                instance_id TEXT PRIMARY KEY,
                accepted    INTEGER NOT NULL,
                reason      TEXT
            );

            CREATE TABLE IF NOT EXISTS counters (
                name  TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("state store schema initialized");
        Ok(())
    }

    fn service_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceRecord> {
        let service_id: String = row.get(0)?;
        let devices: String = row.get(6)?;
        let retired_at: Option<String> = row.get(8)?;

        Ok(ServiceRecord {
            service_id: ServiceId::new(service_id)
                .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?,
            version: row.get::<_, i64>(1)? as u64,
            provider: row.get(2)?,
            image_path: row.get::<_, String>(3)?.into(),
            gid: row.get::<_, i64>(4)? as u32,
            manifest_digest: row.get(5)?,
            devices: serde_json::from_str(&devices).unwrap_or_default(),
            is_active: row.get::<_, i64>(7)? != 0,
            retired_at: retired_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }

    fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<InstanceRecord> {
        let instance_id: String = row.get(0)?;
        let service_id: String = row.get(1)?;
        let subject_id: String = row.get(2)?;

        Ok(InstanceRecord {
            instance_id: InstanceId::parse(&instance_id)
                .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?,
            service_id: ServiceId::new(service_id)
                .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?,
            subject_id: SubjectId::new(subject_id)
                .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?,
            instance_index: row.get::<_, i64>(3)? as u32,
            version: row.get::<_, i64>(4)? as u64,
            unit_subject: row.get::<_, i64>(5)? != 0,
            running: row.get::<_, i64>(6)? != 0,
            uid: row.get::<_, i64>(7)? as u32,
            last_error: row.get(8)?,
        })
    }
}

const SERVICE_COLUMNS: &str =
    "service_id, version, provider, image_path, gid, manifest_digest, devices, is_active, retired_at";

const INSTANCE_COLUMNS: &str =
    "instance_id, service_id, subject_id, instance_index, version, unit_subject, running, uid, last_error";

impl Storage for SqliteStore {
    fn upsert_service(&self, record: &ServiceRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO services (service_id, version, provider, image_path, gid,
                                  manifest_digest, devices, is_active, retired_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(service_id, version) DO UPDATE SET
                provider = excluded.provider,
                image_path = excluded.image_path,
                gid = excluded.gid,
                manifest_digest = excluded.manifest_digest,
                devices = excluded.devices,
                is_active = excluded.is_active,
                retired_at = excluded.retired_at
            "#,
            params![
                record.service_id.as_str(),
                record.version as i64,
                record.provider,
                record.image_path.to_string_lossy(),
                record.gid as i64,
                record.manifest_digest,
                serde_json::to_string(&record.devices)
                    .map_err(|e| StoreError::Backend(e.to_string()))?,
                record.is_active as i64,
                record.retired_at.map(|dt| dt.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn remove_service(&self, service_id: &ServiceId, version: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM services WHERE service_id = ?1 AND version = ?2",
            params![service_id.as_str(), version as i64],
        )?;
        Ok(())
    }

    fn service(&self, service_id: &ServiceId, version: u64) -> Result<ServiceRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE service_id = ?1 AND version = ?2"
        ))?;

        stmt.query_row(
            params![service_id.as_str(), version as i64],
            Self::service_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotExist(format!("service {service_id}@{version}")))
    }

    fn services(&self) -> Result<Vec<ServiceRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services ORDER BY service_id, version"
        ))?;

        let records = stmt
            .query_map([], Self::service_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn upsert_instance(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO instances (instance_id, service_id, subject_id, instance_index,
                                   version, unit_subject, running, uid, last_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(instance_id) DO UPDATE SET
                version = excluded.version,
                unit_subject = excluded.unit_subject,
                running = excluded.running,
                uid = excluded.uid,
                last_error = excluded.last_error
            "#,
            params![
                record.instance_id.to_string(),
                record.service_id.as_str(),
                record.subject_id.as_str(),
                record.instance_index as i64,
                record.version as i64,
                record.unit_subject as i64,
                record.running as i64,
                record.uid as i64,
                record.last_error,
            ],
        )?;
        Ok(())
    }

    fn remove_instance(&self, instance_id: &InstanceId) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM instances WHERE instance_id = ?1",
            params![instance_id.to_string()],
        )?;
        Ok(())
    }

    fn instance(&self, instance_id: &InstanceId) -> Result<InstanceRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = ?1"
        ))?;

        stmt.query_row(params![instance_id.to_string()], Self::instance_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotExist(format!("instance {instance_id}")))
    }

    fn instance_by_ident(&self, ident: &InstanceIdent) -> Result<InstanceRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances
             WHERE service_id = ?1 AND subject_id = ?2 AND instance_index = ?3"
        ))?;

        stmt.query_row(
            params![
                ident.service_id.as_str(),
                ident.subject_id.as_str(),
                ident.instance_index as i64
            ],
            Self::instance_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotExist(format!("instance {ident}")))
    }

    fn instances(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY instance_id"
        ))?;

        let records = stmt
            .query_map([], Self::instance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn set_instance_running(
        &self,
        instance_id: &InstanceId,
        running: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE instances SET running = ?1 WHERE instance_id = ?2",
            params![running as i64, instance_id.to_string()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotExist(format!("instance {instance_id}")));
        }
        Ok(())
    }

    fn set_instance_error(
        &self,
        instance_id: &InstanceId,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE instances SET last_error = ?1 WHERE instance_id = ?2",
            params![error, instance_id.to_string()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotExist(format!("instance {instance_id}")));
        }
        Ok(())
    }

    fn save_grants(
        &self,
        device: &str,
        holders: &BTreeSet<InstanceId>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        if holders.is_empty() {
            conn.execute(
                "DELETE FROM device_grants WHERE device = ?1",
                params![device],
            )?;
            return Ok(());
        }

        let encoded: Vec<String> = holders.iter().map(|id| id.to_string()).collect();
        conn.execute(
            r#"
            INSERT INTO device_grants (device, holders) VALUES (?1, ?2)
            ON CONFLICT(device) DO UPDATE SET holders = excluded.holders
            "#,
            params![
                device,
                serde_json::to_string(&encoded).map_err(|e| StoreError::Backend(e.to_string()))?
            ],
        )?;
        Ok(())
    }

    fn load_grants(&self) -> Result<HashMap<String, BTreeSet<InstanceId>>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT device, holders FROM device_grants")?;

        let mut grants = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (device, holders) = row?;
            let decoded: Vec<String> =
                serde_json::from_str(&holders).map_err(|e| StoreError::Backend(e.to_string()))?;
            let set: BTreeSet<InstanceId> = decoded
                .iter()
                .filter_map(|s| InstanceId::parse(s).ok())
                .collect();
            grants.insert(device, set);
        }

        Ok(grants)
    }

    fn save_env_override(
        &self,
        ident: &InstanceIdent,
        vars: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO env_overrides (service_id, subject_id, instance_index, vars)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(service_id, subject_id, instance_index)
                DO UPDATE SET vars = excluded.vars
            "#,
            params![
                ident.service_id.as_str(),
                ident.subject_id.as_str(),
                ident.instance_index as i64,
                serde_json::to_string(vars).map_err(|e| StoreError::Backend(e.to_string()))?
            ],
        )?;
        Ok(())
    }

    fn env_override(
        &self,
        ident: &InstanceIdent,
    ) -> Result<HashMap<String, String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let vars: Option<String> = conn
            .query_row(
                "SELECT vars FROM env_overrides
                 WHERE service_id = ?1 AND subject_id = ?2 AND instance_index = ?3",
                params![
                    ident.service_id.as_str(),
                    ident.subject_id.as_str(),
                    ident.instance_index as i64
                ],
                |row| row.get(0),
            )
            .optional()?;

        match vars {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| StoreError::Backend(e.to_string()))
            }
            None => Ok(HashMap::new()),
        }
    }

    fn remove_env_override(&self, ident: &InstanceIdent) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM env_overrides
             WHERE service_id = ?1 AND subject_id = ?2 AND instance_index = ?3",
            params![
                ident.service_id.as_str(),
                ident.subject_id.as_str(),
                ident.instance_index as i64
            ],
        )?;
        Ok(())
    }

    fn save_state_ack(&self, ack: &StateAck) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO state_acks (instance_id, accepted, reason) VALUES (?1, ?2, ?3)
            ON CONFLICT(instance_id) DO UPDATE SET
                accepted = excluded.accepted,
                reason = excluded.reason
            "#,
            params![
                ack.instance_id.to_string(),
                ack.accepted as i64,
                ack.reason
            ],
        )?;
        Ok(())
    }

    fn state_ack(&self, instance_id: &InstanceId) -> Result<StateAck, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT accepted, reason FROM state_acks WHERE instance_id = ?1",
            params![instance_id.to_string()],
            |row| {
                Ok(StateAck {
                    instance_id: *instance_id,
                    accepted: row.get::<_, i64>(0)? != 0,
                    reason: row.get(1)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotExist(format!("state ack {instance_id}")))
    }

    fn allocate_uid(&self) -> Result<u32, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO counters (name, value) VALUES ('uid', ?1)
            ON CONFLICT(name) DO UPDATE SET value = value + 1
            "#,
            params![UID_BASE as i64],
        )?;

        let value: i64 =
            conn.query_row("SELECT value FROM counters WHERE name = 'uid'", [], |row| {
                row.get(0)
            })?;
        Ok(value as u32)
    }
}
