//! Admission control for shared host devices.
//!
//! Services declare the devices they need by name; the node's declaration
//! file maps each name to concrete host device paths, supplementary groups,
//! and a sharing limit. The broker validates the declarations against the
//! host once at boot and then gates every grant against the limit.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use axle_id::InstanceId;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// A declared host device resource. Immutable for the lifetime of the boot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResource {
    pub name: String,
    /// Maximum concurrent holders; 0 means unlimited.
    #[serde(default)]
    pub shared_count: u32,
    #[serde(default)]
    pub groups: Vec<String>,
    pub host_devices: Vec<String>,
}

/// Top-level shape of the declaration file.
#[derive(Debug, Deserialize)]
struct DeclarationFile {
    devices: Vec<DeviceResource>,
}

/// One problem found while validating declarations against the host.
#[derive(Debug, Clone)]
pub struct DeviceProblem {
    pub device: String,
    pub reason: String,
}

/// Errors from the broker.
#[derive(Debug, Error, Clone)]
pub enum DeviceError {
    /// No declaration file was loaded; every request is refused.
    #[error("device resources are not provided")]
    ResourcesNotProvided,

    /// The requested name is not declared.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The sharing limit is exhausted.
    #[error("device {0} is unavailable")]
    Unavailable(String),

    /// Release of a device the instance does not hold.
    #[error("device {device} was not granted to {instance}")]
    NotGranted { device: String, instance: String },

    /// Declarations do not match the host. Grouped by device name.
    #[error("invalid device declarations: {}", format_problems(.0))]
    Invalid(Vec<DeviceProblem>),

    /// The declaration file could not be read or parsed.
    #[error("device declaration file: {0}")]
    Declaration(String),
}

fn format_problems(problems: &[DeviceProblem]) -> String {
    let mut by_device: HashMap<&str, Vec<&str>> = HashMap::new();
    for p in problems {
        by_device.entry(&p.device).or_default().push(&p.reason);
    }

    let mut parts: Vec<String> = by_device
        .into_iter()
        .map(|(device, reasons)| format!("{device}: [{}]", reasons.join(", ")))
        .collect();
    parts.sort();
    parts.join("; ")
}

/// What the host actually has: device nodes and group names.
#[derive(Debug, Clone, Default)]
pub struct HostInventory {
    pub devices: Vec<String>,
    pub groups: Vec<String>,
}

impl HostInventory {
    /// Discovers the real host inventory: every node under `/dev` and every
    /// group in `/etc/group`.
    pub fn discover() -> std::io::Result<Self> {
        let mut devices = Vec::new();
        collect_dev_entries(Path::new("/dev"), &mut devices)?;

        let groups = std::fs::read_to_string("/etc/group")?
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| line.split(':').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self { devices, groups })
    }
}

fn collect_dev_entries(dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        out.push(path.to_string_lossy().to_string());
        if entry.file_type()?.is_dir() {
            // Subtrees like /dev/input or /dev/snd hold the actual nodes.
            if let Err(e) = collect_dev_entries(&path, out) {
                debug!(path = %path.display(), error = %e, "skipping unreadable dev subtree");
            }
        }
    }
    Ok(())
}

/// The admission controller.
pub struct DeviceBroker {
    inner: Mutex<BrokerInner>,
}

struct BrokerInner {
    declared: HashMap<String, DeviceResource>,
    grants: HashMap<String, BTreeSet<InstanceId>>,
    host: HostInventory,
    /// Cached verdict from the first `validate` call.
    verdict: Option<Result<(), DeviceError>>,
}

impl DeviceBroker {
    /// Builds a broker from declarations already in memory.
    pub fn new(declarations: Vec<DeviceResource>, host: HostInventory) -> Self {
        let declared = declarations
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        Self {
            inner: Mutex::new(BrokerInner {
                declared,
                grants: HashMap::new(),
                host,
                verdict: None,
            }),
        }
    }

    /// Loads the declaration file and discovers the host inventory.
    pub fn load(path: &Path) -> Result<Self, DeviceError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::Declaration(format!("{}: {e}", path.display())))?;
        let file: DeclarationFile = serde_json::from_str(&raw)
            .map_err(|e| DeviceError::Declaration(format!("{}: {e}", path.display())))?;

        let host = HostInventory::discover()
            .map_err(|e| DeviceError::Declaration(format!("host discovery: {e}")))?;

        Ok(Self::new(file.devices, host))
    }

    /// Checks every declared host device and group against the host.
    ///
    /// The verdict is computed once and cached; subsequent calls return the
    /// cached result.
    pub fn validate(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(verdict) = &inner.verdict {
            return verdict.clone();
        }

        let mut problems = Vec::new();

        for device in inner.declared.values() {
            for host_device in &device.host_devices {
                if !inner.host.devices.iter().any(|d| d == host_device) {
                    problems.push(DeviceProblem {
                        device: device.name.clone(),
                        reason: format!("host device {host_device} not present"),
                    });
                }
            }

            for group in &device.groups {
                if !inner.host.groups.iter().any(|g| g == group) {
                    problems.push(DeviceProblem {
                        device: device.name.clone(),
                        reason: format!("group {group} not present"),
                    });
                }
            }
        }

        let verdict = if problems.is_empty() {
            Ok(())
        } else {
            Err(DeviceError::Invalid(problems))
        };

        inner.verdict = Some(verdict.clone());
        verdict
    }

    /// Returns the declared resource for `name`.
    pub fn lookup(&self, name: &str) -> Result<DeviceResource, DeviceError> {
        let inner = self.inner.lock().unwrap();
        inner
            .declared
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownDevice(name.to_string()))
    }

    /// Grants `name` to `instance_id`, subject to the sharing limit.
    ///
    /// Re-requesting a device already held is a warning-level no-op.
    pub fn request(&self, name: &str, instance_id: InstanceId) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.declared.is_empty() {
            return Err(DeviceError::ResourcesNotProvided);
        }

        let device = inner
            .declared
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownDevice(name.to_string()))?;

        let holders = inner.grants.entry(name.to_string()).or_default();

        if holders.contains(&instance_id) {
            warn!(device = name, instance = %instance_id, "device already granted");
            return Ok(());
        }

        if device.shared_count > 0 && holders.len() as u32 >= device.shared_count {
            return Err(DeviceError::Unavailable(name.to_string()));
        }

        debug!(device = name, instance = %instance_id, "granting device");
        holders.insert(instance_id);
        Ok(())
    }

    /// Releases `name` held by `instance_id`.
    pub fn release(&self, name: &str, instance_id: InstanceId) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.declared.is_empty() {
            return Err(DeviceError::ResourcesNotProvided);
        }

        if !inner.declared.contains_key(name) {
            return Err(DeviceError::UnknownDevice(name.to_string()));
        }

        let holders = inner.grants.entry(name.to_string()).or_default();
        if !holders.remove(&instance_id) {
            return Err(DeviceError::NotGranted {
                device: name.to_string(),
                instance: instance_id.to_string(),
            });
        }

        debug!(device = name, instance = %instance_id, "released device");
        Ok(())
    }

    /// Releases every device held by `instance_id`. Returns the names of
    /// the devices that were released.
    pub fn release_all(&self, instance_id: InstanceId) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let mut released = Vec::new();

        for (name, holders) in inner.grants.iter_mut() {
            if holders.remove(&instance_id) {
                released.push(name.clone());
            }
        }

        released
    }

    /// Snapshot of the current holders of `name`.
    pub fn grants(&self, name: &str) -> BTreeSet<InstanceId> {
        self.inner
            .lock()
            .unwrap()
            .grants
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of all grants, for persistence.
    pub fn all_grants(&self) -> HashMap<String, BTreeSet<InstanceId>> {
        let inner = self.inner.lock().unwrap();
        inner
            .grants
            .iter()
            .filter(|(_, holders)| !holders.is_empty())
            .map(|(name, holders)| (name.clone(), holders.clone()))
            .collect()
    }

    /// Restores grants persisted from a previous run. Holders of unknown
    /// devices are dropped.
    pub fn restore_grants(&self, grants: HashMap<String, BTreeSet<InstanceId>>) {
        let mut inner = self.inner.lock().unwrap();
        for (name, holders) in grants {
            if inner.declared.contains_key(&name) {
                inner.grants.insert(name, holders);
            } else {
                warn!(device = %name, "dropping persisted grants for undeclared device");
            }
        }
    }
}
