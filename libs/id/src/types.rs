//! Identifier definitions for the service manager.

use serde::{Deserialize, Serialize};

use crate::{define_cloud_id, define_id};

// Node-assigned IDs. New prefixes must also be added to
// `NODE_ID_PREFIXES` in macros.rs.

define_id!(
    /// Identity of an installed service instance. Minted on first install,
    /// stable across restarts, never reused even after removal. Doubles as
    /// the supervisor unit name stem.
    InstanceId => "inst"
);

define_id!(
    /// Identity of the node itself, minted at provisioning.
    NodeId => "node"
);

// Cloud-assigned IDs.

define_cloud_id!(ServiceId, "service");
define_cloud_id!(SubjectId, "subject");

/// The logical address of a service instance: which service, for which
/// subject, and which replica index. Unique across the node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceIdent {
    pub service_id: ServiceId,
    pub subject_id: SubjectId,
    pub instance_index: u32,
}

impl InstanceIdent {
    pub fn new(service_id: ServiceId, subject_id: SubjectId, instance_index: u32) -> Self {
        Self {
            service_id,
            subject_id,
            instance_index,
        }
    }
}

impl std::fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.service_id, self.subject_id, self.instance_index
        )
    }
}
