//! # axle-id
//!
//! Typed identifiers for the axle service manager.
//!
//! Two families of IDs live here:
//!
//! - **Node-assigned IDs** (`InstanceId`): prefixed ULIDs minted by the
//!   service manager. They are stable across restarts, sortable by creation
//!   time, and never reused even after the owning entity is removed.
//! - **Cloud-assigned IDs** (`ServiceId`, `SubjectId`): opaque strings handed
//!   down in desired-state messages. They are validated on construction but
//!   their content is owned by the cloud.
//!
//! Node-assigned IDs use the canonical form `{prefix}_{ulid}`, e.g.
//! `inst_01J1N9PCD3V1KQ1T6W93FJ7Q0R`. The prefix makes an ID self-describing
//! in logs and in the supervisor unit names derived from it.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::{parse_prefixed, NODE_ID_PREFIXES};
pub use types::*;

pub use ulid::Ulid;
