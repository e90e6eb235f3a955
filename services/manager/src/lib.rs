//! Axle Service Manager
//!
//! Runs on each edge node and manages the lifecycle of cloud-defined
//! service instances. The cloud pushes a desired instance set; the manager
//! converges the node to match it by installing service images as
//! supervisor units, admitting shared host devices, and starting/stopping
//! instances through the host init daemon.
//!
//! ## Architecture
//!
//! ```text
//! ServiceManager (engine)
//! ├── ActionQueue        per-instance FIFO over a bounded worker pool
//! ├── Reconciler         desired-vs-actual plan computation
//! ├── Runner             debounces raw unit transitions into stable state
//! ├── DeviceBroker       admission control for shared host devices
//! ├── Model              in-memory tables, write-through to storage
//! └── UnitSupervisor     systemd adapter (mock for tests)
//! ```
//!
//! ## Modules
//!
//! - `engine`: action execution and the inbound API
//! - `queue`: per-key serialized action queue
//! - `runner`: start/stop bridge and status debouncing
//! - `reconciler`: plan computation
//! - `devices`: device resource broker
//! - `supervisor`: host supervisor adapter
//! - `state`: storage contract and SQLite implementation

pub mod config;
pub mod devices;
pub mod engine;
pub mod model;
pub mod queue;
pub mod reconciler;
pub mod runner;
pub mod state;
pub mod supervisor;

// Re-export commonly used types
pub use config::Config;
pub use devices::{DeviceBroker, DeviceResource, HostInventory};
pub use engine::{ActionError, InstanceOutcome, ServiceManager};
pub use model::{DesiredInstance, InstanceState, InstanceStatus, Principal, ServiceDescriptor};
pub use runner::Runner;
pub use state::{SqliteStore, Storage};
pub use supervisor::{MockSupervisor, SystemdSupervisor, UnitSupervisor};
