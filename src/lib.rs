pub mod backend;
pub mod config;
pub mod error;
pub mod model;
pub mod openstack;
pub mod orchestrator;
pub mod scheduler;
pub mod store;

pub use backend::{BackendDriver, CloudDriver, ClusterDriver};
pub use config::Config;
pub use orchestrator::{DeleteOutcome, SliceDocuments, SliceOrchestrator};
pub use scheduler::PlacementScheduler;
pub use store::{MemoryStore, PgStore, ResourceStore};
