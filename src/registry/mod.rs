//! Service instance registry
//!
//! Backend instances register with a lease and keep it alive through
//! heartbeats. The [`HeartbeatMonitor`] sweeps instances whose lease lapsed.

pub mod instance;
pub mod monitor;
pub mod store;

pub use instance::{normalize_service_name, InstanceStatus, Lease, Registration, ServiceInstance};
pub use monitor::{HeartbeatMonitor, MonitorConfig, SweepReport};
pub use store::InstanceRegistry;
