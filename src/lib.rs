//! SmartRent gateway - service registry and load-balanced edge proxy
//!
//! Backend services register their instances with the gateway and keep them
//! alive with heartbeats. The gateway routes public requests by path prefix
//! to a healthy instance of the target service.
//!
//! ## Components
//!
//! - **Registry**: in-memory directory of instances with lease expiry
//! - **Heartbeat monitor**: periodic sweep evicting lapsed instances
//! - **Routing table builder**: prefix → instance set, published atomically
//! - **Proxy**: load-balanced forwarding with per-attempt timeouts and retries
//! - **Registration client**: the instance-side half of the protocol
//!
//! The user service's password encoder and the shared domain payload checks
//! live in [`auth`] and [`domain`].

pub mod auth;
pub mod client;
pub mod config;
pub mod domain;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod routing;
pub mod server;
pub mod types;

pub use config::Args;
pub use server::{run, AppState, Gateway};
pub use types::{GatewayError, Result};
