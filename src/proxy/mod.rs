//! Load-balanced reverse proxy

pub mod balancer;
pub mod forward;
pub mod headers;

pub use balancer::{BalancingPolicy, ConnectionGuard, LoadBalancer};
pub use forward::{Proxy, RequestState, RoutingDecision, DEFAULT_MAX_BODY_BYTES};
