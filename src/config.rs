//! Configuration for the SmartRent gateway
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::proxy::{BalancingPolicy, DEFAULT_MAX_BODY_BYTES};
use crate::registry::MonitorConfig;
use crate::routing::{resolve_routes, Route, RouteConfig, RouteDefaults, RoutesFile};
use crate::types::Result;

/// SmartRent gateway - service registry and load-balanced edge proxy
#[derive(Parser, Debug, Clone)]
#[command(name = "smartrent-gateway")]
#[command(about = "Service registry and load-balanced edge gateway for SmartRent services")]
pub struct Args {
    /// Unique node identifier for this gateway instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address the proxy ingress listens on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Address the registry and management API listens on
    #[arg(long, env = "REGISTRY_LISTEN", default_value = "0.0.0.0:8761")]
    pub registry_listen: SocketAddr,

    /// Lease granted to instances on register and renew
    #[arg(long, env = "LEASE_DURATION_SECS", default_value = "90")]
    pub lease_duration_secs: u64,

    /// Interval between heartbeat sweeps
    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value = "5000")]
    pub sweep_interval_ms: u64,

    /// Interval between periodic routing table rebuilds
    #[arg(long, env = "REBUILD_INTERVAL_MS", default_value = "5000")]
    pub rebuild_interval_ms: u64,

    /// Skip a sweep's evictions when more than this fraction of instances
    /// would be evicted at once (disabled when unset)
    #[arg(long, env = "SELF_PRESERVATION_THRESHOLD")]
    pub self_preservation_threshold: Option<f64>,

    /// Load balancing policy
    #[arg(long, env = "LB_POLICY", value_enum, default_value_t = BalancingPolicy::RoundRobin)]
    pub lb_policy: BalancingPolicy,

    /// TOML file with `[[routes]]` entries
    #[arg(long, env = "ROUTES_FILE")]
    pub routes_file: Option<PathBuf>,

    /// Inline route as prefix=service (repeatable; ROUTES is comma-separated)
    #[arg(long = "route", env = "ROUTES", value_delimiter = ',')]
    pub routes: Vec<String>,

    /// Default per-attempt upstream timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// Default extra attempts after a failed forward
    #[arg(long, env = "DEFAULT_RETRIES", default_value = "1")]
    pub default_retries: u32,

    /// Maximum inbound request body size
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

impl Args {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_millis(self.rebuild_interval_ms)
    }

    /// Upper bound on how long a silent instance stays routable
    pub fn staleness_bound(&self) -> Duration {
        self.lease_duration() + self.sweep_interval().min(self.rebuild_interval())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            sweep_interval: self.sweep_interval(),
            self_preservation_threshold: self.self_preservation_threshold,
        }
    }

    pub fn route_defaults(&self) -> RouteDefaults {
        RouteDefaults {
            timeout: Duration::from_millis(self.request_timeout_ms),
            retries: self.default_retries,
        }
    }

    /// Routes from the routes file followed by inline routes
    pub fn load_routes(&self) -> Result<Vec<Route>> {
        let mut configs = match &self.routes_file {
            Some(path) => RoutesFile::load(path)?.routes,
            None => Vec::new(),
        };

        for inline in self.routes.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            configs.push(RouteConfig::parse_inline(inline)?);
        }

        resolve_routes(&configs, self.route_defaults())
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.lease_duration_secs == 0 {
            return Err("LEASE_DURATION_SECS must be greater than zero".to_string());
        }
        if self.sweep_interval_ms == 0 {
            return Err("SWEEP_INTERVAL_MS must be greater than zero".to_string());
        }
        if self.rebuild_interval_ms == 0 {
            return Err("REBUILD_INTERVAL_MS must be greater than zero".to_string());
        }
        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }
        if let Some(threshold) = self.self_preservation_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err("SELF_PRESERVATION_THRESHOLD must be in (0, 1]".to_string());
            }
        }
        if self.max_body_bytes == 0 {
            return Err("MAX_BODY_BYTES must be greater than zero".to_string());
        }
        Ok(())
    }
}
