//! Health check endpoints
//!
//! Provides Kubernetes-style health probes:
//! - /health, /healthz - Liveness probe (is the gateway running?)
//! - /ready, /readyz - Readiness probe (does every route have an instance?)
//!
//! Liveness always returns 200. Readiness returns 503 while any configured
//! route has no `UP` instance, so an outer load balancer can hold traffic
//! until backends have registered.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::server::AppState;

/// Liveness and readiness body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always true while the process serves requests
    pub healthy: bool,
    /// `online` when every route is served, `degraded` otherwise
    pub status: &'static str,
    pub version: &'static str,
    /// Seconds since the gateway started
    pub uptime: u64,
    pub timestamp: String,
    pub node_id: String,
    pub registry: RegistryHealth,
    pub routing: RoutingHealth,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryHealth {
    pub services: usize,
    /// Records held, including lapsed ones not yet swept
    pub instances: usize,
    pub lease_duration_secs: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingHealth {
    pub routes: usize,
    /// Routes with no `UP` instance
    pub unserved: Vec<String>,
    pub generation: u64,
    pub policy: String,
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let table = state.table.load();
    let unserved: Vec<String> = table
        .entries()
        .iter()
        .filter(|entry| entry.instances.is_empty())
        .map(|entry| entry.route.prefix.clone())
        .collect();

    HealthResponse {
        healthy: true,
        status: if unserved.is_empty() { "online" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        node_id: state.args.node_id.to_string(),
        registry: RegistryHealth {
            services: state.registry.all_services().len(),
            instances: state.registry.instance_count(),
            lease_duration_secs: state.args.lease_duration_secs,
        },
        routing: RoutingHealth {
            routes: table.entries().len(),
            unserved,
            generation: table.generation(),
            policy: state.args.lb_policy.to_string(),
        },
    }
}

/// Handle liveness probe (/health, /healthz)
pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &build_health_response(state))
}

/// Handle readiness probe (/ready, /readyz)
pub fn readiness_check(state: &AppState) -> Response<Full<Bytes>> {
    let response = build_health_response(state);
    let status = if response.routing.unserved.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &response)
}

/// Version information for deployment verification
#[derive(Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    /// Git commit hash (short)
    pub commit: &'static str,
    /// Git commit hash (full)
    pub commit_full: &'static str,
    pub build_time: &'static str,
    pub service: &'static str,
}

/// Handle version endpoint (/version)
pub fn version_info() -> Response<Full<Bytes>> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "smartrent-gateway",
    };
    json_response(StatusCode::OK, &response)
}
