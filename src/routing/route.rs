//! Static route definitions
//!
//! Routes are loaded once at startup from a TOML file and/or inline
//! `prefix=service` pairs. Prefixes are normalized so that `/users/**`,
//! `/users/*`, `/users/` and `/users` all name the same route.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::registry::normalize_service_name;
use crate::types::{GatewayError, Result};

/// Route entry as written in the routes file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub prefix: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_prefix: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl RouteConfig {
    pub fn new(prefix: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            service: service.into(),
            strip_prefix: None,
            timeout_ms: None,
            retries: None,
        }
    }

    /// Parse an inline `prefix=service` definition
    pub fn parse_inline(definition: &str) -> Result<Self> {
        let (prefix, service) = definition.split_once('=').ok_or_else(|| {
            GatewayError::Config(format!(
                "Invalid route '{}', expected prefix=service",
                definition
            ))
        })?;
        Ok(Self::new(prefix.trim(), service.trim()))
    }
}

/// Top-level layout of the routes file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutesFile {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl RoutesFile {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Cannot read routes file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }
}

/// Values applied to routes that do not set their own
#[derive(Debug, Clone, Copy)]
pub struct RouteDefaults {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 1,
        }
    }
}

/// A resolved route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Normalized prefix, always starting with `/` and never ending with one
    /// (except the root route `/`)
    pub prefix: String,
    /// Lower-cased target service name
    pub service: String,
    pub strip_prefix: bool,
    #[serde(serialize_with = "serialize_millis", rename = "timeout_ms")]
    pub timeout: Duration,
    pub retries: u32,
}

fn serialize_millis<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

impl Route {
    pub fn from_config(config: &RouteConfig, defaults: RouteDefaults) -> Result<Self> {
        let service = normalize_service_name(&config.service);
        if service.is_empty() {
            return Err(GatewayError::Config(format!(
                "Route '{}' has no target service",
                config.prefix
            )));
        }
        if config.timeout_ms == Some(0) {
            return Err(GatewayError::Config(format!(
                "Route '{}' has a zero timeout",
                config.prefix
            )));
        }

        Ok(Self {
            prefix: normalize_prefix(&config.prefix),
            service,
            strip_prefix: config.strip_prefix.unwrap_or(true),
            timeout: config
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            retries: config.retries.unwrap_or(defaults.retries),
        })
    }

    /// Whether `path` falls under this route
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path to send upstream for a matching inbound `path`
    pub fn upstream_path(&self, path: &str) -> String {
        if !self.strip_prefix || self.prefix == "/" {
            return path.to_string();
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some("") | None => "/".to_string(),
            Some(rest) => rest.to_string(),
        }
    }

    /// Whether forwarding `path` removes a non-empty prefix
    pub fn strips(&self) -> bool {
        self.strip_prefix && self.prefix != "/"
    }
}

/// Normalize a route prefix: leading `/`, no trailing `/`, `/*` or `/**`
pub fn normalize_prefix(prefix: &str) -> String {
    let mut trimmed = prefix.trim();
    loop {
        let next = trimmed
            .strip_suffix("/**")
            .or_else(|| trimmed.strip_suffix("/*"))
            .or_else(|| trimmed.strip_suffix('/'))
            .unwrap_or(trimmed);
        if next.len() == trimmed.len() {
            break;
        }
        trimmed = next;
    }

    let trimmed = trimmed.trim_start_matches('/');
    format!("/{}", trimmed)
}

/// Resolve route configs, rejecting duplicate prefixes
pub fn resolve_routes(configs: &[RouteConfig], defaults: RouteDefaults) -> Result<Vec<Route>> {
    let mut seen = HashSet::new();
    let mut routes = Vec::with_capacity(configs.len());

    for config in configs {
        let route = Route::from_config(config, defaults)?;
        if !seen.insert(route.prefix.clone()) {
            return Err(GatewayError::Config(format!(
                "Duplicate route prefix '{}'",
                route.prefix
            )));
        }
        routes.push(route);
    }

    Ok(routes)
}
