//! Service instance records and registration wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::GatewayError;

/// Health status reported by (or assigned to) an instance
///
/// Only `Up` instances are offered to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Up,
    Starting,
    Down,
    OutOfService,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Starting => "STARTING",
            Self::Down => "DOWN",
            Self::OutOfService => "OUT_OF_SERVICE",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UP" => Ok(Self::Up),
            "STARTING" => Ok(Self::Starting),
            "DOWN" => Ok(Self::Down),
            "OUT_OF_SERVICE" => Ok(Self::OutOfService),
            other => Err(GatewayError::BadRequest(format!(
                "Unknown instance status: {}",
                other
            ))),
        }
    }
}

/// Registration request sent by a backend instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub service_name: String,
    /// Defaults to `{host}:{service}:{port}` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl Registration {
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: None,
            host: host.into(),
            port,
            status: InstanceStatus::Up,
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Service name as keyed by the registry (case-insensitive)
    pub fn service_key(&self) -> String {
        normalize_service_name(&self.service_name)
    }

    /// Explicit instance id, or the `{host}:{service}:{port}` default
    pub fn resolved_instance_id(&self) -> String {
        match self.instance_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("{}:{}:{}", self.host.trim(), self.service_key(), self.port),
        }
    }

    /// Reject registrations that could never be routed to
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.service_name.trim().is_empty() {
            return Err(GatewayError::BadRequest("serviceName must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(GatewayError::BadRequest("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(GatewayError::BadRequest("port must be non-zero".into()));
        }
        Ok(())
    }
}

/// A registered backend instance as seen by the registry and router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub registered_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }

    /// Key unique across services, used for connection accounting
    pub fn key(&self) -> String {
        format!("{}/{}", self.service_name, self.instance_id)
    }
}

/// Lease granted on register and renew
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub service_name: String,
    pub instance_id: String,
    pub duration_ms: u64,
    pub expires_at: DateTime<Utc>,
}

/// Lower-case, trimmed service name
pub fn normalize_service_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
