//! Registration protocol endpoints
//!
//! - `POST   /registry/instances`
//! - `PUT    /registry/instances/{service}/{id}/heartbeat`
//! - `PUT    /registry/instances/{service}/{id}/status?value=STATUS`
//! - `DELETE /registry/instances/{service}/{id}`
//! - `GET    /registry/services`
//! - `GET    /registry/services/{service}`

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{json_response, read_json};
use crate::registry::{InstanceRegistry, InstanceStatus, Registration};
use crate::types::{GatewayError, Result};

/// Per-service summary for `GET /registry/services`
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSummary {
    pub name: String,
    /// Routable instances
    pub up: usize,
    /// Unexpired instances of any status
    pub total: usize,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    value: String,
}

pub async fn register_instance<B>(
    registry: &InstanceRegistry,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let registration: Registration = read_json(req).await?;
    let lease = registry.register(registration)?;
    Ok(json_response(StatusCode::OK, &lease))
}

pub fn renew_lease(
    registry: &InstanceRegistry,
    service: &str,
    instance_id: &str,
) -> Result<Response<Full<Bytes>>> {
    let lease = registry.renew(service, instance_id)?;
    Ok(json_response(StatusCode::OK, &lease))
}

pub fn update_status(
    registry: &InstanceRegistry,
    service: &str,
    instance_id: &str,
    query: Option<&str>,
) -> Result<Response<Full<Bytes>>> {
    let query: StatusQuery = serde_urlencoded::from_str(query.unwrap_or(""))
        .map_err(|_| GatewayError::BadRequest("missing status query parameter 'value'".into()))?;
    let status: InstanceStatus = query.value.parse()?;

    registry.update_status(service, instance_id, status)?;
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({
            "serviceName": service.to_ascii_lowercase(),
            "instanceId": instance_id,
            "status": status,
        }),
    ))
}

pub fn deregister_instance(
    registry: &InstanceRegistry,
    service: &str,
    instance_id: &str,
) -> Result<Response<Full<Bytes>>> {
    let removed = registry.deregister(service, instance_id)?;
    Ok(json_response(StatusCode::OK, &removed))
}

pub fn list_services(registry: &InstanceRegistry) -> Response<Full<Bytes>> {
    let summaries: Vec<ServiceSummary> = registry
        .all_services()
        .into_iter()
        .map(|name| ServiceSummary {
            up: registry.snapshot(&name).len(),
            total: registry.instances(&name).len(),
            name,
        })
        .collect();
    json_response(StatusCode::OK, &summaries)
}

pub fn service_instances(registry: &InstanceRegistry, service: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &registry.snapshot(service))
}
