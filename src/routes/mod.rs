//! HTTP route handlers for the registry and management listener

pub mod health;
pub mod registry;
pub mod table;

pub use health::{health_check, readiness_check, version_info};
pub use registry::{
    deregister_instance, list_services, register_instance, renew_lease, service_instances,
    update_status,
};
pub use table::routing_table;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::{GatewayError, Result};

/// Largest management request body accepted
const MAX_API_BODY_BYTES: usize = 64 * 1024;

/// Serialize `value` as a JSON response
pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => GatewayError::Internal(format!("Serialization failed: {}", e)).to_response(""),
    }
}

/// Read and parse a JSON request body
pub(crate) async fn read_json<T, B>(req: Request<B>) -> Result<T>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = Limited::new(req.into_body(), MAX_API_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                GatewayError::PayloadTooLarge(format!("body exceeds {} bytes", MAX_API_BODY_BYTES))
            } else {
                GatewayError::BadRequest(format!("Failed to read body: {}", e))
            }
        })?
        .to_bytes();

    Ok(serde_json::from_slice(&body)?)
}
