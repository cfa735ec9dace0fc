//! Request forwarding with retries
//!
//! Each inbound request is resolved against the current routing table,
//! assigned an instance by the load balancer and forwarded with a
//! per-attempt deadline. Transport failures and timeouts are retried on
//! another instance; upstream error statuses are relayed as they are.
//!
//! ## Request lifecycle
//!
//! ```text
//! Received → Matched → InstanceSelected → Forwarding → Succeeded
//!                             ↑                ↓
//!                             └─── Retrying ←──┴──→ Failed
//! ```

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::balancer::LoadBalancer;
use super::headers::{forward_request_headers, relay_response_headers};
use crate::registry::ServiceInstance;
use crate::routing::{Route, SharedTable};
use crate::types::{GatewayError, Result};

/// Default inbound body limit
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Lifecycle states of a proxied request, used in traces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Matched,
    InstanceSelected,
    Forwarding,
    Retrying,
    Succeeded,
    Failed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Matched => "matched",
            Self::InstanceSelected => "instance_selected",
            Self::Forwarding => "forwarding",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Route and instance chosen for one forward attempt
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub route: Arc<Route>,
    pub instance: ServiceInstance,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Parts of the inbound request shared by every attempt
struct Outbound {
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    body: Bytes,
}

/// Load-balanced reverse proxy
pub struct Proxy {
    table: SharedTable,
    balancer: Arc<LoadBalancer>,
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl Proxy {
    pub fn new(table: SharedTable, balancer: Arc<LoadBalancer>, max_body_bytes: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            table,
            balancer,
            client,
            max_body_bytes,
        })
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Serve one inbound request, turning gateway failures into JSON errors
    pub async fn handle<B>(&self, req: Request<B>, client_addr: Option<SocketAddr>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();
        debug!(state = %RequestState::Received, method = %req.method(), path = %path, "Proxy request");

        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                let err = GatewayError::PayloadTooLarge(format!(
                    "request body exceeds {} bytes",
                    self.max_body_bytes
                ));
                return err.to_response(&path);
            }
            Err(e) => {
                return GatewayError::BadRequest(format!("Failed to read body: {}", e)).to_response(&path);
            }
        };

        match self.dispatch(Request::from_parts(parts, body), client_addr).await {
            Ok(response) => response,
            Err(err) => {
                debug!(state = %RequestState::Failed, path = %path, error = %err, "Proxy request failed");
                err.to_response(&path)
            }
        }
    }

    /// Route and forward a buffered request
    pub async fn dispatch(
        &self,
        req: Request<Bytes>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Full<Bytes>>> {
        let table = self.table.load_full();
        let path = req.uri().path().to_string();
        if has_dot_segment(&path) {
            return Err(GatewayError::BadRequest(format!(
                "Path must not contain dot segments: {}",
                path
            )));
        }

        let entry = table
            .resolve(&path)
            .ok_or_else(|| GatewayError::NoRouteFound(path.clone()))?;
        let route = &entry.route;
        debug!(state = %RequestState::Matched, path = %path, prefix = %route.prefix, service = %route.service, "Route matched");

        if entry.instances.is_empty() {
            return Err(GatewayError::NoHealthyInstance(route.service.clone()));
        }

        let upstream_path = route.upstream_path(&path);
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{}?{}", upstream_path, query),
            None => upstream_path,
        };
        let stripped_prefix = route.strips().then_some(route.prefix.as_str());

        let (parts, body) = req.into_parts();
        let outbound = Outbound {
            method: parts.method,
            path_and_query,
            headers: forward_request_headers(&parts.headers, client_addr, stripped_prefix),
            body,
        };

        let attempts = route.retries.saturating_add(1);
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error = None;
        let mut made = 0;

        for attempt in 1..=attempts {
            let instance = self
                .balancer
                .select(&route.service, &entry.instances, &tried)
                .ok_or_else(|| GatewayError::NoHealthyInstance(route.service.clone()))?;
            tried.insert(instance.instance_id.clone());
            made = attempt;

            let decision = RoutingDecision {
                route: Arc::clone(route),
                instance: instance.clone(),
                attempt,
            };
            debug!(
                state = %RequestState::InstanceSelected,
                service = %route.service,
                instance = %decision.instance.instance_id,
                attempt,
                "Instance selected"
            );

            match self.forward(&decision, &outbound).await {
                Ok(response) => {
                    debug!(
                        state = %RequestState::Succeeded,
                        instance = %decision.instance.instance_id,
                        status = response.status().as_u16(),
                        attempt,
                        "Upstream responded"
                    );
                    return Ok(response);
                }
                Err(err) => {
                    warn!(
                        service = %route.service,
                        instance = %decision.instance.instance_id,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Forward attempt failed"
                    );
                    let retryable = err.is_retryable();
                    last_error = Some(err);
                    if !retryable {
                        break;
                    }
                    if attempt < attempts {
                        debug!(state = %RequestState::Retrying, attempt, "Retrying on another instance");
                    }
                }
            }
        }

        let reason = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Err(GatewayError::UpstreamUnavailable(format!(
            "service {} failed after {} attempt(s): {}",
            route.service,
            made,
            reason
        )))
    }

    /// One attempt: send and read the full upstream response within the route timeout
    async fn forward(&self, decision: &RoutingDecision, outbound: &Outbound) -> Result<Response<Full<Bytes>>> {
        let url = format!("{}{}", decision.instance.base_url(), outbound.path_and_query);
        let _guard = self.balancer.acquire(&decision.instance);

        debug!(state = %RequestState::Forwarding, url = %url, attempt = decision.attempt, "Forwarding");

        let request = self
            .client
            .request(outbound.method.clone(), &url)
            .headers(outbound.headers.clone())
            .body(outbound.body.clone());

        let exchange = async {
            let upstream = request.send().await?;
            let status = upstream.status();
            let headers = relay_response_headers(upstream.headers(), &outbound.method, status);
            let body = upstream.bytes().await?;
            Ok::<_, GatewayError>((status, headers, body))
        };

        let timeout = decision.route.timeout;
        let (status, headers, body) = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| {
                GatewayError::UpstreamTimeout(format!(
                    "{} did not respond within {}ms",
                    decision.instance.authority(),
                    timeout.as_millis()
                ))
            })??;

        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Whether any segment of `path` is `.` or `..`, encoded or not
fn has_dot_segment(path: &str) -> bool {
    path.split('/').any(|segment| {
        let decoded = urlencoding::decode(segment).unwrap_or(std::borrow::Cow::Borrowed(segment));
        decoded == "." || decoded == ".."
    })
}
