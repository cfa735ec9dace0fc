//! Header handling for forwarded requests and relayed responses

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use hyper::{Method, StatusCode};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Connection-scoped headers never forwarded in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

/// Copy `headers` minus hop-by-hop headers and any header named in `Connection`
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let named: HashSet<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || named.contains(lower) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Headers for an upstream request
///
/// `Host` is dropped so the client sets it to the backend authority.
pub fn forward_request_headers(
    inbound: &HeaderMap,
    client_addr: Option<SocketAddr>,
    stripped_prefix: Option<&str>,
) -> HeaderMap {
    let mut headers = strip_hop_by_hop(inbound);
    headers.remove(HOST);
    // Length is recomputed from the buffered body
    headers.remove(CONTENT_LENGTH);

    if let Some(addr) = client_addr {
        let client_ip = addr.ip().to_string();
        let forwarded_for = match inbound
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
        {
            Some(existing) if !existing.trim().is_empty() => {
                format!("{}, {}", existing.trim(), client_ip)
            }
            _ => client_ip,
        };
        insert(&mut headers, X_FORWARDED_FOR, &forwarded_for);
    }

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = inbound.get(HOST).and_then(|value| value.to_str().ok()) {
            insert(&mut headers, X_FORWARDED_HOST, host);
        }
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        insert(&mut headers, X_FORWARDED_PROTO, "http");
    }

    if let Some(prefix) = stripped_prefix {
        insert(&mut headers, X_FORWARDED_PREFIX, prefix);
    }

    headers
}

/// Headers for a relayed response
///
/// HEAD and 304 responses carry no body, so their upstream `Content-Length`
/// describes the representation and is kept as sent.
pub fn relay_response_headers(upstream: &HeaderMap, method: &Method, status: StatusCode) -> HeaderMap {
    let mut headers = strip_hop_by_hop(upstream);
    if *method != Method::HEAD && status != StatusCode::NOT_MODIFIED {
        // hyper sets the length of the buffered body
        headers.remove(CONTENT_LENGTH);
    }
    headers
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
