//! Routing table view (`GET /routes`)

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

use super::json_response;
use crate::routing::SharedTable;

pub fn routing_table(table: &SharedTable) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &table.load().view())
}
