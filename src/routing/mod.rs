//! Route definitions and the routing table

pub mod builder;
pub mod route;
pub mod table;

pub use builder::{SharedTable, TableBuilder};
pub use route::{normalize_prefix, resolve_routes, Route, RouteConfig, RouteDefaults, RoutesFile};
pub use table::{RouteEntry, RoutingTable, RoutingTableView};
