//! HTTP listeners

pub mod http;

pub use http::{run, AppState, Gateway};
