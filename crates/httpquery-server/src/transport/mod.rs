//! Transport layer for query clients.

pub mod http;
pub mod relay;

pub use http::{router, AppState, HttpTransport};
