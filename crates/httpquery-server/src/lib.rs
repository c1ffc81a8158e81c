//! HttpQuery server — answers query expressions sent with the `QUERY` verb.

pub mod cache;
pub mod config;
pub mod extract;
pub mod routing;
pub mod service;
pub mod surfaces;
pub mod transport;
pub mod types;

pub use config::{ConfigOverrides, ServerConfig};
pub use routing::{QueryRoutes, QUERY_METHOD};
pub use service::QueryService;
pub use transport::HttpTransport;
pub use types::{ServerError, ServerResult};
