//! Minimal surface — a plain function over the query text.

use crate::service::QueryService;
use httpquery::{Query, ResponseEnvelope};
use std::sync::Arc;

/// Handler for `QUERY /people`. Responses carry no `source`.
pub fn people(service: Arc<QueryService>) -> impl Fn(Query) -> ResponseEnvelope + Send + Sync {
    move |query| {
        let size = service.dataset_size();
        service.run(query, None, size)
    }
}
