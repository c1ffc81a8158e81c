//! Controller surface — structured actions under `/api/people`.

use crate::routing::QueryRequest;
use crate::service::QueryService;
use crate::types::{ServerError, ServerResult};
use httpquery::ResponseEnvelope;
use std::sync::Arc;

/// Answers queries against the people dataset, tagging responses with its
/// source name.
pub struct PeopleController {
    service: Arc<QueryService>,
}

impl PeopleController {
    pub const SOURCE: &'static str = "controller";

    pub fn new(service: Arc<QueryService>) -> Self {
        Self { service }
    }

    /// `QUERY /api/people`
    pub fn index(&self, request: QueryRequest) -> ServerResult<ResponseEnvelope> {
        let size = self.service.dataset_size();
        Ok(self.service.run(request.query, Some(Self::SOURCE), size))
    }

    /// `QUERY /api/people/{count}`: same as `index` over `count` records.
    pub fn sized(&self, request: QueryRequest) -> ServerResult<ResponseEnvelope> {
        let raw = request.param("count").unwrap_or_default();
        let size: usize = raw
            .parse()
            .map_err(|_| ServerError::InvalidDatasetSize(format!("{raw:?} is not a count")))?;
        let max = self.service.max_dataset_size();
        if size > max {
            return Err(ServerError::InvalidDatasetSize(format!(
                "{size} exceeds the maximum of {max}"
            )));
        }
        Ok(self.service.run(request.query, Some(Self::SOURCE), size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use httpquery::Query;

    fn controller() -> PeopleController {
        PeopleController::new(Arc::new(QueryService::new(&ServerConfig::default())))
    }

    fn with_count(text: &str, count: &str) -> QueryRequest {
        let mut request = QueryRequest::new(Query::from_text(text));
        request.params.insert("count".to_string(), count.to_string());
        request
    }

    #[test]
    fn test_index_tags_source() {
        let envelope = controller()
            .index(QueryRequest::new(Query::from_text("people.Count()")))
            .unwrap();
        let body = serde_json::to_value(&envelope).unwrap();
        assert_eq!(body["source"], "controller");
        assert_eq!(body["results"], 100);
    }

    #[test]
    fn test_sized_overrides_dataset() {
        let envelope = controller().sized(with_count("people.Count()", "5")).unwrap();
        assert_eq!(serde_json::to_value(&envelope).unwrap()["results"], 5);
    }

    #[test]
    fn test_sized_rejects_bad_counts() {
        assert!(controller().sized(with_count("people", "five")).is_err());
        assert!(controller().sized(with_count("people", "-1")).is_err());
        assert!(controller().sized(with_count("people", "1000000")).is_err());
    }
}
