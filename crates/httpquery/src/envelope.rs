//! Response envelopes — the JSON body returned for every query request.

use crate::query::Value;
use crate::types::{Query, QueryError, QueryResult};
use serde::Serialize;

/// Structured description of a failed query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    /// `"parse"` or `"runtime"`.
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Full error rendering, only populated in diagnostics mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Diagnostic {
    pub fn from_error(error: &QueryError, diagnostics: bool) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            position: error.position(),
            token: error.token().map(str::to_string),
            detail: diagnostics.then(|| format!("{error:?}")),
        }
    }
}

/// The body of a query response.
///
/// A success never carries an `error`, and a failure never carries
/// `results`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseEnvelope {
    Success {
        query: Query,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        results: Value,
    },
    Failure {
        query: Query,
        error: Diagnostic,
    },
}

impl ResponseEnvelope {
    pub fn success(query: Query, source: Option<&str>, results: Value) -> Self {
        ResponseEnvelope::Success {
            query,
            source: source.map(str::to_string),
            results,
        }
    }

    pub fn failure(query: Query, error: &QueryError, diagnostics: bool) -> Self {
        ResponseEnvelope::Failure {
            query,
            error: Diagnostic::from_error(error, diagnostics),
        }
    }

    /// Build the envelope for the outcome of one query.
    ///
    /// Failures never carry a `source`; the caller learns which surface it
    /// reached from the route itself.
    pub fn compose(
        query: Query,
        source: Option<&str>,
        outcome: QueryResult<Value>,
        diagnostics: bool,
    ) -> Self {
        match outcome {
            Ok(results) => Self::success(query, source, results),
            Err(e) => Self::failure(query, &e, diagnostics),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResponseEnvelope::Success { .. })
    }

    /// HTTP status for this envelope: 200 on success, 400 for parse and
    /// runtime failures.
    pub fn status_code(&self) -> u16 {
        if self.is_success() {
            200
        } else {
            400
        }
    }

    pub fn query(&self) -> &Query {
        match self {
            ResponseEnvelope::Success { query, .. } | ResponseEnvelope::Failure { query, .. } => {
                query
            }
        }
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            ResponseEnvelope::Failure { error, .. } => Some(error),
            ResponseEnvelope::Success { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_with_source() {
        let env = ResponseEnvelope::success(
            Query::from_text("people.Count()"),
            Some("controller"),
            Value::Integer(100),
        );
        assert_eq!(env.status_code(), 200);
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"query": "people.Count()", "source": "controller", "results": 100})
        );
    }

    #[test]
    fn test_success_without_source_omits_field() {
        let env = ResponseEnvelope::success(Query::from_text("people"), None, Value::Sequence(vec![]));
        let text = serde_json::to_string(&env).unwrap();
        assert_eq!(text, r#"{"query":"people","results":[]}"#);
    }

    #[test]
    fn test_failure_is_sanitized_by_default() {
        let err = QueryError::parse_at("unknown member 'Explode' on sequence of Person", 7, "Explode");
        let env = ResponseEnvelope::compose(Query::from_text("people.Explode()"), Some("controller"), Err(err), false);
        assert!(!env.is_success());
        assert_eq!(env.status_code(), 400);

        let body = serde_json::to_value(&env).unwrap();
        assert_eq!(body["error"]["kind"], "parse");
        assert_eq!(body["error"]["token"], "Explode");
        assert_eq!(body["error"]["position"], 7);
        assert!(body.get("results").is_none());
        assert!(body.get("source").is_none());
        assert!(body["error"].get("detail").is_none());
    }

    #[test]
    fn test_failure_detail_in_diagnostics_mode() {
        let env = ResponseEnvelope::failure(Query::default(), &QueryError::runtime("division by zero"), true);
        let diag = env.diagnostic().unwrap();
        assert_eq!(diag.kind, "runtime");
        assert_eq!(diag.message, "Runtime error: division by zero");
        assert!(diag.detail.as_deref().unwrap().contains("Runtime"));
        assert_eq!(env.query().as_str(), "");
    }
}
