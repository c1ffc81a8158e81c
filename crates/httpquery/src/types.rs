//! Core data types: records, the dataset generator, query text and errors.

use serde::{Serialize, Serializer};

/// A single record of the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    /// Display name, `Minion #<index>`.
    pub name: String,
    /// 1-based position in the generated dataset.
    pub index: i64,
}

impl Person {
    /// Build the record for a 1-based index.
    pub fn new(index: i64) -> Self {
        Self {
            name: format!("Minion #{index}"),
            index,
        }
    }
}

/// Read-only source of records for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    people: Vec<Person>,
}

impl Dataset {
    /// Default number of records served per request.
    pub const DEFAULT_SIZE: usize = 100;

    /// Generate `size` records indexed `1..=size`.
    ///
    /// The output depends only on `size`, so two calls with the same size
    /// produce identical datasets.
    pub fn generate(size: usize) -> Self {
        let people = (1..=size as i64).map(Person::new).collect();
        Self { people }
    }

    pub fn people(&self) -> &[Person] {
        &self.people
    }

    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }
}

/// The raw expression text submitted by a caller.
///
/// `text` is `None` when the request carried no body at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub text: Option<String>,
}

impl Query {
    pub fn new(text: Option<String>) -> Self {
        Self { text }
    }

    /// Wrap non-empty text; empty text becomes an absent query.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            Self { text: None }
        } else {
            Self { text: Some(text) }
        }
    }

    /// The query text, or `""` when absent.
    pub fn as_str(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    pub fn is_blank(&self) -> bool {
        self.as_str().trim().is_empty()
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Echoed as plain text in response envelopes.
impl Serialize for Query {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Errors raised while compiling or executing a query expression.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The text is not a valid expression, or uses something outside the allow-list.
    #[error("Parse error: {message}")]
    Parse {
        message: String,
        /// Byte offset of the offending token in the query text.
        position: Option<usize>,
        /// The offending token or identifier.
        token: Option<String>,
    },

    /// A compiled expression failed against the actual data.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl QueryError {
    pub fn parse(message: impl Into<String>) -> Self {
        QueryError::Parse {
            message: message.into(),
            position: None,
            token: None,
        }
    }

    pub fn parse_at(message: impl Into<String>, position: usize, token: impl Into<String>) -> Self {
        QueryError::Parse {
            message: message.into(),
            position: Some(position),
            token: Some(token.into()),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        QueryError::Runtime(message.into())
    }

    /// Short machine-readable kind: `"parse"` or `"runtime"`.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Parse { .. } => "parse",
            QueryError::Runtime(_) => "runtime",
        }
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, QueryError::Parse { .. })
    }

    pub fn position(&self) -> Option<usize> {
        match self {
            QueryError::Parse { position, .. } => *position,
            QueryError::Runtime(_) => None,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            QueryError::Parse { token, .. } => token.as_deref(),
            QueryError::Runtime(_) => None,
        }
    }
}

/// Convenience result type.
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_is_deterministic() {
        let a = Dataset::generate(100);
        let b = Dataset::generate(100);
        assert_eq!(a, b);
        assert_eq!(a.len(), 100);
        assert_eq!(a.people()[0], Person::new(1));
        assert_eq!(a.people()[99].name, "Minion #100");
    }

    #[test]
    fn test_dataset_empty() {
        assert!(Dataset::generate(0).is_empty());
    }

    #[test]
    fn test_person_serializes_camel_case() {
        let json = serde_json::to_string(&Person::new(7)).unwrap();
        assert_eq!(json, r#"{"name":"Minion #7","index":7}"#);
    }

    #[test]
    fn test_query_text_accessor() {
        assert_eq!(Query::default().as_str(), "");
        assert_eq!(Query::from_text("").text, None);
        let q = Query::from_text("people.Count()");
        assert_eq!(q.as_str(), "people.Count()");
        assert_eq!(q.to_string(), "people.Count()");
        assert!(!q.is_blank());
        assert!(Query::from_text("   ").is_blank());
    }

    #[test]
    fn test_query_serializes_as_text() {
        let json = serde_json::to_string(&Query::from_text("people")).unwrap();
        assert_eq!(json, r#""people""#);
        assert_eq!(serde_json::to_string(&Query::default()).unwrap(), r#""""#);
    }

    #[test]
    fn test_error_accessors() {
        let e = QueryError::parse_at("unknown member 'Explode'", 7, "Explode");
        assert_eq!(e.kind(), "parse");
        assert_eq!(e.position(), Some(7));
        assert_eq!(e.token(), Some("Explode"));
        assert!(e.to_string().contains("Explode"));

        let r = QueryError::runtime("division by zero");
        assert_eq!(r.kind(), "runtime");
        assert!(!r.is_parse());
        assert_eq!(r.position(), None);
    }
}
