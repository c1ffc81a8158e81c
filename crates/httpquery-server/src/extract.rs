//! Request body buffering and query text extraction.

use crate::types::{ServerError, ServerResult};
use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{FromRequest, Request};
use httpquery::Query;

/// An owned, in-memory copy of a request body with a read cursor.
///
/// Reading consumes from the cursor; [`rewind`](Self::rewind) makes the
/// same bytes readable again.
#[derive(Debug, Clone, Default)]
pub struct BufferedBody {
    bytes: Bytes,
    cursor: usize,
}

impl BufferedBody {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            cursor: 0,
        }
    }

    /// Buffer the body of `request`.
    ///
    /// The size limit comes from the router's `DefaultBodyLimit`; `max` is
    /// only used to report it.
    pub async fn read(request: Request, max: usize) -> ServerResult<Self> {
        match Bytes::from_request(request, &()).await {
            Ok(bytes) => Ok(Self::new(bytes)),
            Err(BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_))) => {
                Err(ServerError::BodyTooLarge { max })
            }
            Err(rejection) => Err(ServerError::Body(rejection.body_text())),
        }
    }

    /// Read everything after the cursor as text.
    ///
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn read_to_string(&mut self) -> String {
        let rest = &self.bytes[self.cursor.min(self.bytes.len())..];
        self.cursor = self.bytes.len();
        String::from_utf8_lossy(rest).into_owned()
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Read the query text from a buffered body.
///
/// The buffer is rewound before and after, so the body stays readable for
/// whoever handles the request next. An empty body yields an absent query.
pub fn extract_query(body: &mut BufferedBody) -> Query {
    body.rewind();
    let text = body.read_to_string();
    body.rewind();
    Query::from_text(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_extract_rewinds() {
        let mut body = BufferedBody::new("people.Take(3)");
        body.read_to_string();
        assert_eq!(body.position(), body.len());

        let query = extract_query(&mut body);
        assert_eq!(query.as_str(), "people.Take(3)");
        assert_eq!(body.position(), 0);
        assert_eq!(body.read_to_string(), "people.Take(3)");
    }

    #[test]
    fn test_extract_empty_body() {
        let query = extract_query(&mut BufferedBody::default());
        assert_eq!(query.text, None);
        assert_eq!(query.as_str(), "");
    }

    #[test]
    fn test_extract_invalid_utf8_is_replaced() {
        let mut body = BufferedBody::new(vec![b'p', 0xff, b'x']);
        assert_eq!(extract_query(&mut body).as_str(), "p\u{fffd}x");
    }

    #[test]
    fn test_read_consumes_from_cursor() {
        let mut body = BufferedBody::new("abc");
        assert_eq!(body.read_to_string(), "abc");
        assert_eq!(body.read_to_string(), "");
        body.rewind();
        assert_eq!(body.as_bytes(), b"abc");
    }

    #[tokio::test]
    async fn test_read_request_body() {
        let request = axum::http::Request::builder()
            .method("QUERY")
            .uri("/people")
            .body(Body::from("people.Count()"))
            .unwrap();
        let mut body = BufferedBody::read(request, 1024).await.unwrap();
        assert_eq!(extract_query(&mut body).as_str(), "people.Count()");
    }
}
