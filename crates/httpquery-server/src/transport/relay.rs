//! Relay page — `GET /?q=<expr>` sends the expression to the minimal query
//! route by its name and relays the answer.
//!
//! The target URL is built by reverse lookup in the route table, so it
//! follows the route if its template changes. Its base is the configured
//! public URL or this server's own listener; the request's `Host` header is
//! never used, so a caller cannot point the relay at another server.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{Query as UrlQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use url::Url;

use crate::routing::QUERY_METHOD;
use crate::surfaces::PEOPLE_ROUTE;
use crate::transport::http::AppState;
use crate::types::{ServerError, ServerResult};

/// Expression sent when the page is opened without `q`.
pub const DEFAULT_EXPRESSION: &str = "people.Take(10).OrderByDescending(p => p.Index)";

#[derive(Debug, Default, Deserialize)]
pub struct RelayParams {
    pub q: Option<String>,
}

impl RelayParams {
    /// The expression to send; empty or absent `q` means the default.
    pub fn expression(&self) -> &str {
        match self.q.as_deref() {
            Some(q) if !q.trim().is_empty() => q,
            _ => DEFAULT_EXPRESSION,
        }
    }
}

pub async fn handle_relay(
    State(state): State<Arc<AppState>>,
    UrlQuery(params): UrlQuery<RelayParams>,
) -> Response {
    match relay(&state, params.expression()).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Relay failed: {e}");
            e.into_response()
        }
    }
}

async fn relay(state: &AppState, expression: &str) -> ServerResult<Response> {
    let base = resolve_base(state.config.public_url.as_ref(), state.local_addr.get().copied())?;
    let target = state.routes.url_for(&base, PEOPLE_ROUTE, &[])?;
    let method = reqwest::Method::from_bytes(QUERY_METHOD.as_bytes())
        .map_err(|e| ServerError::Config(format!("invalid method {QUERY_METHOD}: {e}")))?;

    tracing::debug!(%target, "relaying query");
    let upstream = state
        .client
        .request(method, target)
        .header(reqwest::header::CONTENT_TYPE, "text/plain")
        .body(expression.to_string())
        .send()
        .await?;

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = upstream.bytes().await?;

    Ok((status, [(header::CONTENT_TYPE, "application/json")], body).into_response())
}

/// The absolute base URL: the configured public URL, else the listener
/// address over plain HTTP.
///
/// A wildcard bind (`0.0.0.0`, `::`) is reached through loopback.
pub fn resolve_base(public_url: Option<&Url>, local_addr: Option<SocketAddr>) -> ServerResult<Url> {
    if let Some(url) = public_url {
        return Ok(url.clone());
    }
    let mut addr = local_addr.ok_or(ServerError::MissingBaseUrl)?;
    if addr.ip().is_unspecified() {
        addr.set_ip(match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        });
    }
    Ok(Url::parse(&format!("http://{addr}/"))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_expression() {
        assert_eq!(RelayParams::default().expression(), DEFAULT_EXPRESSION);
        let blank = RelayParams {
            q: Some("  ".to_string()),
        };
        assert_eq!(blank.expression(), DEFAULT_EXPRESSION);
        let given = RelayParams {
            q: Some("people.Count()".to_string()),
        };
        assert_eq!(given.expression(), "people.Count()");
    }

    #[test]
    fn test_base_prefers_public_url() {
        let public = Url::parse("https://api.example.test/").unwrap();
        let local: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(resolve_base(Some(&public), Some(local)).unwrap(), public);
        assert_eq!(
            resolve_base(None, Some(local)).unwrap().as_str(),
            "http://127.0.0.1:5000/"
        );
    }

    #[test]
    fn test_base_maps_wildcard_bind_to_loopback() {
        let v4: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(
            resolve_base(None, Some(v4)).unwrap().as_str(),
            "http://127.0.0.1:8080/"
        );
        let v6: SocketAddr = "[::]:8080".parse().unwrap();
        assert_eq!(
            resolve_base(None, Some(v6)).unwrap().as_str(),
            "http://[::1]:8080/"
        );
    }

    #[test]
    fn test_base_requires_listener_or_public_url() {
        assert!(matches!(
            resolve_base(None, None),
            Err(ServerError::MissingBaseUrl)
        ));
    }
}
