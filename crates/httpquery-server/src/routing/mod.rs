//! Verb router — a route table keyed by method and path template.
//!
//! axum's method routing only knows the standard verbs, so routes for
//! `QUERY` live in this table instead and are dispatched by a middleware
//! layer in front of the axum router (see `transport::http`).

use crate::extract::BufferedBody;
use crate::types::{ServerError, ServerResult};
use httpquery::{Query, ResponseEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// The custom verb that carries a query expression in its body.
pub const QUERY_METHOD: &str = "QUERY";

/// Everything a handler receives for one matched request.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub query: Query,
    /// Decoded `{param}` values from the matched template.
    pub params: HashMap<String, String>,
    /// The rewound request body.
    pub body: BufferedBody,
}

impl QueryRequest {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            ..Default::default()
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Something that answers a matched query request.
pub trait QueryHandler: Send + Sync {
    fn call(&self, request: QueryRequest) -> ServerResult<ResponseEnvelope>;
}

/// Plain functions over the query text.
impl<F> QueryHandler for F
where
    F: Fn(Query) -> ResponseEnvelope + Send + Sync,
{
    fn call(&self, request: QueryRequest) -> ServerResult<ResponseEnvelope> {
        Ok(self(request.query))
    }
}

/// A controller method bound to a shared controller instance.
pub struct Action<C> {
    controller: Arc<C>,
    method: fn(&C, QueryRequest) -> ServerResult<ResponseEnvelope>,
}

impl<C: Send + Sync> QueryHandler for Action<C> {
    fn call(&self, request: QueryRequest) -> ServerResult<ResponseEnvelope> {
        (self.method)(&self.controller, request)
    }
}

/// One entry of the route table.
pub struct RouteRegistration {
    pub method: String,
    pub template: String,
    pub name: Option<String>,
    handler: Arc<dyn QueryHandler>,
}

impl RouteRegistration {
    pub fn handler(&self) -> Arc<dyn QueryHandler> {
        Arc::clone(&self.handler)
    }
}

impl std::fmt::Debug for RouteRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRegistration")
            .field("method", &self.method)
            .field("template", &self.template)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Returned by `map_*` so a name can be attached to the new route.
pub struct RouteBuilder<'a> {
    registration: &'a mut RouteRegistration,
}

impl RouteBuilder<'_> {
    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.registration.name = Some(name.into());
        self
    }
}

/// A successful lookup.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub registration: &'a RouteRegistration,
    pub params: HashMap<String, String>,
}

/// The route table, built once at startup and read-only afterwards.
#[derive(Default)]
pub struct QueryRoutes {
    registrations: Vec<RouteRegistration>,
    matchers: HashMap<String, matchit::Router<usize>>,
}

impl QueryRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function over the query text under `QUERY template`.
    pub fn map_query<H>(&mut self, template: &str, handler: H) -> ServerResult<RouteBuilder<'_>>
    where
        H: QueryHandler + 'static,
    {
        self.map(QUERY_METHOD, template, Arc::new(handler))
    }

    /// Register a controller method under `QUERY template`.
    pub fn map_action<C>(
        &mut self,
        template: &str,
        controller: Arc<C>,
        method: fn(&C, QueryRequest) -> ServerResult<ResponseEnvelope>,
    ) -> ServerResult<RouteBuilder<'_>>
    where
        C: Send + Sync + 'static,
    {
        self.map(QUERY_METHOD, template, Arc::new(Action { controller, method }))
    }

    /// Register a handler for any method, standard or not.
    pub fn map(
        &mut self,
        method: &str,
        template: &str,
        handler: Arc<dyn QueryHandler>,
    ) -> ServerResult<RouteBuilder<'_>> {
        let id = self.registrations.len();
        let matcher = self.matchers.entry(method.to_string()).or_default();
        matcher.insert(template, id).map_err(|e| match e {
            matchit::InsertError::Conflict { .. } => ServerError::DuplicateRoute {
                method: method.to_string(),
                template: template.to_string(),
            },
            other => ServerError::InvalidRoute {
                template: template.to_string(),
                reason: other.to_string(),
            },
        })?;

        tracing::debug!(method, template, "registered route");
        self.registrations.push(RouteRegistration {
            method: method.to_string(),
            template: template.to_string(),
            name: None,
            handler,
        });
        let registration = &mut self.registrations[id];
        Ok(RouteBuilder { registration })
    }

    /// Look up `(method, path)`. Method comparison is exact.
    pub fn find(&self, method: &str, path: &str) -> Option<RouteMatch<'_>> {
        let matched = self.matchers.get(method)?.at(path).ok()?;
        let registration = self.registrations.get(*matched.value)?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| {
                let value = urlencoding::decode(v)
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or_else(|_| v.to_string());
                (k.to_string(), value)
            })
            .collect();
        Some(RouteMatch {
            registration,
            params,
        })
    }

    pub fn registrations(&self) -> &[RouteRegistration] {
        &self.registrations
    }

    pub fn by_name(&self, name: &str) -> Option<&RouteRegistration> {
        self.registrations
            .iter()
            .find(|r| r.name.as_deref() == Some(name))
    }

    /// Build the path of a named route, percent-encoding parameter values.
    pub fn path_for(&self, name: &str, params: &[(&str, &str)]) -> ServerResult<String> {
        let registration = self
            .by_name(name)
            .ok_or_else(|| ServerError::UnknownRoute(name.to_string()))?;

        let mut path = String::with_capacity(registration.template.len());
        let mut rest = registration.template.as_str();
        while let Some(open) = rest.find('{') {
            path.push_str(&rest[..open]);
            let close = rest[open..]
                .find('}')
                .map(|i| open + i)
                .ok_or_else(|| ServerError::InvalidRoute {
                    template: registration.template.clone(),
                    reason: "unclosed parameter".to_string(),
                })?;
            let param = rest[open + 1..close].trim_start_matches('*');
            let value = params
                .iter()
                .find(|(key, _)| *key == param)
                .map(|(_, value)| *value)
                .ok_or_else(|| ServerError::MissingRouteParam {
                    route: name.to_string(),
                    param: param.to_string(),
                })?;
            path.push_str(&urlencoding::encode(value));
            rest = &rest[close + 1..];
        }
        path.push_str(rest);
        Ok(path)
    }

    /// Build an absolute URL of a named route against `base`.
    pub fn url_for(&self, base: &Url, name: &str, params: &[(&str, &str)]) -> ServerResult<Url> {
        let path = self.path_for(name, params)?;
        Ok(base.join(&path)?)
    }
}
