//! HTTP server mount for endpoint definitions.
//!
//! [`run_webserver`] serves a set of [`EndpointDefinition`]s over warp:
//! a catch-all filter captures method, path, query, headers, and body,
//! routes by template match, and hands the request to the endpoint
//! pipeline. The server binds to `BIND_ADDRESS` (read through the
//! registry's environment) and shuts down gracefully on SIGTERM/SIGINT.

use anyhow::Context;
use bytes::Bytes;
use hyper::{Body, Server};
use serde_json::{Map, Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tower::{Service, ServiceBuilder};
use tracing::{Instrument, Span, debug_span};
use warp::Filter;
use warp::http::header::{CONTENT_TYPE, SET_COOKIE};
use warp::http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use warp::path::FullPath;
use warp::reply::Response;

use crate::endpoint::accessors::LazyLookup;
use crate::endpoint::response::EndpointResponse;
use crate::endpoint::{EndpointDefinition, Endpoints, PipelineRequest, pipeline};
use crate::registry::ServiceRegistry;
use crate::tools::system;
use crate::web::DEFAULT_MAX_JSON_BODY_SIZE;
use crate::web::error::ApiError;

struct AppState {
    endpoints: Vec<Arc<EndpointDefinition>>,
    registry: ServiceRegistry,
}

pub fn with_cloneable<C: Clone + Send>(
    value: C,
) -> impl Filter<Extract = (C,), Error = Infallible> + Clone {
    warp::any().map(move || value.clone())
}

/// Serves the given endpoints until the process receives a termination
/// signal.
pub async fn run_webserver(
    endpoints: Vec<Arc<EndpointDefinition>>,
    registry: ServiceRegistry,
) -> anyhow::Result<()> {
    let bind_address = registry.env().var("BIND_ADDRESS")?;
    let bind_address =
        SocketAddr::from_str(&bind_address).context("Failed to parse bind address.")?;

    let mut endpoints = endpoints;
    endpoints.push(info_endpoint());
    let state = Arc::new(AppState {
        endpoints,
        registry,
    });

    system::install_termination_listener();
    tracing::info!("Starting server at {}", bind_address);

    let filter = warp::method()
        .and(warp::path::full())
        .and(warp::query::raw().or(warp::any().map(String::new)).unify())
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(with_cloneable(state))
        .and_then(handle_request);

    let svc = warp::service(filter);
    let traced_svc = ServiceBuilder::new()
        .layer_fn(|inner| TracingMiddleware { inner })
        .service(svc);

    let server = Server::bind(&bind_address).serve(hyper::service::make_service_fn(move |_| {
        let svc = traced_svc.clone();
        async move { Ok::<_, Infallible>(svc) }
    }));

    tracing::info!(
        "Running HTTP server at effective address {}",
        server.local_addr()
    );
    server
        .with_graceful_shutdown(system::await_shutdown())
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", bind_address))?;

    tracing::info!("HTTP Server has been stopped...");
    // Wait a bit to ensure all requests are processed and also permit background tasks to finish
    // (as most probably the web server will run in the main thread which will cause the process
    // to terminate once it completes).
    tokio::time::sleep(Duration::from_secs(3)).await;
    tracing::info!("HTTP Server has been terminated.");

    Ok(())
}

/// The `/info/v1` metadata endpoint mounted alongside the declared routes.
pub fn info_endpoint() -> Arc<EndpointDefinition> {
    Endpoints::new().get("/info/v1").handle(|_args| async move {
        Ok(json!({
            "app": crate::APP_NAME.clone(),
            "version": crate::APP_VERSION.clone(),
            "clusterId": crate::CLUSTER_ID.clone(),
            "taskId": crate::TASK_ID.clone(),
        }))
    })
}

async fn handle_request(
    method: Method,
    path: FullPath,
    raw_query: String,
    headers: HeaderMap,
    body: Bytes,
    state: Arc<AppState>,
) -> Result<Response, Infallible> {
    let response = dispatch(state, method, path.as_str(), &raw_query, headers, body).await;
    Ok(into_reply(response))
}

async fn dispatch(
    state: Arc<AppState>,
    method: Method,
    path: &str,
    raw_query: &str,
    headers: HeaderMap,
    body: Bytes,
) -> EndpointResponse {
    if body.len() as u64 > DEFAULT_MAX_JSON_BODY_SIZE {
        return EndpointResponse::from_error(&ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "The given request data is too large",
        ));
    }

    let Some(definition) = find_endpoint(&state.endpoints, &method, path) else {
        return EndpointResponse::from_error(&ApiError::new(
            StatusCode::NOT_FOUND,
            format!("No endpoint matches {} {}", method, path),
        ));
    };

    let body_value = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                return EndpointResponse::from_error(&ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "Invalid JSON input",
                ));
            }
        }
    };

    let headers = Arc::new(headers);
    let host = header_str(&headers, "host");
    let cookie = LazyLookup::from_entries(Vec::new(), header_str(&headers, "cookie"));
    let header = native_header_lookup(headers);

    pipeline::execute(
        definition.as_ref(),
        &state.registry,
        PipelineRequest {
            method,
            path: path.to_string(),
            host,
            header,
            cookie,
            body: body_value,
            query: parse_query(raw_query),
            params: None,
        },
    )
    .await
}

fn find_endpoint<'a>(
    endpoints: &'a [Arc<EndpointDefinition>],
    method: &Method,
    path: &str,
) -> Option<&'a Arc<EndpointDefinition>> {
    endpoints
        .iter()
        .find(|definition| definition.method() == method && definition.route_matches(path))
}

/// Header accessor over warp's native map: single-key gets answer directly,
/// full enumeration happens only when all entries are requested.
fn native_header_lookup(headers: Arc<HeaderMap>) -> LazyLookup {
    let for_get = headers.clone();
    LazyLookup::from_getter(
        move |key| {
            for_get
                .get(key)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        },
        move || {
            headers
                .iter()
                .filter_map(|(name, value)| {
                    Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
                })
                .collect()
        },
    )
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Parses `a=b&c=d` into a JSON object. Values are passed through
/// undecoded; URL decoding is the transport's concern, not this mount's.
fn parse_query(raw_query: &str) -> Value {
    let entries = raw_query
        .split('&')
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, value)) => (name.to_string(), Value::String(value.to_string())),
            None => (entry.to_string(), Value::String(String::new())),
        })
        .collect::<Map<String, Value>>();

    Value::Object(entries)
}

fn into_reply(endpoint_response: EndpointResponse) -> Response {
    let has_body = endpoint_response.body.is_some();
    let mut response = Response::new(endpoint_response.body.unwrap_or_default().into());
    *response.status_mut() = endpoint_response.status;

    if has_body {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    for (name, value) in &endpoint_response.headers {
        match (
            warp::http::header::HeaderName::from_str(name),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => tracing::warn!("Dropping unrepresentable response header '{}'", name),
        }
    }

    for cookie in &endpoint_response.set_cookies {
        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(_) => tracing::warn!("Dropping unrepresentable Set-Cookie entry"),
        }
    }

    response
}

#[derive(Clone)]
struct TracingMiddleware<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for TracingMiddleware<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let span = debug_span!(
            "http_request",
            service = %crate::CLUSTER_ID.clone(),
            http.method = %method,
            http.url = %path,
            http.status_code = tracing::field::Empty,
        );

        let mut inner = self.inner.clone();

        let fut = async move {
            let response = inner.call(req).await?;
            let status = response.status().as_u16();
            Span::current().record("http.status_code", status as i64);
            Ok(response)
        }
        .instrument(span);

        Box::pin(fut)
    }
}
