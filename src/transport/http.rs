//! In-process HTTP-style invocation.
//!
//! The request object mirrors what an embedded caller (or the server mount)
//! naturally has at hand: method and path as strings, a header map in
//! whatever casing the caller produced, an already-parsed JSON body, and
//! query/route parameters as string maps. Route parameters may be left
//! unset; the pipeline then extracts them from the endpoint's template.

use crate::endpoint::accessors::LazyLookup;
use crate::endpoint::response::EndpointResponse;
use crate::endpoint::{EndpointDefinition, PipelineRequest, pipeline};
use crate::registry::ServiceRegistry;
use crate::web::error::ApiError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use warp::http::{Method, StatusCode};

/// One in-process request.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub query: HashMap<String, String>,
    /// Pre-split route parameters; leave `None` to extract them from the
    /// endpoint's route template.
    pub params: Option<HashMap<String, String>>,
}

impl HttpRequest {
    pub fn new(method: impl ToString, path: impl ToString) -> Self {
        HttpRequest {
            method: method.to_string(),
            path: path.to_string(),
            ..HttpRequest::default()
        }
    }

    pub fn get(path: impl ToString) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl ToString, body: Value) -> Self {
        HttpRequest {
            body: Some(body),
            ..Self::new("POST", path)
        }
    }

    pub fn header(mut self, name: impl ToString, value: impl ToString) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn query_param(mut self, name: impl ToString, value: impl ToString) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }
}

/// Executes an in-process request against an endpoint definition.
pub async fn invoke(
    definition: &EndpointDefinition,
    registry: &ServiceRegistry,
    request: HttpRequest,
) -> EndpointResponse {
    let Ok(method) = Method::from_str(&request.method.to_uppercase()) else {
        return EndpointResponse::from_error(&ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Unsupported HTTP method: {}", request.method),
        ));
    };

    if method != definition.method {
        return EndpointResponse::from_error(&ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("{} is not supported on {}", method, definition.route.raw()),
        ));
    }

    let host = lookup_case_insensitive(&request.headers, "host");
    let cookie_header = lookup_case_insensitive(&request.headers, "cookie");
    let header = LazyLookup::from_map(request.headers);
    let cookie = LazyLookup::from_entries(Vec::new(), cookie_header);

    pipeline::execute(
        definition,
        registry,
        PipelineRequest {
            method,
            path: request.path,
            host,
            header,
            cookie,
            body: request.body,
            query: string_map_to_value(request.query),
            params: request.params.map(string_map_to_value),
        },
    )
    .await
}

fn string_map_to_value(map: HashMap<String, String>) -> Value {
    Value::Object(
        map.into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect::<Map<String, Value>>(),
    )
}

fn lookup_case_insensitive(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.clone())
}
