//! Cloud-function invocation envelope.
//!
//! The envelope tolerates the quirks of function gateways: header keys
//! arrive in whatever casing the gateway produced, cookies arrive either as
//! a list of `"name=value"` entries or as a single `Cookie` header, and the
//! body is a JSON string rather than parsed JSON. The response carries
//! `Set-Cookie` entries under `multiValueHeaders`, since plain headers can
//! hold only one value per name.

use crate::endpoint::accessors::LazyLookup;
use crate::endpoint::response::EndpointResponse;
use crate::endpoint::{EndpointDefinition, PipelineRequest, pipeline};
use crate::registry::ServiceRegistry;
use crate::web::error::ApiError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use warp::http::{Method, StatusCode};

/// One function invocation event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionEvent {
    pub http_method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    /// Cookies as `"name=value"` entries; gateways that do not split
    /// cookies leave this empty and send a single `Cookie` header instead.
    pub cookies: Vec<String>,
    /// Raw JSON body string.
    pub body: Option<String>,
    pub query_string_parameters: HashMap<String, String>,
    pub path_parameters: Option<HashMap<String, String>>,
}

/// The response shape handed back to the function runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi_value_headers: Option<MultiValueHeaders>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiValueHeaders {
    #[serde(rename = "Set-Cookie")]
    pub set_cookie: Vec<String>,
}

/// Executes a function event against an endpoint definition.
pub async fn invoke(
    definition: &EndpointDefinition,
    registry: &ServiceRegistry,
    event: FunctionEvent,
) -> FunctionResponse {
    let Ok(method) = Method::from_str(&event.http_method.to_uppercase()) else {
        return render(EndpointResponse::from_error(&ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Unsupported HTTP method: {}", event.http_method),
        )));
    };

    let body = match event.body.as_deref().map(str::trim).filter(|body| !body.is_empty()) {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                return render(EndpointResponse::from_error(&ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "Invalid JSON input",
                )));
            }
        },
        None => None,
    };

    let host = lookup_case_insensitive(&event.headers, "host");
    let cookie_fallback = lookup_case_insensitive(&event.headers, "cookie");
    let cookie = LazyLookup::from_entries(event.cookies, cookie_fallback);
    let header = LazyLookup::from_map(event.headers);

    let response = pipeline::execute(
        definition,
        registry,
        PipelineRequest {
            method,
            path: event.path,
            host,
            header,
            cookie,
            body,
            query: string_map_to_value(event.query_string_parameters),
            params: event.path_parameters.map(string_map_to_value),
        },
    )
    .await;

    render(response)
}

fn render(response: EndpointResponse) -> FunctionResponse {
    let multi_value_headers = if response.set_cookies.is_empty() {
        None
    } else {
        Some(MultiValueHeaders {
            set_cookie: response.set_cookies,
        })
    };

    let mut headers = response.headers;
    if response.body.is_some() {
        headers
            .entry("content-type".to_string())
            .or_insert_with(|| "application/json".to_string());
    }

    FunctionResponse {
        status: response.status.as_u16(),
        body: response.body,
        headers,
        multi_value_headers,
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoints;
    use crate::endpoint::response::CookieOptions;
    use crate::env::Env;
    use serde_json::json;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(Env::from_iter::<&str, &str>([]))
    }

    fn event(method: &str, path: &str) -> FunctionEvent {
        FunctionEvent {
            http_method: method.to_string(),
            path: path.to_string(),
            ..FunctionEvent::default()
        }
    }

    #[tokio::test]
    async fn case_varying_headers_are_readable_either_way() {
        let endpoint = Endpoints::new()
            .get("/echo")
            .handle(|args| async move {
                Ok(json!({"auth": args.header.get("authorization")}))
            });

        let mut invocation = event("GET", "/echo");
        invocation
            .headers
            .insert("Authorization".to_string(), "Bearer abc".to_string());

        let response = invoke(&endpoint, &registry(), invocation).await;
        assert_eq!(response.status, 200);
        let body: Value = serde_json::from_str(response.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["auth"], "Bearer abc");
    }

    #[tokio::test]
    async fn cookies_fall_back_to_the_single_cookie_header() {
        let endpoint = Endpoints::new()
            .get("/session")
            .handle(|args| async move { Ok(json!({"session": args.cookie.get("session")})) });

        // Entry-list shape.
        let mut with_entries = event("GET", "/session");
        with_entries.cookies = vec!["session=s1".to_string()];
        let response = invoke(&endpoint, &registry(), with_entries).await;
        let body: Value = serde_json::from_str(response.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["session"], "s1");

        // Single-header shape.
        let mut with_header = event("GET", "/session");
        with_header
            .headers
            .insert("Cookie".to_string(), "session=s2; theme=dark".to_string());
        let response = invoke(&endpoint, &registry(), with_header).await;
        let body: Value = serde_json::from_str(response.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["session"], "s2");
    }

    #[tokio::test]
    async fn a_malformed_body_string_is_rejected_before_the_pipeline() {
        let endpoint = Endpoints::new()
            .post("/users")
            .handle(|_args| async move { Ok(json!({})) });

        let mut invocation = event("POST", "/users");
        invocation.body = Some("{not json".to_string());

        let response = invoke(&endpoint, &registry(), invocation).await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn set_cookies_land_in_multi_value_headers() {
        let endpoint = Endpoints::new()
            .post("/login")
            .handle(|args| async move {
                args.meta.set_cookie("session", "fresh", CookieOptions::default());
                Ok(json!({"ok": true}))
            });

        let mut invocation = event("POST", "/login");
        invocation.body = Some("{}".to_string());

        let response = invoke(&endpoint, &registry(), invocation).await;
        let cookies = response.multi_value_headers.unwrap().set_cookie;
        assert_eq!(cookies, vec!["session=fresh"]);
    }

    #[tokio::test]
    async fn the_envelope_round_trips_through_serde() {
        let raw = json!({
            "httpMethod": "POST",
            "path": "/users",
            "headers": {"Content-Type": "application/json"},
            "cookies": ["session=s1"],
            "body": "{\"name\":\"x\"}",
            "queryStringParameters": {"verbose": "true"},
            "pathParameters": {"id": "u1"}
        });

        let event: FunctionEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.http_method, "POST");
        assert_eq!(event.cookies, vec!["session=s1"]);
        assert_eq!(event.query_string_parameters["verbose"], "true");
        assert_eq!(event.path_parameters.unwrap()["id"], "u1");

        let response = FunctionResponse {
            status: 201,
            body: Some("{}".to_string()),
            headers: BTreeMap::new(),
            multi_value_headers: Some(MultiValueHeaders {
                set_cookie: vec!["session=s1".to_string()],
            }),
        };
        let rendered = serde_json::to_value(&response).unwrap();
        assert_eq!(rendered["status"], 201);
        assert_eq!(rendered["multiValueHeaders"]["Set-Cookie"][0], "session=s1");
    }
}
