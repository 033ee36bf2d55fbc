//! Response assembly types.
//!
//! Handlers never build transport responses directly. They may annotate the
//! in-flight response through the [`ResponseMeta`] scratch handle (status
//! override, extra headers, cookies); the adaptor reads those annotations
//! exactly once after the handler returns and assembles the final
//! [`EndpointResponse`].

use crate::web::error::ApiError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use warp::http::StatusCode;

/// Attributes of a cookie set by a handler.
#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age_seconds: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<SameSite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

#[derive(Default)]
struct ResponseMetadata {
    status: Option<StatusCode>,
    headers: BTreeMap<String, String>,
    cookies: BTreeMap<String, (String, CookieOptions)>,
}

/// Mutable response scratch handed to the handler.
///
/// The handler annotates; it never controls flow through this object.
/// Cloning shares the same underlying scratch.
#[derive(Clone, Default)]
pub struct ResponseMeta {
    inner: Arc<Mutex<ResponseMetadata>>,
}

impl ResponseMeta {
    /// Overrides the endpoint's default success status.
    pub fn set_status(&self, status: StatusCode) {
        self.inner.lock().unwrap().status = Some(status);
    }

    /// Sets a response header, replacing any previous value for the name.
    pub fn set_header(&self, name: impl ToString, value: impl ToString) {
        self.inner
            .lock()
            .unwrap()
            .headers
            .insert(name.to_string(), value.to_string());
    }

    /// Sets a cookie, replacing any previous cookie of the same name.
    pub fn set_cookie(&self, name: impl ToString, value: impl ToString, options: CookieOptions) {
        self.inner
            .lock()
            .unwrap()
            .cookies
            .insert(name.to_string(), (value.to_string(), options));
    }

    pub(crate) fn status_override(&self) -> Option<StatusCode> {
        self.inner.lock().unwrap().status
    }

    pub(crate) fn into_parts(self) -> (BTreeMap<String, String>, Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        let headers = std::mem::take(&mut inner.headers);
        let cookies = std::mem::take(&mut inner.cookies);

        let set_cookies = cookies
            .into_iter()
            .map(|(name, (value, options))| render_set_cookie(&name, &value, &options))
            .collect();

        (headers, set_cookies)
    }
}

fn render_set_cookie(name: &str, value: &str, options: &CookieOptions) -> String {
    let mut rendered = format!("{name}={value}");

    if let Some(path) = &options.path {
        rendered.push_str(&format!("; Path={path}"));
    }
    if let Some(domain) = &options.domain {
        rendered.push_str(&format!("; Domain={domain}"));
    }
    if let Some(max_age) = options.max_age_seconds {
        rendered.push_str(&format!("; Max-Age={max_age}"));
    }
    if let Some(same_site) = options.same_site {
        let value = match same_site {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        };
        rendered.push_str(&format!("; SameSite={value}"));
    }
    if options.secure {
        rendered.push_str("; Secure");
    }
    if options.http_only {
        rendered.push_str("; HttpOnly");
    }

    rendered
}

/// The transport-agnostic result of one pipeline run.
#[derive(Debug, Clone)]
pub struct EndpointResponse {
    pub status: StatusCode,
    /// Serialized JSON body; `None` for empty responses.
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub set_cookies: Vec<String>,
}

impl EndpointResponse {
    pub(crate) fn success(status: StatusCode, output: &Value, meta: ResponseMeta) -> Self {
        let body = match output {
            Value::Null => None,
            data => Some(data.to_string()),
        };
        let (headers, set_cookies) = meta.into_parts();

        EndpointResponse {
            status,
            body,
            headers,
            set_cookies,
        }
    }

    pub(crate) fn from_error(error: &ApiError) -> Self {
        EndpointResponse {
            status: error.status,
            body: serde_json::to_string(error).ok(),
            headers: BTreeMap::new(),
            set_cookies: Vec::new(),
        }
    }

    /// Parses the body back into JSON; test and in-process convenience.
    pub fn body_json(&self) -> Option<Value> {
        self.body.as_deref().and_then(|body| serde_json::from_str(body).ok())
    }
}
