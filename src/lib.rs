//! # Gantry
//!
//! A declarative endpoint-execution framework for containerized Rust services.
//!
//! Gantry lets a backend declare an API operation once (route, method,
//! input/output schemas, required services, session derivation,
//! authorization, audit logging, event emission, row-level-security scoping)
//! and executes that single declaration through a fixed phase pipeline,
//! whether the request arrives as an in-process call, a cloud-function event
//! envelope, or through the built-in HTTP server.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gantry::endpoint::Endpoints;
//! use gantry::env::Env;
//! use gantry::registry::ServiceRegistry;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     gantry::logging::setup_tracing();
//!
//!     let health = Endpoints::new()
//!         .get("/health")
//!         .handle(|_args| async move { Ok(json!({"status": "ok"})) });
//!
//!     let registry = ServiceRegistry::new(Env::process());
//!     gantry::web::server::run_webserver(vec![health], registry).await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`endpoint`] - Endpoint declarations and the execution pipeline
//! - [`registry`] - Named service construction and caching
//! - [`context`] - Request-scoped ambient data (span, request id, start time)
//! - [`db`] - Database collaborator contracts and the request-scoped handle
//! - [`transport`] - In-process and cloud-function invocation shapes
//! - [`web`] - HTTP server mount, error mapping, session helpers
//! - [`logging`] - Tracing setup
//! - [`env`] - Typed environment access for service factories
//! - [`tools`] - Utilities (request ids, graceful shutdown, stopwatch)
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `APP_NAME` | Application identifier | `GANTRY` |
//! | `APP_VERSION` | Version string | `DEVELOPMENT-SNAPSHOT-VERSION` |
//! | `CLUSTER_ID` | Cluster/service identifier | `local` |
//! | `TASK_ID` | Task/instance identifier | `local` |
//! | `BIND_ADDRESS` | HTTP server bind address | (required for the server) |
//! | `AUTH_SECRET` | JWT shared secret for the session helper | (optional) |
//! | `RUST_LOG` | Console log filter (e.g., `info`, `myapp=debug`) | `info` |

use std::env::var;
use std::sync::LazyLock;

/// Request-scoped ambient context propagation.
pub mod context;

/// Database collaborator contracts.
pub mod db;

/// Endpoint declarations, schemas, and the execution pipeline.
pub mod endpoint;

/// Typed environment access.
pub mod env;

/// Logging and tracing infrastructure.
pub mod logging;

/// Named service construction and caching.
pub mod registry;

/// Invocation transport adaptors.
pub mod transport;

/// General-purpose utilities and helpers.
pub mod tools;

/// HTTP server, error mapping, and session helpers.
pub mod web;

/// Application name from `APP_NAME` environment variable.
///
/// Used in logging, tracing spans, and service identification.
/// Defaults to `"GANTRY"` if not set.
pub static APP_NAME: LazyLock<String> =
    LazyLock::new(|| var("APP_NAME").unwrap_or("GANTRY".to_string()));

/// Application version from `APP_VERSION` environment variable.
///
/// Typically set during CI/CD builds. Defaults to
/// `"DEVELOPMENT-SNAPSHOT-VERSION"` for local development.
pub static APP_VERSION: LazyLock<String> =
    LazyLock::new(|| var("APP_VERSION").unwrap_or("DEVELOPMENT-SNAPSHOT-VERSION".to_string()));

/// Cluster identifier from `CLUSTER_ID` environment variable.
///
/// Identifies the deployment cluster or service group. Defaults to `"local"`.
pub static CLUSTER_ID: LazyLock<String> =
    LazyLock::new(|| var("CLUSTER_ID").unwrap_or("local".to_string()));

/// Task identifier from `TASK_ID` environment variable.
///
/// Identifies the specific task or container instance. Defaults to `"local"`.
pub static TASK_ID: LazyLock<String> =
    LazyLock::new(|| var("TASK_ID").unwrap_or("local".to_string()));
