//! Tracing and logging infrastructure.
//!
//! Provides a unified [`setup_tracing`] function that configures the `tracing`
//! subscriber with console output. Each request executed by the endpoint
//! pipeline runs inside a span carrying the method, route, host, and request
//! id, so every log line emitted from a handler or service is attributable to
//! the request that triggered it.
//!
//! # Usage
//!
//! Call [`setup_tracing`] once at application startup:
//!
//! ```rust,ignore
//! fn main() {
//!     gantry::logging::setup_tracing();
//!     // ... rest of application
//! }
//! ```
//!
//! # Features
//!
//! - **Console logging** - Always enabled, respects `RUST_LOG` env var for filtering
//! - **Pretty logs** (`pretty_logs` feature) - Colorful, human-friendly console output
//!
//! Without `pretty_logs`, output is plain text suitable for log aggregation:
//! ```text
//! INFO gantry::endpoint: Request completed [request{method=GET route=/health request_id=4TPGB2KMDVXH}]
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[cfg(feature = "pretty_logs")]
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(not(feature = "pretty_logs"))]
mod production;

#[cfg(feature = "pretty_logs")]
mod pretty;

/// Initializes the tracing subscriber with console output.
///
/// This function should be called once at application startup.
///
/// # Panics
///
/// Panics if called more than once (tracing subscriber can only be set once).
pub fn setup_tracing() {
    let console_layer = setup_console_layer();
    Registry::default().with(console_layer).init();
    tracing::info!("Tracing initialized successfully [reporting to console]");
}

/// Creates the console output layer with appropriate formatting.
///
/// Uses `RUST_LOG` environment variable for filtering, defaulting to `info`.
/// Format depends on whether `pretty_logs` feature is enabled.
#[cfg(feature = "pretty_logs")]
fn setup_console_layer() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW)
        .event_format(pretty::PrettyConsoleLogFormat {})
        .with_filter(filter)
        .boxed()
}

/// Creates the console output layer for production (no ANSI, with span context).
#[cfg(not(feature = "pretty_logs"))]
fn setup_console_layer() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .event_format(production::ProductionLogFormat)
        .with_filter(filter)
        .boxed()
}
