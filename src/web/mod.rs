//! HTTP layer built on the Warp framework.
//!
//! Provides the error-to-response mapping used by the whole crate, a
//! bearer-token session helper, and [`server::run_webserver`] which mounts
//! a set of endpoint definitions on a real HTTP server with graceful
//! shutdown support.

use bytesize::MB;

pub mod auth;
pub mod error;
pub mod server;

/// Default limit for JSON request bodies (10 MB).
pub const DEFAULT_MAX_JSON_BODY_SIZE: u64 = 10 * MB;
