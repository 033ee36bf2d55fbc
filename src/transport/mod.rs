//! Invocation transport adaptors.
//!
//! Every transport maps its native event shape onto the pipeline's
//! transport-agnostic request and renders the pipeline's response back into
//! the native shape. Two shapes are supported:
//!
//! - [`http`]: an in-process request object (method, path, headers, body,
//!   query, optional pre-split params), also used by the built-in HTTP
//!   server mount;
//! - [`function`]: a cloud-function invocation envelope with case-varying
//!   header keys, cookies as either an entry list or a single `Cookie`
//!   header, and a `multiValueHeaders` response shape.

pub mod function;
pub mod http;
