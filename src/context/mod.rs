//! Request-scoped ambient context.
//!
//! The endpoint pipeline binds a [`RequestContext`] to the whole call graph
//! of one request. Any code reachable from the bound future (services,
//! audit storages, event publishers) can ask "which request am I serving"
//! through the accessors here without the request being threaded through
//! every call signature.
//!
//! The carrier is a tokio task-local, so the binding survives arbitrarily
//! deep `await` chains but is invisible to unrelated concurrent requests.
//! It does **not** cross `tokio::spawn` boundaries; work spawned onto the
//! runtime detaches from the request on purpose.
//!
//! Accessors other than [`has_context`] return the named
//! [`NoRequestContext`] error when no context is bound. Missing propagation
//! should fail a test loudly, not silently hand out stale data.

use chrono::{DateTime, Utc};
use std::fmt::{Display, Formatter};
use std::future::Future;
use tracing::Span;

/// Ambient data for one in-flight request.
///
/// Created by the transport adaptor at the start of each request; exists
/// only for the duration of the call graph triggered by that request.
#[derive(Clone)]
pub struct RequestContext {
    /// The per-request tracing span (method, route, host, request id).
    pub span: Span,
    /// Short generated id identifying this request in logs and audit records.
    pub request_id: String,
    /// Wall-clock instant the request entered the pipeline.
    pub start_time: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(span: Span, request_id: impl ToString) -> Self {
        RequestContext {
            span,
            request_id: request_id.to_string(),
            start_time: Utc::now(),
        }
    }
}

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Error returned by the accessors when called outside a bound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoRequestContext;

impl Display for NoRequestContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "No request context is bound to the current task")
    }
}

impl std::error::Error for NoRequestContext {}

/// Runs `fut` with `context` bound to its entire call graph.
///
/// Nesting is supported: an inner call temporarily overrides the outer
/// context for its own subtree, and the outer context is restored once the
/// inner future completes.
pub async fn with_request_context<F: Future>(context: RequestContext, fut: F) -> F::Output {
    CURRENT.scope(context, fut).await
}

/// Synchronous variant of [`with_request_context`] for non-async callers.
pub fn with_request_context_sync<T>(context: RequestContext, f: impl FnOnce() -> T) -> T {
    CURRENT.sync_scope(context, f)
}

/// The span of the current request.
pub fn current_span() -> Result<Span, NoRequestContext> {
    CURRENT.try_with(|ctx| ctx.span.clone()).map_err(|_| NoRequestContext)
}

/// The id of the current request.
pub fn request_id() -> Result<String, NoRequestContext> {
    CURRENT.try_with(|ctx| ctx.request_id.clone()).map_err(|_| NoRequestContext)
}

/// The instant the current request entered the pipeline.
pub fn request_start_time() -> Result<DateTime<Utc>, NoRequestContext> {
    CURRENT.try_with(|ctx| ctx.start_time).map_err(|_| NoRequestContext)
}

/// Whether a request context is bound to the current task.
///
/// Never fails; this is the only safe way to branch on ambient-context
/// availability.
pub fn has_context() -> bool {
    CURRENT.try_with(|_| ()).is_ok()
}
