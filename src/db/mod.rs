//! Database collaborator contracts.
//!
//! Persistence internals are out of scope for this crate; endpoints talk to
//! a [`Database`] service through the narrow contract below, and the
//! pipeline wraps it into a request-scoped [`DbHandle`] that routes
//! statements either to the pool or to the transaction opened by the audit
//! coordinator. Row-level-security scoping builds on the same handle (see
//! [`crate::endpoint::rls`]).

use crate::registry::{ResolvedServices, ServiceDescriptor};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A pooled database connection service.
///
/// Implementations are shared across concurrent requests and must be safe
/// under interleaving. An uncommitted [`DbTransaction`] must roll back when
/// dropped, so that cancelled or timed-out requests release their work
/// without an explicit rollback call.
#[async_trait]
pub trait Database: Send + Sync {
    /// Executes a statement, returning the number of affected rows.
    async fn execute(&self, statement: &str, params: &[Value]) -> anyhow::Result<u64>;

    /// Runs a query, returning one JSON object per row.
    async fn query(&self, statement: &str, params: &[Value]) -> anyhow::Result<Vec<Value>>;

    /// Opens a transaction on this connection.
    async fn begin(&self) -> anyhow::Result<Arc<dyn DbTransaction>>;
}

/// A single open transaction.
#[async_trait]
pub trait DbTransaction: Send + Sync {
    async fn execute(&self, statement: &str, params: &[Value]) -> anyhow::Result<u64>;

    async fn query(&self, statement: &str, params: &[Value]) -> anyhow::Result<Vec<Value>>;

    async fn commit(&self) -> anyhow::Result<()>;

    async fn rollback(&self) -> anyhow::Result<()>;
}

/// Descriptor for a database service registered in the service registry.
pub type DatabaseDescriptor = ServiceDescriptor<Arc<dyn Database>>;

/// Retrieves the database instance a resolved descriptor points at.
pub fn resolve_database(
    services: &ResolvedServices,
    descriptor: &DatabaseDescriptor,
) -> anyhow::Result<Arc<dyn Database>> {
    Ok(services.get(descriptor)?.as_ref().clone())
}

/// The database handle handed to session extractors and handlers.
///
/// Statements go to the pool by default; while the audit coordinator holds a
/// transaction for this request, they go through that transaction instead,
/// making handler writes and audit writes atomic. Strictly request-scoped,
/// never cached or shared across requests.
#[derive(Clone)]
pub struct DbHandle {
    conn: Connection,
}

#[derive(Clone)]
enum Connection {
    Pool(Arc<dyn Database>),
    Transaction(Arc<dyn DbTransaction>),
}

impl DbHandle {
    pub fn pooled(db: Arc<dyn Database>) -> Self {
        DbHandle {
            conn: Connection::Pool(db),
        }
    }

    pub fn transactional(tx: Arc<dyn DbTransaction>) -> Self {
        DbHandle {
            conn: Connection::Transaction(tx),
        }
    }

    /// Whether statements currently run inside a transaction.
    pub fn in_transaction(&self) -> bool {
        matches!(self.conn, Connection::Transaction(_))
    }

    pub async fn execute(&self, statement: &str, params: &[Value]) -> anyhow::Result<u64> {
        match &self.conn {
            Connection::Pool(db) => db.execute(statement, params).await,
            Connection::Transaction(tx) => tx.execute(statement, params).await,
        }
    }

    pub async fn query(&self, statement: &str, params: &[Value]) -> anyhow::Result<Vec<Value>> {
        match &self.conn {
            Connection::Pool(db) => db.query(statement, params).await,
            Connection::Transaction(tx) => tx.query(statement, params).await,
        }
    }

    /// Opens a transaction-backed handle over the same connection.
    ///
    /// If this handle already runs inside a transaction, that transaction is
    /// reused rather than nested.
    pub async fn begin(&self) -> anyhow::Result<(DbHandle, Arc<dyn DbTransaction>)> {
        match &self.conn {
            Connection::Pool(db) => {
                let tx = db.begin().await?;
                Ok((DbHandle::transactional(tx.clone()), tx))
            }
            Connection::Transaction(tx) => Ok((self.clone(), tx.clone())),
        }
    }

    pub(crate) fn transaction(&self) -> Option<Arc<dyn DbTransaction>> {
        match &self.conn {
            Connection::Pool(_) => None,
            Connection::Transaction(tx) => Some(tx.clone()),
        }
    }
}
