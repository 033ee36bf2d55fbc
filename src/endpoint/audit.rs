//! Audit storage contract and the audit transaction coordinator.
//!
//! An audit is an immutable record of a business-significant action, written
//! transactionally alongside the action itself. Endpoints declare audits
//! either as data-driven mappings evaluated against the handler output after
//! a successful run, or raise them manually through the [`Auditor`] handed
//! to the handler.
//!
//! The coordinator decides transaction sharing by *service name*, not by
//! object identity: when the audit storage's backing database service is the
//! very service the endpoint declared as its database, handler writes and
//! audit writes run in one transaction and commit or roll back together.
//! With different services the two are independent units: handler effects
//! are not undone when only the audit write fails, and vice versa. That
//! boundary is accepted, not accidental.

use crate::context;
use crate::db::DbHandle;
use crate::registry::{ResolvedServices, ServiceDescriptor};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;

/// One persisted audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_type: String,
    pub payload: Value,
    pub entity_table: Option<String>,
    pub entity_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
    /// Id of the request that raised the record, taken from the ambient
    /// request context when one is bound.
    pub request_id: Option<String>,
}

impl AuditRecord {
    pub fn now(
        audit_type: impl ToString,
        payload: Value,
        entity_table: Option<String>,
        entity_id: Option<String>,
    ) -> Self {
        AuditRecord {
            audit_type: audit_type.to_string(),
            payload,
            entity_table,
            entity_id,
            recorded_at: Utc::now(),
            request_id: context::request_id().ok(),
        }
    }
}

/// Filter for reading audit records back.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub audit_type: Option<String>,
    pub entity_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Where audit records are persisted.
///
/// `write` receives the coordinator's transaction-bearing handle when the
/// storage declared a backing database service, `None` otherwise (e.g. a
/// storage shipping records to an external sink).
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Name of the registry service backing this storage, if any.
    ///
    /// Used by the coordinator to decide transaction sharing with the
    /// endpoint's database.
    fn database_service_name(&self) -> Option<&'static str> {
        None
    }

    async fn write(&self, db: Option<&DbHandle>, records: &[AuditRecord]) -> anyhow::Result<()>;

    async fn query(
        &self,
        db: Option<&DbHandle>,
        filter: &AuditQuery,
    ) -> anyhow::Result<Vec<AuditRecord>>;
}

/// Descriptor for an audit storage registered in the service registry.
pub type AuditStorageDescriptor = ServiceDescriptor<Arc<dyn AuditStorage>>;

/// Retrieves the audit storage a resolved descriptor points at.
pub fn resolve_audit_storage(
    services: &ResolvedServices,
    descriptor: &AuditStorageDescriptor,
) -> anyhow::Result<Arc<dyn AuditStorage>> {
    Ok(services.get(descriptor)?.as_ref().clone())
}

/// SQL-backed audit storage writing into a single table through the
/// endpoint's database contract.
pub struct SqlAuditStorage {
    table: String,
    database_service_name: Option<&'static str>,
}

impl SqlAuditStorage {
    pub fn new(table: impl ToString) -> Self {
        SqlAuditStorage {
            table: table.to_string(),
            database_service_name: None,
        }
    }

    /// Declares the registry service this storage writes through.
    pub fn backed_by(mut self, service_name: &'static str) -> Self {
        self.database_service_name = Some(service_name);
        self
    }
}

#[async_trait]
impl AuditStorage for SqlAuditStorage {
    fn database_service_name(&self) -> Option<&'static str> {
        self.database_service_name
    }

    async fn write(&self, db: Option<&DbHandle>, records: &[AuditRecord]) -> anyhow::Result<()> {
        let db = db.context("SQL audit storage requires a backing database handle")?;

        for record in records {
            db.execute(
                &format!(
                    "insert into {} (audit_type, payload, entity_table, entity_id, recorded_at, request_id) \
                     values ($1, $2, $3, $4, $5, $6)",
                    self.table
                ),
                &[
                    json!(record.audit_type),
                    record.payload.clone(),
                    json!(record.entity_table),
                    json!(record.entity_id),
                    json!(record.recorded_at),
                    json!(record.request_id),
                ],
            )
            .await
            .context("Failed to write audit record")?;
        }

        Ok(())
    }

    async fn query(
        &self,
        db: Option<&DbHandle>,
        filter: &AuditQuery,
    ) -> anyhow::Result<Vec<AuditRecord>> {
        let db = db.context("SQL audit storage requires a backing database handle")?;

        let mut statement = format!(
            "select audit_type, payload, entity_table, entity_id, recorded_at, request_id from {}",
            self.table
        );
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if let Some(audit_type) = &filter.audit_type {
            params.push(json!(audit_type));
            clauses.push(format!("audit_type = ${}", params.len()));
        }
        if let Some(entity_id) = &filter.entity_id {
            params.push(json!(entity_id));
            clauses.push(format!("entity_id = ${}", params.len()));
        }
        if let Some(since) = &filter.since {
            params.push(json!(since));
            clauses.push(format!("recorded_at >= ${}", params.len()));
        }
        if !clauses.is_empty() {
            statement.push_str(" where ");
            statement.push_str(&clauses.join(" and "));
        }
        statement.push_str(" order by recorded_at desc");
        if let Some(limit) = filter.limit {
            statement.push_str(&format!(" limit {limit}"));
        }

        let rows = db.query(&statement, &params).await?;
        rows.into_iter()
            .map(|row| serde_json::from_value(row).context("Malformed audit row"))
            .collect()
    }
}

/// A data-driven audit rule evaluated against the handler output.
#[derive(Clone)]
pub struct AuditMapping {
    audit_type: &'static str,
    entity_table: Option<&'static str>,
    payload: Arc<dyn Fn(&Value) -> Value + Send + Sync>,
    when: Option<Arc<dyn Fn(&Value) -> bool + Send + Sync>>,
    entity_id: Option<Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>>,
}

impl AuditMapping {
    pub fn new(
        audit_type: &'static str,
        payload: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        AuditMapping {
            audit_type,
            entity_table: None,
            payload: Arc::new(payload),
            when: None,
            entity_id: None,
        }
    }

    /// Suppresses the record when the predicate returns false.
    pub fn when(mut self, predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.when = Some(Arc::new(predicate));
        self
    }

    pub fn entity_id(
        mut self,
        entity_id: impl Fn(&Value) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.entity_id = Some(Arc::new(entity_id));
        self
    }

    pub fn entity_table(mut self, table: &'static str) -> Self {
        self.entity_table = Some(table);
        self
    }

    fn evaluate(&self, output: &Value) -> Option<AuditRecord> {
        if let Some(when) = &self.when
            && !when(output)
        {
            return None;
        }

        Some(AuditRecord::now(
            self.audit_type,
            (self.payload)(output),
            self.entity_table.map(str::to_string),
            self.entity_id.as_ref().and_then(|derive| derive(output)),
        ))
    }
}

/// Evaluates every mapping against the output, in declaration order.
pub(crate) fn evaluate_audit_mappings(mappings: &[AuditMapping], output: &Value) -> Vec<AuditRecord> {
    mappings
        .iter()
        .filter_map(|mapping| mapping.evaluate(output))
        .collect()
}

/// Handle for raising audit records from inside a handler.
///
/// Records are written immediately into the coordinator's transaction, so a
/// later handler failure rolls them back along with the handler's effects
/// (shared-transaction case).
#[derive(Clone)]
pub struct Auditor {
    storage: Arc<dyn AuditStorage>,
    db: Option<DbHandle>,
}

/// Optional attributes of a manually raised audit record.
#[derive(Debug, Clone, Default)]
pub struct AuditOptions {
    pub entity_table: Option<String>,
    pub entity_id: Option<String>,
}

impl Auditor {
    pub async fn audit(
        &self,
        audit_type: &str,
        payload: Value,
        options: AuditOptions,
    ) -> anyhow::Result<()> {
        let record = AuditRecord::now(audit_type, payload, options.entity_table, options.entity_id);
        self.storage.write(self.db.as_ref(), std::slice::from_ref(&record)).await
    }

    pub async fn query(&self, filter: &AuditQuery) -> anyhow::Result<Vec<AuditRecord>> {
        self.storage.query(self.db.as_ref(), filter).await
    }
}

/// What the coordinator needs to know about the endpoint's audit setup.
pub struct AuditContext {
    pub storage: Arc<dyn AuditStorage>,
    /// Handle on the storage's backing database service, when it has one
    /// and that service differs from the endpoint's database.
    pub backing_db: Option<DbHandle>,
    /// True when the backing service *is* the endpoint's database service.
    pub shares_endpoint_db: bool,
}

/// Runs `body` inside the audit transaction, then persists the declarative
/// records produced by `after_success`.
///
/// Without an audit setup, `body` runs directly with no auditor and
/// `after_success` is skipped. With one, a transaction is opened on the
/// storage's backing connection; when that connection is shared with the
/// endpoint's database, the handler's `DbHandle` is swapped for the same
/// transaction. The transaction commits only after `body` succeeded and the
/// declarative records are written; any failure rolls everything back. If
/// the handle was already transactional (e.g. the RLS wrap opened the
/// transaction), its owner remains responsible for finishing it.
pub async fn execute_with_audit_transaction<T, B, Fut, A>(
    audit: Option<AuditContext>,
    db: Option<DbHandle>,
    body: B,
    after_success: A,
) -> anyhow::Result<T>
where
    B: FnOnce(Option<Auditor>, Option<DbHandle>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    A: FnOnce(&T) -> Vec<AuditRecord>,
{
    let Some(audit) = audit else {
        return body(None, db).await;
    };

    let backing = if audit.shares_endpoint_db {
        db.clone()
    } else {
        audit.backing_db.clone()
    };

    let (audit_db, transaction, owns_transaction) = match &backing {
        Some(handle) => {
            let owns = !handle.in_transaction();
            let (tx_handle, tx) = handle.begin().await?;
            (Some(tx_handle), Some(tx), owns)
        }
        None => (None, None, false),
    };

    // In the shared case the handler writes through the audit transaction.
    let handler_db = if audit.shares_endpoint_db && audit_db.is_some() {
        audit_db.clone()
    } else {
        db
    };

    let auditor = Auditor {
        storage: audit.storage.clone(),
        db: audit_db.clone(),
    };

    match body(Some(auditor), handler_db).await {
        Ok(result) => {
            let records = after_success(&result);
            if !records.is_empty() {
                audit
                    .storage
                    .write(audit_db.as_ref(), &records)
                    .await
                    .context("Failed to persist declarative audit records")?;
            }
            if owns_transaction
                && let Some(tx) = transaction
            {
                tx.commit().await.context("Failed to commit audit transaction")?;
            }
            Ok(result)
        }
        Err(err) => {
            if owns_transaction
                && let Some(tx) = transaction
                && let Err(rollback_err) = tx.rollback().await
            {
                tracing::warn!("Failed to roll back audit transaction: {:#}", rollback_err);
            }
            Err(err)
        }
    }
}
