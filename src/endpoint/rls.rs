//! Row-level-security scope injection.
//!
//! [`with_rls_context`] wraps a database handle so that every statement
//! issued by the wrapped closure runs inside a transaction carrying the
//! request's security-scoping settings (`set_config('<prefix>.<key>', ...,
//! true)`), and nothing issued outside the closure is scoped. The settings
//! are transaction-local, so the wrap releases deterministically on commit,
//! rollback, or drop, even when the closure fails mid-way.
//!
//! An [`RlsContext`] is derived per request and never cached; see
//! [`crate::endpoint`] for how endpoints declare the extractor.

use crate::db::DbHandle;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;

/// The security-scoping settings of one request.
///
/// Keys are applied in lexicographic order so the statement sequence is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RlsContext {
    values: BTreeMap<String, String>,
}

impl RlsContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl ToString, value: impl ToString) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }
}

/// Runs `f` with a handle whose statements are all scoped by `rls`.
///
/// If the given handle is not yet transactional, a transaction is opened and
/// committed after `f` succeeds (or rolled back when it fails). If the
/// handle already runs inside a transaction, the settings are applied to
/// that transaction and its owner remains responsible for finishing it.
pub async fn with_rls_context<T, F, Fut>(
    db: &DbHandle,
    rls: &RlsContext,
    prefix: &str,
    f: F,
) -> anyhow::Result<T>
where
    F: FnOnce(DbHandle) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if rls.is_empty() {
        return f(db.clone()).await;
    }

    let owns_transaction = !db.in_transaction();
    let (scoped, transaction) = db.begin().await?;

    for (key, value) in rls.iter() {
        scoped
            .execute(
                &format!("select set_config('{prefix}.{key}', $1, true)"),
                &[json!(value)],
            )
            .await?;
    }

    match f(scoped).await {
        Ok(result) => {
            if owns_transaction {
                transaction.commit().await?;
            }
            Ok(result)
        }
        Err(err) => {
            if owns_transaction {
                if let Err(rollback_err) = transaction.rollback().await {
                    tracing::warn!("Failed to roll back scoped transaction: {:#}", rollback_err);
                }
            }
            Err(err)
        }
    }
}
