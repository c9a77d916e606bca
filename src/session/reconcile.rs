//! Post-connect reconciliation.
//!
//! The last configuration and hot-path rules the companion acknowledged are
//! remembered so a fresh connection can be brought back to the same
//! server-side state before the session is declared Ready.

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{LinkError, Result};
use crate::ipc::{Request, Response, RpcExecutor};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileSnapshot {
    pub config: Option<Value>,
    pub hot_path_rules: Option<Value>,
}

/// Last acknowledged companion configuration.
#[derive(Debug, Default)]
pub struct ReconcileStore {
    inner: Mutex<ReconcileSnapshot>,
}

impl ReconcileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember_config(&self, config: Value) {
        self.inner.lock().config = Some(config);
    }

    pub fn remember_hot_path(&self, rules: Value) {
        self.inner.lock().hot_path_rules = Some(rules);
    }

    pub fn snapshot(&self) -> ReconcileSnapshot {
        self.inner.lock().clone()
    }

    pub fn clear(&self) {
        *self.inner.lock() = ReconcileSnapshot::default();
    }
}

async fn expect_ack(executor: &dyn RpcExecutor, request: Request) -> Result<()> {
    let method = request.method();
    match executor.execute(request).await? {
        Response::Ack => Ok(()),
        other => Err(LinkError::Protocol(format!("{method}: expected ack, got {other:?}"))),
    }
}

/// Register push callbacks, then replay remembered configuration. Any
/// failure aborts reconciliation.
pub async fn reconcile(executor: &dyn RpcExecutor, store: &ReconcileStore) -> Result<()> {
    expect_ack(executor, Request::RegisterStatusCallback).await?;
    expect_ack(executor, Request::RegisterBufferReleaseCallback).await?;

    let snapshot = store.snapshot();
    if let Some(config) = snapshot.config {
        expect_ack(executor, Request::Configure { config }).await?;
    }
    if let Some(rules) = snapshot.hot_path_rules {
        expect_ack(executor, Request::ConfigureHotPath { rules }).await?;
    }
    tracing::debug!("reconciliation complete");
    Ok(())
}
