//! Execution persister trait and an in-memory implementation.
//!
//! The orchestrator snapshots an `ExecutionContext` through this trait after
//! every terminal transition and before suspending for approval, and loads
//! paused contexts back on resume.

use std::sync::Arc;

use autoflow_types::error::RepositoryError;
use autoflow_types::execution::{ExecutionContext, WorkflowStatus};
use dashmap::DashMap;
use uuid::Uuid;

/// Durable storage for execution snapshots.
///
/// Implementations store `variables`, `results` and `history` as an opaque
/// blob next to top-level `status`, `input_data` and `error_message` fields.
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionPersister: Send + Sync {
    /// Insert or replace the snapshot keyed by `ctx.execution_id`.
    fn save(
        &self,
        ctx: &ExecutionContext,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load a snapshot. `Ok(None)` when the id is unknown.
    fn load(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionContext>, RepositoryError>> + Send;

    /// Most recent executions in the given status, newest first.
    fn list_by_status(
        &self,
        status: WorkflowStatus,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionContext>, RepositoryError>> + Send;
}

impl<T: ExecutionPersister> ExecutionPersister for Arc<T> {
    fn save(
        &self,
        ctx: &ExecutionContext,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).save(ctx)
    }

    fn load(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionContext>, RepositoryError>> + Send
    {
        (**self).load(execution_id)
    }

    fn list_by_status(
        &self,
        status: WorkflowStatus,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionContext>, RepositoryError>> + Send
    {
        (**self).list_by_status(status, limit)
    }
}

// ---------------------------------------------------------------------------
// InMemoryPersister
// ---------------------------------------------------------------------------

/// Process-local persister for tests and ephemeral runs.
///
/// Snapshots are stored as serialized JSON so a load always yields a fresh
/// copy, the same as a real backend would.
#[derive(Debug, Default)]
pub struct InMemoryPersister {
    snapshots: DashMap<Uuid, String>,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn decode(json: &str) -> Result<ExecutionContext, RepositoryError> {
        serde_json::from_str(json)
            .map_err(|e| RepositoryError::Query(format!("invalid execution snapshot: {e}")))
    }
}

impl ExecutionPersister for InMemoryPersister {
    async fn save(&self, ctx: &ExecutionContext) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(ctx)
            .map_err(|e| RepositoryError::Query(format!("serialize execution: {e}")))?;
        self.snapshots.insert(ctx.execution_id, json);
        Ok(())
    }

    async fn load(&self, execution_id: &Uuid) -> Result<Option<ExecutionContext>, RepositoryError> {
        let json = self.snapshots.get(execution_id).map(|e| e.value().clone());
        json.as_deref().map(Self::decode).transpose()
    }

    async fn list_by_status(
        &self,
        status: WorkflowStatus,
        limit: u32,
    ) -> Result<Vec<ExecutionContext>, RepositoryError> {
        let encoded: Vec<String> = self
            .snapshots
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut matching = Vec::new();
        for json in &encoded {
            let ctx = Self::decode(json)?;
            if ctx.status == status {
                matching.push(ctx);
            }
        }
        // UUIDv7 ids sort by creation time.
        matching.sort_by(|a, b| b.execution_id.cmp(&a.execution_id));
        matching.truncate(limit as usize);
        Ok(matching)
    }
}
