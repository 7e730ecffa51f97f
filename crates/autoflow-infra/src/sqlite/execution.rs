//! SQLite execution persister.
//!
//! One row per execution. `status`, `input_data` and `error_message` are
//! top-level columns; `variables`, `results` and `history` are serialized
//! together into the opaque `state` blob.

use std::collections::HashMap;

use autoflow_core::repository::execution::ExecutionPersister;
use autoflow_types::error::RepositoryError;
use autoflow_types::execution::{
    ExecutionContext, HeldJoin, StepExecutionRecord, StepResult, WorkflowStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime};

/// SQLite-backed implementation of `ExecutionPersister`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// State blob
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StateRef<'a> {
    variables: &'a HashMap<String, Value>,
    results: &'a HashMap<String, StepResult>,
    history: &'a [StepExecutionRecord],
    held_joins: &'a [HeldJoin],
}

#[derive(Deserialize)]
struct State {
    #[serde(default)]
    variables: HashMap<String, Value>,
    #[serde(default)]
    results: HashMap<String, StepResult>,
    #[serde(default)]
    history: Vec<StepExecutionRecord>,
    #[serde(default)]
    held_joins: Vec<HeldJoin>,
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct ExecutionRow {
    execution_id: String,
    workflow_id: String,
    status: String,
    input_data: String,
    state: String,
    error_message: Option<String>,
    user_id: Option<String>,
    current_step: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            input_data: row.try_get("input_data")?,
            state: row.try_get("state")?,
            error_message: row.try_get("error_message")?,
            user_id: row.try_get("user_id")?,
            current_step: row.try_get("current_step")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_context(self) -> Result<ExecutionContext, RepositoryError> {
        let execution_id = self
            .execution_id
            .parse::<Uuid>()
            .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?;
        let status: WorkflowStatus = self
            .status
            .parse()
            .map_err(RepositoryError::Query)?;
        let input_data: Value = serde_json::from_str(&self.input_data)
            .map_err(|e| RepositoryError::Query(format!("invalid input_data JSON: {e}")))?;
        let state: State = serde_json::from_str(&self.state)
            .map_err(|e| RepositoryError::Query(format!("invalid execution state JSON: {e}")))?;
        let started_at = parse_datetime(&self.started_at)?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?;

        Ok(ExecutionContext {
            execution_id,
            workflow_id: self.workflow_id,
            input_data,
            variables: state.variables,
            results: state.results,
            history: state.history,
            status,
            started_at,
            completed_at,
            current_step: self.current_step,
            error_message: self.error_message,
            user_id: self.user_id,
            held_joins: state.held_joins,
        })
    }
}

fn rows_to_contexts(
    rows: &[sqlx::sqlite::SqliteRow],
) -> Result<Vec<ExecutionContext>, RepositoryError> {
    rows.iter()
        .map(|row| {
            ExecutionRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_context()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ExecutionPersister impl
// ---------------------------------------------------------------------------

impl ExecutionPersister for SqliteExecutionRepository {
    async fn save(&self, ctx: &ExecutionContext) -> Result<(), RepositoryError> {
        let state = serde_json::to_string(&StateRef {
            variables: &ctx.variables,
            results: &ctx.results,
            history: &ctx.history,
            held_joins: &ctx.held_joins,
        })
        .map_err(|e| RepositoryError::Query(format!("serialize execution state: {e}")))?;
        let input_data = serde_json::to_string(&ctx.input_data)
            .map_err(|e| RepositoryError::Query(format!("serialize input_data: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO executions (
                   execution_id, workflow_id, status, input_data, state, error_message,
                   user_id, current_step, started_at, completed_at, updated_at
               )
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(execution_id) DO UPDATE SET
                 status = excluded.status,
                 input_data = excluded.input_data,
                 state = excluded.state,
                 error_message = excluded.error_message,
                 user_id = excluded.user_id,
                 current_step = excluded.current_step,
                 completed_at = excluded.completed_at,
                 updated_at = excluded.updated_at"#,
        )
        .bind(ctx.execution_id.to_string())
        .bind(&ctx.workflow_id)
        .bind(ctx.status.as_str())
        .bind(&input_data)
        .bind(&state)
        .bind(&ctx.error_message)
        .bind(&ctx.user_id)
        .bind(&ctx.current_step)
        .bind(format_datetime(&ctx.started_at))
        .bind(ctx.completed_at.as_ref().map(format_datetime))
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(
            execution_id = %ctx.execution_id,
            status = %ctx.status,
            "execution snapshot saved"
        );
        Ok(())
    }

    async fn load(&self, execution_id: &Uuid) -> Result<Option<ExecutionContext>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_context()?))
            }
            None => Ok(None),
        }
    }

    async fn list_by_status(
        &self,
        status: WorkflowStatus,
        limit: u32,
    ) -> Result<Vec<ExecutionContext>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE status = ? ORDER BY started_at DESC, execution_id DESC LIMIT ?",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_to_contexts(&rows)
    }
}
