//! SQLite workflow definition repository.
//!
//! Definitions are stored as JSON blobs keyed by workflow id so the graph
//! store can be repopulated at startup.

use autoflow_core::repository::workflow::WorkflowRepository;
use autoflow_types::error::RepositoryError;
use autoflow_types::workflow::WorkflowDefinition;
use chrono::Utc;
use sqlx::Row;

use super::format_datetime;
use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let raw: &str = row
        .try_get("definition")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    serde_json::from_str(raw)
        .map_err(|e| RepositoryError::Query(format!("stored workflow is not valid JSON: {e}")))
}

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, name, version, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 version = excluded.version,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&def.id)
        .bind(&def.name)
        .bind(&def.version)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode).transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflows ORDER BY id")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(decode).collect()
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
