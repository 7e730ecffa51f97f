//! Workflow definition repository trait.
//!
//! The graph store keeps definitions in memory; this trait lets them survive
//! a restart. The infrastructure layer implements it with SQLite.

use autoflow_types::error::RepositoryError;
use autoflow_types::workflow::WorkflowDefinition;

/// Repository trait for workflow definition persistence.
pub trait WorkflowRepository: Send + Sync {
    /// Upsert a workflow definition (insert or replace by id).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_definition(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// All stored definitions ordered by id.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a definition by id. Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
