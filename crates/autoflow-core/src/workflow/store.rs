//! In-memory registry of workflow definitions.
//!
//! Read-mostly: every step execution looks definitions up, while writes only
//! happen on registration or dynamic generation. Definitions are stored as
//! `Arc`s so readers hold an immutable snapshot that a concurrent
//! re-registration can never mutate underneath them.

use std::collections::HashMap;
use std::sync::Arc;

use autoflow_types::workflow::WorkflowDefinition;
use tokio::sync::RwLock;

use super::definition::WorkflowError;
use super::graph::{GraphReport, validate_definition};

/// Registry of immutable workflow definitions keyed by workflow id.
#[derive(Debug, Default)]
pub struct WorkflowStore {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a definition, replacing any previous one with the
    /// same id.
    pub async fn register(&self, def: WorkflowDefinition) -> Result<GraphReport, WorkflowError> {
        let report = validate_definition(&def)?;
        if !report.unreachable.is_empty() {
            tracing::warn!(
                workflow_id = %def.id,
                unreachable = ?report.unreachable,
                "workflow has steps unreachable from start_step"
            );
        }

        let id = def.id.clone();
        let replaced = self
            .definitions
            .write()
            .await
            .insert(id.clone(), Arc::new(def))
            .is_some();
        tracing::info!(workflow_id = %id, replaced, "registered workflow");
        Ok(report)
    }

    pub async fn get(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        self.definitions
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))
    }

    /// All definitions declaring `event_type` among their triggers.
    pub async fn find_by_trigger(&self, event_type: &str) -> Vec<Arc<WorkflowDefinition>> {
        let mut matches: Vec<_> = self
            .definitions
            .read()
            .await
            .values()
            .filter(|d| d.has_trigger(event_type))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches
    }

    /// All definitions ordered by id.
    pub async fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut all: Vec<_> = self.definitions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Remove a definition. In-flight executions keep their snapshot.
    pub async fn remove(&self, workflow_id: &str) -> bool {
        self.definitions.write().await.remove(workflow_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.definitions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.definitions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_types::workflow::{StepType, WorkflowStep};

    fn def(id: &str, triggers: &[&str]) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            version: "1.0.0".to_string(),
            start_step: "only".to_string(),
            steps: vec![WorkflowStep::new("only", StepType::Slack)],
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn register_then_get() {
        let store = WorkflowStore::new();
        store.register(def("a", &[])).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().id, "a");
        assert!(matches!(
            store.get("b").await,
            Err(WorkflowError::NotFound(id)) if id == "b"
        ));
    }

    #[tokio::test]
    async fn register_rejects_invalid_definition() {
        let store = WorkflowStore::new();
        let mut bad = def("bad", &[]);
        bad.steps[0].next_steps = vec!["ghost".into()];
        assert!(store.register(bad).await.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn reregistration_replaces_without_mutating_readers() {
        let store = WorkflowStore::new();
        store.register(def("a", &[])).await.unwrap();
        let old = store.get("a").await.unwrap();

        let mut updated = def("a", &[]);
        updated.version = "2.0.0".into();
        store.register(updated).await.unwrap();

        assert_eq!(old.version, "1.0.0");
        assert_eq!(store.get("a").await.unwrap().version, "2.0.0");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn find_by_trigger_matches_declared_events() {
        let store = WorkflowStore::new();
        store.register(def("orders", &["SHOPIFY_ORDER_CREATED"])).await.unwrap();
        store.register(def("refunds", &["SHOPIFY_REFUND"])).await.unwrap();
        store
            .register(def("audit", &["SHOPIFY_ORDER_CREATED", "SHOPIFY_REFUND"]))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .find_by_trigger("SHOPIFY_ORDER_CREATED")
            .await
            .iter()
            .map(|d| d.id.clone())
            .collect();
        assert_eq!(ids, vec!["audit", "orders"]);
        assert!(store.find_by_trigger("NOPE").await.is_empty());
    }

    #[tokio::test]
    async fn remove_and_list() {
        let store = WorkflowStore::new();
        store.register(def("b", &[])).await.unwrap();
        store.register(def("a", &[])).await.unwrap();
        let ids: Vec<String> = store.list().await.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(store.remove("a").await);
        assert!(!store.remove("a").await);
        assert_eq!(store.len().await, 1);
    }
}
