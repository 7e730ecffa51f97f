//! Application state wiring the engine to its infrastructure.
//!
//! The orchestrator is generic over its persister; `AppState` pins it to the
//! SQLite execution repository and keeps the definition repository in sync
//! with the in-memory graph store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use autoflow_core::repository::workflow::WorkflowRepository;
use autoflow_core::workflow::definition::{WorkflowError, discover_workflows};
use autoflow_core::workflow::dispatcher::HandlerRegistry;
use autoflow_core::workflow::fallback::FallbackCoordinator;
use autoflow_core::workflow::graph::GraphReport;
use autoflow_core::workflow::orchestrator::Orchestrator;
use autoflow_core::workflow::planner::BoxPlanner;
use autoflow_infra::config::load_engine_config;
use autoflow_infra::fallback::RemoteFallbackAgent;
use autoflow_infra::handler::HttpRequestHandler;
use autoflow_infra::planner::RemotePlanner;
use autoflow_infra::sqlite::execution::SqliteExecutionRepository;
use autoflow_infra::sqlite::pool::{DatabasePool, database_url};
use autoflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use autoflow_types::config::EngineConfig;
use autoflow_types::workflow::{StepType, WorkflowDefinition};

/// The orchestrator as wired by this application.
pub type Engine = Orchestrator<SqliteExecutionRepository>;

/// Shared application state used by both CLI commands and REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub workflow_repo: Arc<SqliteWorkflowRepository>,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the database under `data_dir`, load config and wire the engine.
    pub async fn init(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;
        let config = load_engine_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;
        Self::from_parts(data_dir, config, db_pool).await
    }

    pub async fn from_parts(
        data_dir: PathBuf,
        config: EngineConfig,
        db_pool: DatabasePool,
    ) -> anyhow::Result<Self> {
        let registry = HandlerRegistry::with_builtins();
        registry.register_handler(StepType::HttpRequest, HttpRequestHandler::new()?);

        let mut fallback = FallbackCoordinator::new();
        if let Some(agent) = RemoteFallbackAgent::from_config(&config.fallback)? {
            tracing::info!(endpoint = agent.endpoint(), "remote fallback agent enabled");
            fallback = fallback.with_agent(agent);
        }

        let mut builder =
            Orchestrator::builder(SqliteExecutionRepository::new(db_pool.clone()))
                .config(&config)
                .registry(Arc::new(registry))
                .fallback(fallback);
        if let Some(planner) = RemotePlanner::from_config(&config.planner)? {
            builder = builder.planner(BoxPlanner::new(planner));
        }

        let state = Self {
            engine: builder.build(),
            workflow_repo: Arc::new(SqliteWorkflowRepository::new(db_pool)),
            config: Arc::new(config),
            data_dir,
        };
        state.restore_definitions().await?;
        if let Some(dir) = state.config.workflows_dir.clone() {
            state.register_directory(&dir).await?;
        }
        Ok(state)
    }

    /// Validate, register in the graph store and persist a definition.
    pub async fn register_definition(
        &self,
        def: WorkflowDefinition,
    ) -> Result<GraphReport, WorkflowError> {
        let report = self.engine.store().register(def.clone()).await?;
        self.workflow_repo.save_definition(&def).await?;
        Ok(report)
    }

    /// Drop a definition from both the graph store and the database.
    pub async fn remove_definition(&self, workflow_id: &str) -> Result<bool, WorkflowError> {
        let in_store = self.engine.store().remove(workflow_id).await;
        let in_db = self.workflow_repo.delete_definition(workflow_id).await?;
        Ok(in_store || in_db)
    }

    /// Ask the planner for a new workflow and persist it.
    pub async fn generate_definition(
        &self,
        query: &str,
        provider_hint: Option<&str>,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let def = self.engine.generate_workflow(query, provider_hint).await?;
        self.workflow_repo.save_definition(&def).await?;
        Ok(def)
    }

    async fn restore_definitions(&self) -> Result<(), WorkflowError> {
        let stored = self.workflow_repo.list_definitions().await?;
        let total = stored.len();
        for def in stored {
            let id = def.id.clone();
            if let Err(e) = self.engine.store().register(def).await {
                tracing::warn!(workflow_id = %id, error = %e, "stored workflow no longer valid, skipping");
            }
        }
        tracing::debug!(count = total, "restored workflow definitions");
        Ok(())
    }

    async fn register_directory(&self, dir: &Path) -> Result<(), WorkflowError> {
        for (path, def) in discover_workflows(dir)? {
            let id = def.id.clone();
            match self.register_definition(def).await {
                Ok(_) => tracing::info!(workflow_id = %id, ?path, "registered workflow file"),
                Err(e) => tracing::warn!(?path, error = %e, "failed to register workflow file"),
            }
        }
        Ok(())
    }
}
