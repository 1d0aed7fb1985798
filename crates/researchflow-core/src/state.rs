//! Shared application state for the HTTP server and the CLI.

use std::sync::Arc;

use crate::agents::{
    AgentRegistry, CalendarAgent, CoordinatorAgent, DeliveryAgent, ExtractionAgent,
    PhenotypeAgent, QaAgent, RequirementsAgent, RetryPolicy,
};
use crate::cohort::{CohortBackend, CohortCounter, SqlCohortCounter, ViewDefinitionCohortCounter};
use crate::config::{AppConfig, LlmConfig};
use crate::db::Database;
use crate::error::ServerError;
use crate::llm::{AnthropicClient, LlmClient, LlmRouter, OpenAiCompatibleClient};
use crate::orchestration::Orchestrator;
use crate::sql::SqlSandbox;
use crate::viewdef::{
    FhirHttpClient, FhirSource, MaterializedViewStore, ViewDefinitionManager, ViewRunner,
    WarehouseFhirSource,
};
use crate::workflow::{WorkflowDefinition, WorkflowEngine};

/// Shared state accessible by all API handlers and CLI commands.
pub struct AppStateInner {
    pub config: AppConfig,
    pub db: Database,
    pub warehouse: Database,
    pub sandbox: SqlSandbox,
    pub llm: LlmRouter,
    pub orchestrator: Orchestrator,
    pub view_manager: ViewDefinitionManager,
    pub view_runner: Arc<ViewRunner>,
    pub materialized_views: MaterializedViewStore,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(config: AppConfig) -> Result<Self, ServerError> {
        AppStateBuilder::new(config).build()
    }
}

/// Router over the configured providers. Missing providers stay `None`;
/// agents fall back to heuristics and templates.
pub fn llm_router(config: &LlmConfig) -> LlmRouter {
    let primary = config
        .primary
        .clone()
        .map(|c| Arc::new(AnthropicClient::new(c)) as Arc<dyn LlmClient>);
    let secondary = config
        .secondary
        .clone()
        .map(|c| Arc::new(OpenAiCompatibleClient::new(c)) as Arc<dyn LlmClient>);
    LlmRouter::new(primary, secondary)
}

/// The seven workflow agents, each behind a runner with `policy`.
pub fn default_agents(
    config: &AppConfig,
    llm: &LlmRouter,
    sandbox: &SqlSandbox,
    cohort_counter: Arc<dyn CohortCounter>,
    policy: RetryPolicy,
) -> AgentRegistry {
    let mut agents = AgentRegistry::new();
    agents.register(Arc::new(RequirementsAgent::new(llm.clone())), policy);
    agents.register(Arc::new(PhenotypeAgent::new(cohort_counter)), policy);
    agents.register(Arc::new(CalendarAgent::new(llm.clone())), policy);
    agents.register(Arc::new(ExtractionAgent::new(sandbox.clone())), policy);
    agents.register(Arc::new(QaAgent::new()), policy);
    agents.register(Arc::new(DeliveryAgent::new(config.delivery_dir.clone())), policy);
    agents.register(Arc::new(CoordinatorAgent::new(llm.clone())), policy);
    agents
}

/// Builds [`AppStateInner`] from config, with hooks to swap in test doubles.
pub struct AppStateBuilder {
    config: AppConfig,
    db: Option<Database>,
    warehouse: Option<Database>,
    llm: Option<LlmRouter>,
    fhir_source: Option<Arc<dyn FhirSource>>,
    cohort_counter: Option<Arc<dyn CohortCounter>>,
    engine: Option<WorkflowEngine>,
}

impl AppStateBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            db: None,
            warehouse: None,
            llm: None,
            fhir_source: None,
            cohort_counter: None,
            engine: None,
        }
    }

    pub fn database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn warehouse(mut self, db: Database) -> Self {
        self.warehouse = Some(db);
        self
    }

    pub fn llm(mut self, llm: LlmRouter) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn fhir_source(mut self, source: Arc<dyn FhirSource>) -> Self {
        self.fhir_source = Some(source);
        self
    }

    pub fn cohort_counter(mut self, counter: Arc<dyn CohortCounter>) -> Self {
        self.cohort_counter = Some(counter);
        self
    }

    pub fn workflow_engine(mut self, engine: WorkflowEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> Result<AppStateInner, ServerError> {
        let config = self.config;

        let db = match self.db {
            Some(db) => db,
            None => Database::open_url(&config.database_url)?,
        };
        let warehouse = match self.warehouse {
            Some(w) => w,
            None if config.shared_warehouse() => db.clone(),
            None => Database::open_url(config.warehouse_url())?,
        };
        let sandbox = SqlSandbox::new(warehouse.clone());
        let llm = self.llm.unwrap_or_else(|| llm_router(&config.llm));
        if !llm.has_primary() {
            tracing::warn!("[AppState] No primary LLM configured; agents use heuristic fallbacks");
        }

        let source: Arc<dyn FhirSource> = match (self.fhir_source, &config.fhir_base_url) {
            (Some(source), _) => source,
            (None, Some(url)) => Arc::new(FhirHttpClient::new(url)),
            (None, None) => Arc::new(WarehouseFhirSource::new(warehouse.clone())),
        };
        let view_runner = Arc::new(ViewRunner::new(source, config.view_cache_ttl()));

        let cohort_counter: Arc<dyn CohortCounter> = match self.cohort_counter {
            Some(counter) => counter,
            None => match config.cohort_backend {
                CohortBackend::Sql => Arc::new(SqlCohortCounter::new(sandbox.clone())),
                CohortBackend::Viewdef => {
                    Arc::new(ViewDefinitionCohortCounter::new(view_runner.clone()))
                }
            },
        };

        let engine = match (self.engine, &config.workflow_file) {
            (Some(engine), _) => engine,
            (None, Some(path)) => {
                let definition = WorkflowDefinition::from_file(path).map_err(ServerError::Internal)?;
                WorkflowEngine::from_definition(&definition)
            }
            (None, None) => WorkflowEngine::default(),
        };

        let agents = default_agents(&config, &llm, &sandbox, cohort_counter, config.retry.policy());
        let orchestrator = Orchestrator::new(&db, agents, engine);
        let view_manager = ViewDefinitionManager::new(config.viewdef_dir.clone())?;
        let materialized_views = MaterializedViewStore::new(warehouse.clone());

        tracing::info!(
            "[AppState] Ready (cohort backend: {}, view source: {}, views: {})",
            config.cohort_backend.as_str(),
            view_runner.source_name(),
            view_manager.dir().display()
        );

        Ok(AppStateInner {
            config,
            db,
            warehouse,
            sandbox,
            llm,
            orchestrator,
            view_manager,
            view_runner,
            materialized_views,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{COORDINATOR_AGENT, REQUIREMENTS_AGENT};

    fn test_config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".to_string(),
            viewdef_dir: dir.join("views"),
            delivery_dir: dir.join("deliveries"),
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn test_build_registers_all_agents() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppStateInner::new(test_config(dir.path())).unwrap();
        let ids = state.orchestrator.agents().ids();
        assert_eq!(ids.len(), 7);
        assert!(ids.contains(&REQUIREMENTS_AGENT.to_string()));
        assert!(ids.contains(&COORDINATOR_AGENT.to_string()));
        assert_eq!(state.view_runner.source_name(), "warehouse");
        state.db.ping().await.unwrap();
    }

    #[test]
    fn test_missing_workflow_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            workflow_file: Some(dir.path().join("absent.yaml").display().to_string()),
            ..test_config(dir.path())
        };
        assert!(AppStateInner::new(config).is_err());
    }
}
