//! Application state

use std::sync::Arc;

use agent_runner::{AgentBackend, HttpAgentBackend, PipelineExecutor, ToolRouter};
use relay_core::catalog::FileFoodStore;
use tracing::info;

use crate::catalog_tools::{CatalogTools, CATALOG_TARGET};
use crate::config::RelayConfig;
use crate::routing::RoutingFront;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    front: RoutingFront,
    catalog: Arc<CatalogTools>,
}

impl AppState {
    pub fn new(front: RoutingFront, catalog: Arc<CatalogTools>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { front, catalog }),
        }
    }

    /// Build the state from configuration, talking to the platform over HTTP
    pub async fn from_config(config: &RelayConfig) -> anyhow::Result<Self> {
        let backend: Arc<dyn AgentBackend> = Arc::new(HttpAgentBackend::new(config.backend_config())?);
        Self::with_backend(config, backend).await
    }

    /// Build the state from configuration with the given agent backend
    pub async fn with_backend(
        config: &RelayConfig,
        backend: Arc<dyn AgentBackend>,
    ) -> anyhow::Result<Self> {
        let store = FileFoodStore::new(config.catalog_path()).await?;
        let catalog = Arc::new(CatalogTools::new(Arc::new(store)));

        let registry = config.build_registry()?;
        info!(
            agents = registry.agent_names().len(),
            pipelines = registry.pipeline_names().len(),
            "Agent registry validated"
        );

        let tools = ToolRouter::new().with_target(CATALOG_TARGET, catalog.clone());
        let executor = PipelineExecutor::new(Arc::new(registry), backend, config.executor_config())
            .with_tools(Arc::new(tools));
        let front = RoutingFront::new(executor, config.routing.clone())?;

        Ok(Self::new(front, catalog))
    }

    /// Get reference to the routing front
    pub fn front(&self) -> &RoutingFront {
        &self.inner.front
    }

    /// Get reference to the catalog tools
    pub fn catalog(&self) -> &CatalogTools {
        &self.inner.catalog
    }
}
