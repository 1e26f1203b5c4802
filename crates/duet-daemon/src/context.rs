use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use duet_agents::backend::{CodeGenerator, HttpGenerator, ScaffoldGenerator};
use duet_core::config::{expand_home, Config};
use duet_core::store::Store;
use duet_harness::retry::RetryPolicy;
use duet_telemetry::metrics::MetricsCollector;
use tracing::info;

/// Shared handles every project run is built from.
#[derive(Clone)]
pub struct Context {
    pub config: Config,
    pub store: Store,
    pub metrics: Arc<MetricsCollector>,
    pub workspace_root: PathBuf,
    pub generator: Arc<dyn CodeGenerator>,
}

impl Context {
    /// Open the configured store and pick a code generation backend.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;
        let db_path = expand_home(&config.store.path);
        let store = Store::open(&db_path)
            .await
            .with_context(|| format!("opening store at {}", db_path.display()))?;
        info!(path = %db_path.display(), "store opened");
        Ok(Self::new(config, store))
    }

    /// Build from an already open store.
    pub fn new(config: Config, store: Store) -> Self {
        let generator: Arc<dyn CodeGenerator> = match &config.backend.endpoint {
            Some(endpoint) => {
                info!(%endpoint, "using HTTP code generation backend");
                Arc::new(HttpGenerator::new(
                    endpoint.clone(),
                    Duration::from_secs(config.backend.timeout_secs),
                ))
            }
            None => Arc::new(ScaffoldGenerator),
        };
        let workspace_root = expand_home(&config.general.workspace_root);
        Self {
            config,
            store,
            metrics: Arc::new(MetricsCollector::new()),
            workspace_root,
            generator,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.backend.max_retries,
            Duration::from_millis(self.config.backend.retry_backoff_ms),
        )
    }
}
