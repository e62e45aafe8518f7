//! Shared application state

use metrics_exporter_prometheus::PrometheusHandle;
use pgc_enforcement::{DecisionCoordinator, EnforcementCache, PenaltyScorer};
use pgc_policy::{FormatRouter, PolicyManager, RuleSource};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::config::PgcConfig;
use crate::upstream::build_source;

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    /// Decides requests against the active rule set
    pub coordinator: Arc<DecisionCoordinator>,

    /// Loaded configuration
    pub config: Arc<PgcConfig>,

    /// Prometheus metrics handle for rendering, absent in tests
    pub metrics_handle: Option<PrometheusHandle>,

    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component from configuration using the configured upstream
    pub fn from_config(config: PgcConfig, metrics_handle: Option<PrometheusHandle>) -> anyhow::Result<Self> {
        let source = build_source(&config.upstream)?;
        info!(source = %source.describe(), "Rule source configured");
        Self::with_source(config, source, metrics_handle)
    }

    /// Wire every component around an explicit rule source
    pub fn with_source(
        config: PgcConfig,
        source: Arc<dyn RuleSource>,
        metrics_handle: Option<PrometheusHandle>,
    ) -> anyhow::Result<Self> {
        let manager = PolicyManager::new(
            source,
            FormatRouter::new()?,
            config.integrity_gate(),
            config.manager_config(),
        );

        let cache = EnforcementCache::new(config.cache_config());
        let scorer = PenaltyScorer::new(config.penalty_config())?;

        let coordinator = DecisionCoordinator::new(
            Arc::new(manager),
            Arc::new(cache),
            scorer,
            config.coordinator_config(),
        );

        Ok(Self {
            coordinator: Arc::new(coordinator),
            config: Arc::new(config),
            metrics_handle,
            started_at: Instant::now(),
        })
    }

    /// The policy manager behind the coordinator
    pub fn manager(&self) -> &Arc<PolicyManager> {
        self.coordinator.manager()
    }
}
