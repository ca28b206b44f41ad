//! One scrape run: load the registry, capture every property, append the
//! results to the history log.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vacwatch_adapters::{snapshot_property, CapturePolicy, HttpPageDriver, PageDriver};
use vacwatch_core::{env_or, env_parse, env_value, now_jst, ConfigError, HistoryEntry};
use vacwatch_storage::{HistoryStore, HttpClientConfig, HttpFetcher, RegistryStore};

pub const CRATE_NAME: &str = "vacwatch-sync";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub navigation_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            data_dir: data_dir_from_env(),
            user_agent: env_or("VACWATCH_USER_AGENT", DEFAULT_USER_AGENT),
            navigation_timeout_secs: env_parse("VACWATCH_NAV_TIMEOUT_SECS", 60)?,
        })
    }

    pub fn capture_policy(&self) -> CapturePolicy {
        CapturePolicy {
            navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
            ..CapturePolicy::default()
        }
    }
}

/// `VACWATCH_DATA_DIR`, defaulting to `data` under the working directory.
pub fn data_dir_from_env() -> PathBuf {
    env_value("VACWATCH_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"))
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    pub succeeded: usize,
    pub history_len: usize,
}

/// Visits every registered property on one page driver and records the run.
pub struct ScrapePipeline<D> {
    registry: RegistryStore,
    history: HistoryStore,
    policy: CapturePolicy,
    driver: D,
}

impl<D: PageDriver> ScrapePipeline<D> {
    pub fn new(registry: RegistryStore, history: HistoryStore, driver: D) -> Self {
        Self {
            registry,
            history,
            policy: CapturePolicy::default(),
            driver,
        }
    }

    pub fn with_policy(mut self, policy: CapturePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    pub async fn run_once(&mut self) -> Result<ScrapeRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape_run", %run_id);

        async {
            let properties = self.registry.load_or_empty().await;
            if properties.is_empty() {
                bail!("no properties registered in {}", self.registry.path().display());
            }
            info!(count = properties.len(), "starting scrape run");

            let mut snapshots = Vec::with_capacity(properties.len());
            for property in &properties {
                snapshots.push(snapshot_property(&mut self.driver, property, &self.policy).await);
            }

            let entry = HistoryEntry::new(now_jst(), snapshots);
            let succeeded = entry.successful();
            if succeeded == 0 {
                warn!(attempted = properties.len(), "every property failed; history left untouched");
                bail!("all {} properties failed to scrape", properties.len());
            }

            let history_len = self
                .history
                .append(entry)
                .await
                .with_context(|| format!("appending to {}", self.history.path().display()))?;

            let summary = ScrapeRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                attempted: properties.len(),
                succeeded,
                history_len,
            };
            info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                history_len = summary.history_len,
                "scrape run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

pub async fn run_scrape_once_from_env() -> Result<ScrapeRunSummary> {
    let config = SyncConfig::from_env().context("reading scrape configuration")?;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.navigation_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let mut pipeline = ScrapePipeline::new(
        RegistryStore::in_dir(&config.data_dir),
        HistoryStore::in_dir(&config.data_dir),
        HttpPageDriver::new(http),
    )
    .with_policy(config.capture_policy());
    pipeline.run_once().await
}
