use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chronicle_config::{EngineConfig, QuotaSettings, RateLimitSettings};
use chronicle_infra::net::default_http_client;
use chronicle_infra::{ApiClient, ErrorBudget, RateLimitPolicy, RateLimiterRegistry, RateQuota};
use chronicle_persistence::RedbStore;
use chronicle_pipeline::{AdapterRegistry, Scheduler, SyncEngine, SyncOptions};
use directories::ProjectDirs;

const QUALIFIER: &str = "com";
const ORG: &str = "chronicle";
const APP: &str = "chronicle";

/// `<data dir>/chronicle.redb` for the current user.
pub fn default_db_path() -> Result<Utf8PathBuf> {
    let proj_dirs = ProjectDirs::from(QUALIFIER, ORG, APP)
        .ok_or_else(|| anyhow!("Could not determine data directory"))?;
    let dir = Utf8PathBuf::from_path_buf(proj_dirs.data_dir().to_path_buf())
        .map_err(|p| anyhow!("Data directory is not UTF-8: {}", p.display()))?;
    Ok(RedbStore::path_for_root(&dir))
}

pub fn load_config(path: Option<&Utf8Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path)),
        None => Ok(EngineConfig::default()),
    }
}

fn quota(settings: QuotaSettings) -> RateQuota {
    RateQuota::new(
        NonZeroU32::new(settings.per_second).unwrap_or(NonZeroU32::MIN),
        NonZeroU32::new(settings.burst).unwrap_or(NonZeroU32::MIN),
    )
}

pub fn rate_policy(settings: &RateLimitSettings) -> RateLimitPolicy {
    RateLimitPolicy {
        global: quota(settings.global),
        classes: settings
            .classes
            .iter()
            .map(|(class, q)| (class.clone(), quota(*q)))
            .collect(),
        targets: settings
            .targets
            .iter()
            .map(|t| ((t.class.clone(), t.target), quota(t.quota)))
            .collect(),
    }
}

/// Everything one CLI invocation works with, wired from the config.
pub struct Runtime {
    pub config: EngineConfig,
    pub store: Arc<RedbStore>,
    pub limiter: Arc<RateLimiterRegistry>,
    pub engine: Arc<SyncEngine>,
    pub adapters: Arc<AdapterRegistry>,
}

impl Runtime {
    pub fn open(db: &Utf8Path, config: EngineConfig) -> Result<Self> {
        let store = RedbStore::open(db).with_context(|| format!("Failed to open {}", db))?;
        Self::with_store(Arc::new(store), config)
    }

    pub fn with_store(store: Arc<RedbStore>, config: EngineConfig) -> Result<Self> {
        let limiter = Arc::new(RateLimiterRegistry::new(
            rate_policy(&config.rate_limits),
            config.rate_limits.bucket_capacity,
        ));
        let http = default_http_client(Duration::from_secs(config.http.timeout_secs))
            .context("Failed to build HTTP client")?;
        let client = ApiClient::new(http, limiter.clone())
            .with_retries(config.http.retries)
            .with_max_pages(config.http.max_pages);
        let budget = ErrorBudget::new(
            config.error_budget.threshold,
            Duration::from_secs(config.error_budget.margin_secs),
        );

        let engine = SyncEngine::from_store(
            store.clone(),
            Arc::new(budget),
            SyncOptions::from_config(&config),
        );
        let adapters = AdapterRegistry::from_config(&config, Arc::new(client));

        Ok(Self {
            config,
            store,
            limiter,
            engine: Arc::new(engine),
            adapters: Arc::new(adapters),
        })
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.engine.clone(),
            self.adapters.clone(),
            self.config.concurrency,
        )
        .with_rate_buckets(
            self.limiter.clone(),
            Duration::from_secs(self.config.rate_limits.bucket_ttl_secs),
        )
    }
}
