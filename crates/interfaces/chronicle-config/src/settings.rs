use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use camino::Utf8Path;
use chronicle_core::{Endpoint, TargetId};
use serde::{Deserialize, Serialize};

use crate::{
    clamp_batch_size, clamp_concurrency, DEFAULT_BATCH_SIZE, DEFAULT_BUCKET_CAPACITY,
    DEFAULT_BUCKET_TTL_SECS, DEFAULT_CONCURRENCY, DEFAULT_ERROR_MARGIN_SECS,
    DEFAULT_ERROR_THRESHOLD, DEFAULT_HTTP_RETRIES, DEFAULT_MAX_DELAY_SECS, DEFAULT_MAX_PAGES,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_RATE_BURST, DEFAULT_RATE_PER_SECOND,
    DEFAULT_RESCHEDULE_DELAY_SECS,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which targets an endpoint is synchronized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliesTo {
    #[default]
    Accounts,
    Reference,
}

impl AppliesTo {
    pub fn matches(self, target: TargetId) -> bool {
        matches!(
            (self, target),
            (AppliesTo::Accounts, TargetId::Account(_))
                | (AppliesTo::Reference, TargetId::Reference)
        )
    }
}

/// One remote data category, described as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    /// Absolute URL; `{target}` is replaced by the account number.
    pub url: String,
    /// Rate bucket class. Defaults to the endpoint name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_class: Option<String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Field holding nested items, for hierarchical snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_scope: Option<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub paged: bool,
    #[serde(default)]
    pub applies_to: AppliesTo,
}

fn default_id_field() -> String {
    "id".to_string()
}

impl EndpointSpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            resource_class: None,
            id_field: default_id_field(),
            children_field: None,
            required_scope: None,
            prerequisites: Vec::new(),
            paged: false,
            applies_to: AppliesTo::Accounts,
        }
    }

    pub fn resource_class(&self) -> &str {
        self.resource_class.as_deref().unwrap_or(&self.name)
    }

    /// The engine-facing description of this endpoint.
    pub fn to_endpoint(&self) -> Endpoint {
        let mut endpoint =
            Endpoint::new(self.name.clone()).with_resource_class(self.resource_class());
        if let Some(scope) = &self.required_scope {
            endpoint = endpoint.with_scope(scope.clone());
        }
        for prerequisite in &self.prerequisites {
            endpoint = endpoint.with_prerequisite(prerequisite.clone());
        }
        endpoint
    }

    /// Fills the `{target}` placeholder.
    pub fn url_for(&self, target: TargetId) -> String {
        let value = match target {
            TargetId::Account(id) => id.to_string(),
            TargetId::Reference => "reference".to_string(),
        };
        self.url.replace("{target}", &value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSettings {
    pub per_second: u32,
    pub burst: u32,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            per_second: DEFAULT_RATE_PER_SECOND,
            burst: DEFAULT_RATE_BURST,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetQuotaSettings {
    pub class: String,
    pub target: TargetId,
    #[serde(flatten)]
    pub quota: QuotaSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub global: QuotaSettings,
    pub classes: BTreeMap<String, QuotaSettings>,
    pub targets: Vec<TargetQuotaSettings>,
    pub bucket_capacity: usize,
    pub bucket_ttl_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            global: QuotaSettings::default(),
            classes: BTreeMap::new(),
            targets: Vec::new(),
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            bucket_ttl_secs: DEFAULT_BUCKET_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorBudgetSettings {
    pub threshold: u32,
    pub margin_secs: u64,
}

impl Default for ErrorBudgetSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ERROR_THRESHOLD,
            margin_secs: DEFAULT_ERROR_MARGIN_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub retries: u32,
    pub max_pages: u32,
    pub timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            retries: DEFAULT_HTTP_RETRIES,
            max_pages: DEFAULT_MAX_PAGES,
            timeout_secs: 30,
        }
    }
}

/// Everything an operator can tune, loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_delay_secs: u64,
    pub default_reschedule_secs: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub poll_interval_secs: u64,
    pub excluded_endpoints: BTreeSet<String>,
    pub rate_limits: RateLimitSettings,
    pub error_budget: ErrorBudgetSettings,
    pub http: HttpSettings,
    pub endpoints: Vec<EndpointSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
            default_reschedule_secs: DEFAULT_RESCHEDULE_DELAY_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            excluded_endpoints: BTreeSet::new(),
            rate_limits: RateLimitSettings::default(),
            error_budget: ErrorBudgetSettings::default(),
            http: HttpSettings::default(),
            endpoints: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: EngineConfig = serde_json::from_str(raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Clamps tunables into their accepted ranges.
    pub fn normalize(&mut self) {
        self.batch_size = clamp_batch_size(self.batch_size);
        self.concurrency = clamp_concurrency(self.concurrency);
        self.poll_interval_secs = self.poll_interval_secs.max(1);
        self.rate_limits.bucket_capacity = self.rate_limits.bucket_capacity.max(1);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = BTreeSet::new();
        for spec in &self.endpoints {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::Invalid("endpoint with empty name".into()));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "endpoint '{}' is defined twice",
                    spec.name
                )));
            }
            if !(spec.url.starts_with("http://") || spec.url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "endpoint '{}' has a non-http url '{}'",
                    spec.name, spec.url
                )));
            }
        }
        for spec in &self.endpoints {
            for prerequisite in &spec.prerequisites {
                if prerequisite == &spec.name {
                    return Err(ConfigError::Invalid(format!(
                        "endpoint '{}' lists itself as a prerequisite",
                        spec.name
                    )));
                }
                if !names.contains(prerequisite.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "endpoint '{}' requires unknown endpoint '{}'",
                        spec.name, prerequisite
                    )));
                }
            }
        }
        let quotas = std::iter::once(&self.rate_limits.global)
            .chain(self.rate_limits.classes.values())
            .chain(self.rate_limits.targets.iter().map(|t| &t.quota));
        for quota in quotas {
            if quota.per_second == 0 || quota.burst == 0 {
                return Err(ConfigError::Invalid(
                    "rate limits need a non-zero rate and burst".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn default_reschedule_delay(&self) -> Duration {
        Duration::from_secs(self.default_reschedule_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn is_excluded(&self, endpoint: &str) -> bool {
        self.excluded_endpoints.contains(endpoint)
    }
}
