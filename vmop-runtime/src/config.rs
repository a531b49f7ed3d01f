//! Operator configuration, loaded from the environment
use crate::rate_limiter::RateLimitSettings;
use serde::Deserialize;
use std::{str::FromStr, time::Duration};
use thiserror::Error;
use vmop_core::{gvk::kinds, ApiKind};

const WATCH_NAMESPACE: &str = "WATCH_NAMESPACE";
const CONTROLLER_CONCURRENCY: &str = "VM_CONTROLLER_CONCURRENCY";
const CONTROLLER_RESYNC: &str = "VM_CONTROLLER_RESYNC_SECONDS";
const RATE_LIMIT: &str = "VM_RECONCILE_RATE_LIMIT";
const RATE_WINDOW: &str = "VM_RECONCILE_RATE_WINDOW_SECONDS";
const CONVERTER_RESYNC: &str = "VM_CONVERTER_RESYNC_PERIOD_SECONDS";
const CONVERTER_DISABLED_KINDS: &str = "VM_CONVERTER_DISABLED_KINDS";
const CONVERTER_OWNER_REFERENCES: &str = "VM_CONVERTER_OWNER_REFERENCES";
const CONVERTER_FILTER_PREFIXES: &str = "VM_CONVERTER_FILTER_PREFIXES";
const DISABLE_CRD_OWNERSHIP: &str = "VM_DISABLE_CRD_OWNERSHIP";
const OPERATOR_INSTANCE: &str = "VM_OPERATOR_INSTANCE";
const CLIENT_QPS: &str = "VM_CLIENT_QPS";
const CLIENT_BURST: &str = "VM_CLIENT_BURST";
// one call every ~17 minutes
const MIN_CLIENT_QPS: f32 = 0.001;

/// Errors from loading the configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be parsed
    #[error("invalid value {value:?} for {var}")]
    InvalidValue {
        /// Name of the variable
        var: String,
        /// The rejected value
        value: String,
    },
}

/// Serde helper reading a [`Duration`] from whole seconds
pub(crate) mod seconds {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Settings of the schema converter loops
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConverterConfig {
    /// Period of the full relist, zero disables it
    #[serde(with = "seconds")]
    pub resync_period: Duration,
    /// Foreign kinds (e.g. `ServiceMonitor`) that are not converted
    pub disabled_kinds: Vec<String>,
    /// Point an owner reference from each mirror at its foreign object
    pub owner_references: bool,
    /// Label and annotation prefixes that are not copied to mirrors
    pub filter_prefixes: Vec<String>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::ZERO,
            disabled_kinds: Vec::new(),
            owner_references: false,
            filter_prefixes: vec!["kubectl.kubernetes.io/".to_string()],
        }
    }
}

/// Settings of the ownership bootstrap phase
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OwnershipConfig {
    /// Whether the phase runs at all
    pub enabled: bool,
    /// Value of the `managed-by` label identifying this operator's objects
    pub operator_name: String,
    /// Identity of this operator instance
    pub instance: String,
    /// Cluster-scoped kinds to stamp
    #[serde(skip)]
    pub kinds: Vec<ApiKind>,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            operator_name: "vm-operator".to_string(),
            instance: "vm-operator".to_string(),
            kinds: vec![
                kinds::CLUSTER_ROLE,
                kinds::CLUSTER_ROLE_BINDING,
                kinds::CUSTOM_RESOURCE_DEFINITION,
            ],
        }
    }
}

/// Client-side throttling of every cluster call
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Sustained calls per second, zero or less disables throttling
    pub qps: f32,
    /// Calls allowed in a burst
    pub burst: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { qps: 5.0, burst: 10 }
    }
}

/// Everything the [`Manager`](crate::manager::Manager) needs to know
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Namespaces to watch, empty meaning cluster-wide
    pub watch_namespaces: Vec<String>,
    /// Reconciles running at once per relation
    pub concurrency: usize,
    /// Period of the dispatcher resync, zero disables it
    #[serde(with = "seconds")]
    pub resync_period: Duration,
    /// Admission limits per parent kind
    pub rate_limit: RateLimitSettings,
    /// Schema conversion
    pub converter: ConverterConfig,
    /// Ownership bootstrap
    pub ownership: OwnershipConfig,
    /// Client-side throttling
    pub client: ClientConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespaces: Vec::new(),
            concurrency: 15,
            resync_period: Duration::ZERO,
            rate_limit: RateLimitSettings::default(),
            converter: ConverterConfig::default(),
            ownership: OwnershipConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Load the configuration from the process environment
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load the configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(namespaces) = var(WATCH_NAMESPACE) {
            config.watch_namespaces = split_list(&namespaces);
        }
        if let Some(concurrency) = parsed(CONTROLLER_CONCURRENCY, var(CONTROLLER_CONCURRENCY))? {
            config.concurrency = concurrency;
        }
        if let Some(secs) = parsed(CONTROLLER_RESYNC, var(CONTROLLER_RESYNC))? {
            config.resync_period = Duration::from_secs(secs);
        }
        if let Some(limit) = parsed(RATE_LIMIT, var(RATE_LIMIT))? {
            config.rate_limit.limit = limit;
        }
        if let Some(secs) = parsed(RATE_WINDOW, var(RATE_WINDOW))? {
            config.rate_limit.window = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed(CONVERTER_RESYNC, var(CONVERTER_RESYNC))? {
            config.converter.resync_period = Duration::from_secs(secs);
        }
        if let Some(kinds) = var(CONVERTER_DISABLED_KINDS) {
            config.converter.disabled_kinds = split_list(&kinds);
        }
        if let Some(enabled) = parsed_bool(CONVERTER_OWNER_REFERENCES, var(CONVERTER_OWNER_REFERENCES))? {
            config.converter.owner_references = enabled;
        }
        if let Some(prefixes) = var(CONVERTER_FILTER_PREFIXES) {
            config.converter.filter_prefixes = split_list(&prefixes);
        }
        if let Some(disabled) = parsed_bool(DISABLE_CRD_OWNERSHIP, var(DISABLE_CRD_OWNERSHIP))? {
            config.ownership.enabled = !disabled;
        }
        if let Some(instance) = var(OPERATOR_INSTANCE) {
            config.ownership.instance = instance;
        }
        if let Some(qps) = parsed::<f32>(CLIENT_QPS, var(CLIENT_QPS))? {
            if !qps.is_finite() || (qps > 0.0 && qps < MIN_CLIENT_QPS) {
                return Err(invalid(CLIENT_QPS, &qps.to_string()));
            }
            config.client.qps = qps;
        }
        if let Some(burst) = parsed(CLIENT_BURST, var(CLIENT_BURST))? {
            config.client.burst = burst;
        }
        Ok(config)
    }

    /// Watch only `namespaces`, or every namespace if empty
    #[must_use]
    pub fn watch_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.watch_namespaces = namespaces;
        self
    }

    /// Run at most `concurrency` reconciles at once per relation
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Re-enqueue every child each `period`
    #[must_use]
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Admit `settings.limit` reconciles per window and parent kind
    #[must_use]
    pub fn rate_limit(mut self, settings: RateLimitSettings) -> Self {
        self.rate_limit = settings;
        self
    }

    /// Replace the converter settings
    #[must_use]
    pub fn converter(mut self, converter: ConverterConfig) -> Self {
        self.converter = converter;
        self
    }

    /// Replace the ownership bootstrap settings
    #[must_use]
    pub fn ownership(mut self, ownership: OwnershipConfig) -> Self {
        self.ownership = ownership;
        self
    }

    /// Replace the client throttling settings
    #[must_use]
    pub fn client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn invalid(var: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    }
}

fn parsed<T: FromStr>(var: &str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    value
        .map(|value| value.trim().parse().map_err(|_| invalid(var, &value)))
        .transpose()
}

fn parsed_bool(var: &str, value: Option<String>) -> Result<Option<bool>, ConfigError> {
    value
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(invalid(var, &value)),
        })
        .transpose()
}
