//! Agent configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookrelay_core::models::{DeliveryRule, Destination, HealthProbe, RoutingConfig};
use hookrelay_delivery::{
    BackoffStrategy, BrokerConfig, ClientConfig, DispatcherConfig, HealthConfig, IntakeConfig,
    RetryPolicy,
};
use serde::{Deserialize, Serialize};
use url::Url;

const CONFIG_FILE: &str = "hookrelay.toml";
const CONFIG_PATH_VAR: &str = "HOOKRELAY_CONFIG";
const ENV_PREFIX: &str = "HOOKRELAY_";

/// Complete agent configuration with defaults, file and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed `HOOKRELAY_` (highest priority)
/// 2. Configuration file (`hookrelay.toml`, or the path in `HOOKRELAY_CONFIG`)
/// 3. Built-in defaults (lowest priority)
///
/// Destinations and rules are tables, so they normally live in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Broker
    /// Base URL of the broker API.
    ///
    /// Environment variable: `HOOKRELAY_BROKER_URL`
    pub broker_url: String,
    /// Bearer token for the broker, if it requires one.
    ///
    /// Environment variable: `HOOKRELAY_API_KEY`
    pub api_key: Option<String>,
    /// Scope whose events are polled.
    ///
    /// Environment variable: `HOOKRELAY_WEBHOOK_SCOPE`
    pub webhook_scope: String,
    /// Delay between polls in milliseconds.
    pub poll_interval_ms: u64,
    /// Timeout for broker calls in milliseconds.
    pub broker_timeout_ms: u64,

    // Delivery
    /// Timeout for forwarding one event in milliseconds.
    pub delivery_timeout_ms: u64,
    /// Skip attempts to destinations whose last probe failed.
    pub gate_on_health: bool,
    /// Time allowed for in-flight deliveries on shutdown in milliseconds.
    pub shutdown_timeout_ms: u64,

    // Retry
    /// First retry delay in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Upper bound for any retry delay in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Random spread applied to delays (0.0 to 1.0).
    pub retry_jitter_factor: f64,
    /// How delays grow between retries.
    pub backoff: BackoffStrategy,

    // Health
    /// Timeout for one probe in milliseconds.
    pub probe_timeout_ms: u64,
    /// Probe interval while a destination is healthy, in milliseconds.
    pub healthy_interval_ms: u64,
    /// Probe interval while a destination is unhealthy, in milliseconds.
    pub unhealthy_interval_ms: u64,

    // Logging
    /// Log filter used when `RUST_LOG` is unset.
    ///
    /// Environment variable: `HOOKRELAY_RUST_LOG`
    pub rust_log: String,

    // Routing
    /// Named delivery targets.
    pub destinations: Vec<DestinationConfig>,
    /// `source -> destination` rules.
    pub rules: Vec<DeliveryRule>,
}

/// One `[[destinations]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Name referenced by rules.
    pub name: String,
    /// Target URL; `localhost:3000/hook` style shorthands become `http://`.
    pub url: String,
    /// Explicit probe. Derived from the URL when absent.
    #[serde(default)]
    pub health_probe: Option<HealthProbe>,
    /// Retry budget override.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Config {
    /// Loads configuration from defaults, file and environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| CONFIG_FILE.to_string());
        Self::from_figment(Self::figment(&path))
    }

    /// Layered provider stack for the given config file.
    pub fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: Self = figment.extract().context("failed to load configuration")?;
        config.broker_url = normalize_url(&config.broker_url).context("invalid broker_url")?;
        for destination in &mut config.destinations {
            destination.url = normalize_url(&destination.url)
                .with_context(|| format!("invalid url for destination '{}'", destination.name))?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Broker client settings.
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            base_url: self.broker_url.clone(),
            api_key: self.api_key.clone(),
            timeout: Duration::from_millis(self.broker_timeout_ms),
        }
    }

    /// Dispatcher settings.
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            intake: IntakeConfig {
                webhook_scope: self.webhook_scope.clone(),
                poll_interval: Duration::from_millis(self.poll_interval_ms),
            },
            client: ClientConfig {
                timeout: Duration::from_millis(self.delivery_timeout_ms),
                ..ClientConfig::default()
            },
            health: HealthConfig {
                probe_timeout: Duration::from_millis(self.probe_timeout_ms),
                healthy_interval: Duration::from_millis(self.healthy_interval_ms),
                unhealthy_interval: Duration::from_millis(self.unhealthy_interval_ms),
            },
            retry: self.to_retry_policy(),
            gate_on_health: self.gate_on_health,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }

    /// Retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: self.backoff,
        }
    }

    /// Routing snapshot with probes filled in.
    pub fn to_routing_config(&self) -> RoutingConfig {
        let destinations = self
            .destinations
            .iter()
            .map(|d| Destination {
                name: d.name.clone(),
                url: d.url.clone(),
                health_probe: d.health_probe.clone().or_else(|| HealthProbe::derive(&d.url)),
                max_retries: d.max_retries,
            })
            .collect();
        RoutingConfig::new(destinations, self.rules.clone())
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.webhook_scope.trim().is_empty() {
            anyhow::bail!("webhook_scope must not be empty");
        }

        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("broker_timeout_ms", self.broker_timeout_ms),
            ("delivery_timeout_ms", self.delivery_timeout_ms),
            ("retry_base_delay_ms", self.retry_base_delay_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("healthy_interval_ms", self.healthy_interval_ms),
            ("unhealthy_interval_ms", self.unhealthy_interval_ms),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than 0");
            }
        }

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            anyhow::bail!("retry_max_delay_ms cannot be less than retry_base_delay_ms");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: "http://127.0.0.1:8080/api".to_string(),
            api_key: None,
            webhook_scope: "default".to_string(),
            poll_interval_ms: 5_000,
            broker_timeout_ms: 10_000,
            delivery_timeout_ms: 30_000,
            gate_on_health: true,
            shutdown_timeout_ms: 30_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            retry_jitter_factor: 0.1,
            backoff: BackoffStrategy::Exponential,
            probe_timeout_ms: 1_000,
            healthy_interval_ms: 5_000,
            unhealthy_interval_ms: 1_000,
            rust_log: "info,hookrelay=debug".to_string(),
            destinations: Vec::new(),
            rules: Vec::new(),
        }
    }
}

/// Turns a configured URL into one absolute URL string.
fn normalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        anyhow::bail!("url must not be empty");
    }

    let candidate =
        if trimmed.contains("://") { trimmed.to_string() } else { format!("http://{trimmed}") };
    let url = Url::parse(&candidate).with_context(|| format!("'{raw}' is not a valid url"))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("'{raw}' must use http or https");
    }
    Ok(url.to_string())
}
