//! Configuration management for Duoroute
//!
//! Parses TOML configuration files and provides typed access to settings.
//! Range-sensitive sections (classifier thresholds) validate at parse time
//! via custom `Deserialize`; everything else validates in `Config::validate`,
//! which `from_file` runs automatically.

use crate::backends::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub backends: BackendsConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub prompt_cache: PromptCacheConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout() -> u64 {
    60
}

/// The two execution engines the orchestrator dispatches to
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendsConfig {
    pub agent: BackendEndpointConfig,
    pub direct: BackendEndpointConfig,
}

impl BackendsConfig {
    /// Engine configuration for a backend kind
    pub fn for_kind(&self, kind: BackendKind) -> &BackendEndpointConfig {
        match kind {
            BackendKind::Agent => &self.agent,
            BackendKind::Direct => &self.direct,
        }
    }
}

/// One execution engine endpoint
///
/// Fields are private so values stay as validated by `Config::validate`.
/// `base_url` must point at an OpenAI-compatible `/v1` root; the adapters
/// append `/chat/completions` themselves.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendEndpointConfig {
    base_url: String,
    model: String,
    #[serde(default = "default_max_tokens")]
    max_tokens: usize,
    #[serde(default = "default_temperature")]
    temperature: f64,
    /// Per-backend execution timeout. Falls back to
    /// `server.request_timeout_seconds` when unset.
    timeout_seconds: Option<u64>,
    /// Upper bound on tool-loop iterations. Only the agent adapter reads it.
    #[serde(default = "default_max_tool_steps")]
    max_tool_steps: usize,
}

impl BackendEndpointConfig {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn timeout_seconds(&self) -> Option<u64> {
        self.timeout_seconds
    }

    pub fn max_tool_steps(&self) -> usize {
        self.max_tool_steps
    }

    #[cfg(test)]
    pub(crate) fn for_tests(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            model: model.to_string(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_seconds: None,
            max_tool_steps: default_max_tool_steps(),
        }
    }
}

fn default_max_tokens() -> usize {
    4096
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tool_steps() -> usize {
    6
}

/// Query classifier configuration
///
/// Implements custom `Deserialize` so threshold values outside [0,1] are
/// rejected while the TOML is being parsed rather than later in
/// `Config::validate`. Thresholds:
///
/// - `complexity_threshold`: utterances scoring at or above it route to the
///   agent backend;
/// - `confidence_threshold`: decisions below it fall back to the agent
///   backend regardless of the recommendation.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifierConfig {
    enabled: bool,
    complexity_threshold: f64,
    confidence_threshold: f64,
}

impl ClassifierConfig {
    /// Build a validated classifier configuration
    ///
    /// # Errors
    ///
    /// Returns an error if either threshold is outside [0,1] or not finite.
    pub fn new(
        enabled: bool,
        complexity_threshold: f64,
        confidence_threshold: f64,
    ) -> crate::error::BrainResult<Self> {
        for (name, value) in [
            ("complexity_threshold", complexity_threshold),
            ("confidence_threshold", confidence_threshold),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(crate::error::BrainError::Config(format!(
                    "classifier.{} must be a finite number in [0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(Self {
            enabled,
            complexity_threshold,
            confidence_threshold,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn complexity_threshold(&self) -> f64 {
        self.complexity_threshold
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            complexity_threshold: default_complexity_threshold(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_complexity_threshold() -> f64 {
    0.45
}

fn default_confidence_threshold() -> f64 {
    0.60
}

impl<'de> Deserialize<'de> for ClassifierConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, MapAccess, Visitor};
        use std::fmt;

        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "snake_case")]
        enum Field {
            Enabled,
            ComplexityThreshold,
            ConfidenceThreshold,
        }

        struct ClassifierConfigVisitor;

        impl<'de> Visitor<'de> for ClassifierConfigVisitor {
            type Value = ClassifierConfig;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(
                    "a classifier section with optional enabled, \
                     complexity_threshold, confidence_threshold",
                )
            }

            fn visit_map<V>(self, mut map: V) -> Result<ClassifierConfig, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut enabled = None;
                let mut complexity = None;
                let mut confidence = None;

                while let Some(key) = map.next_key()? {
                    match key {
                        Field::Enabled => {
                            if enabled.is_some() {
                                return Err(de::Error::duplicate_field("enabled"));
                            }
                            enabled = Some(map.next_value()?);
                        }
                        Field::ComplexityThreshold => {
                            if complexity.is_some() {
                                return Err(de::Error::duplicate_field("complexity_threshold"));
                            }
                            complexity = Some(map.next_value()?);
                        }
                        Field::ConfidenceThreshold => {
                            if confidence.is_some() {
                                return Err(de::Error::duplicate_field("confidence_threshold"));
                            }
                            confidence = Some(map.next_value()?);
                        }
                    }
                }

                ClassifierConfig::new(
                    enabled.unwrap_or(true),
                    complexity.unwrap_or_else(default_complexity_threshold),
                    confidence.unwrap_or_else(default_confidence_threshold),
                )
                .map_err(|e| de::Error::custom(format!("Invalid classifier configuration: {}", e)))
            }
        }

        deserializer.deserialize_struct(
            "ClassifierConfig",
            &["enabled", "complexity_threshold", "confidence_threshold"],
            ClassifierConfigVisitor,
        )
    }
}

/// A/B experiment configuration
///
/// `rollout_percent` is the share of bucketed identifiers eligible for the
/// direct backend. `monitored_backend` names the backend whose aggregates
/// drive the recommendation policy (the one being rolled out).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rollout_percent: u8,
    #[serde(default = "default_monitored_backend")]
    pub monitored_backend: BackendKind,
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    #[serde(default = "default_error_rate_ceiling")]
    pub error_rate_ceiling: f64,
    #[serde(default = "default_success_rate_floor")]
    pub success_rate_floor: f64,
    #[serde(default = "default_latency_gain_percent")]
    pub latency_gain_percent: f64,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rollout_percent: 0,
            monitored_backend: default_monitored_backend(),
            min_samples: default_min_samples(),
            error_rate_ceiling: default_error_rate_ceiling(),
            success_rate_floor: default_success_rate_floor(),
            latency_gain_percent: default_latency_gain_percent(),
            window_seconds: default_window_seconds(),
            tick_seconds: default_tick_seconds(),
        }
    }
}

fn default_monitored_backend() -> BackendKind {
    BackendKind::Direct
}

fn default_min_samples() -> u64 {
    50
}

fn default_error_rate_ceiling() -> f64 {
    0.25
}

fn default_success_rate_floor() -> f64 {
    0.90
}

fn default_latency_gain_percent() -> f64 {
    20.0
}

fn default_window_seconds() -> u64 {
    900
}

fn default_tick_seconds() -> u64 {
    60
}

/// System prompt cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptCacheConfig {
    #[serde(default = "default_prompt_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_prompt_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_prompt_sweep_seconds")]
    pub sweep_seconds: u64,
    /// Directory holding `{model}.md` prompt templates
    #[serde(default = "default_prompt_template_dir")]
    pub template_dir: String,
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_prompt_cache_entries(),
            ttl_seconds: default_prompt_ttl_seconds(),
            sweep_seconds: default_prompt_sweep_seconds(),
            template_dir: default_prompt_template_dir(),
        }
    }
}

fn default_prompt_template_dir() -> String {
    "prompts".to_string()
}

fn default_prompt_cache_entries() -> usize {
    128
}

fn default_prompt_ttl_seconds() -> u64 {
    300
}

fn default_prompt_sweep_seconds() -> u64 {
    60
}

/// Resource manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_resource_cache_entries")]
    pub max_cache_entries: usize,
    #[serde(default = "default_resource_ttl_seconds")]
    pub default_ttl_seconds: u64,
    #[serde(default = "default_max_tracked_resources")]
    pub max_tracked_resources: usize,
    /// Byte ceiling (sum of estimated entry sizes) above which the sweep
    /// evicts a larger fraction of the cache.
    #[serde(default = "default_memory_watermark_bytes")]
    pub memory_watermark_bytes: usize,
    #[serde(default = "default_resource_sweep_seconds")]
    pub sweep_seconds: u64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: default_resource_cache_entries(),
            default_ttl_seconds: default_resource_ttl_seconds(),
            max_tracked_resources: default_max_tracked_resources(),
            memory_watermark_bytes: default_memory_watermark_bytes(),
            sweep_seconds: default_resource_sweep_seconds(),
        }
    }
}

fn default_resource_cache_entries() -> usize {
    256
}

fn default_resource_ttl_seconds() -> u64 {
    120
}

fn default_max_tracked_resources() -> usize {
    64
}

fn default_memory_watermark_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_resource_sweep_seconds() -> u64 {
    30
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::error::BrainResult<Self> {
        let path_display = path.as_ref().display().to_string();

        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| {
            crate::error::BrainError::ConfigFileRead {
                path: path_display.clone(),
                source,
            }
        })?;

        let config: Self =
            toml::from_str(&content).map_err(|source| crate::error::BrainError::ConfigParse {
                path: path_display.clone(),
                source,
            })?;

        config
            .validate()
            .map_err(|e| crate::error::BrainError::ConfigValidation {
                path: path_display,
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Execution timeout for a backend
    ///
    /// Per-backend `timeout_seconds` wins when configured, otherwise the
    /// global `server.request_timeout_seconds` applies.
    pub fn timeout_for_backend(&self, kind: BackendKind) -> Duration {
        let seconds = self
            .backends
            .for_kind(kind)
            .timeout_seconds()
            .unwrap_or(self.server.request_timeout_seconds);
        Duration::from_secs(seconds)
    }

    /// Validate configuration after parsing
    ///
    /// Called automatically by `from_file()`; call explicitly when building
    /// a Config from a string (e.g. in tests).
    pub fn validate(&self) -> crate::error::BrainResult<()> {
        for (name, endpoint) in [("agent", &self.backends.agent), ("direct", &self.backends.direct)]
        {
            if endpoint.max_tokens == 0 {
                return Err(crate::error::BrainError::Config(format!(
                    "backends.{} has max_tokens=0; max_tokens must be greater than 0",
                    name
                )));
            }
            if endpoint.max_tokens > u32::MAX as usize {
                return Err(crate::error::BrainError::Config(format!(
                    "backends.{} has max_tokens={} which exceeds u32::MAX; \
                     engines reject token limits beyond u32",
                    name, endpoint.max_tokens
                )));
            }
            if !endpoint.base_url.starts_with("http://")
                && !endpoint.base_url.starts_with("https://")
            {
                return Err(crate::error::BrainError::Config(format!(
                    "backends.{} has invalid base_url '{}'; \
                     base_url must start with 'http://' or 'https://'",
                    name, endpoint.base_url
                )));
            }
            if !endpoint.base_url.ends_with("/v1") {
                return Err(crate::error::BrainError::Config(format!(
                    "backends.{} has invalid base_url '{}'; base_url must end with '/v1' \
                     (e.g. 'http://host:port/v1') so '/chat/completions' can be appended",
                    name, endpoint.base_url
                )));
            }
            if endpoint.model.trim().is_empty() {
                return Err(crate::error::BrainError::Config(format!(
                    "backends.{} has an empty model name",
                    name
                )));
            }
            if !endpoint.temperature.is_finite()
                || endpoint.temperature < 0.0
                || endpoint.temperature > 2.0
            {
                return Err(crate::error::BrainError::Config(format!(
                    "backends.{} has invalid temperature {}; \
                     temperature must be a finite number between 0.0 and 2.0",
                    name, endpoint.temperature
                )));
            }
            if let Some(timeout) = endpoint.timeout_seconds {
                if timeout == 0 || timeout > 300 {
                    return Err(crate::error::BrainError::Config(format!(
                        "backends.{} has timeout_seconds={}; \
                         timeouts must be in (0, 300] seconds",
                        name, timeout
                    )));
                }
            }
            if endpoint.max_tool_steps == 0 || endpoint.max_tool_steps > 32 {
                return Err(crate::error::BrainError::Config(format!(
                    "backends.{} has max_tool_steps={}; must be in [1, 32]",
                    name, endpoint.max_tool_steps
                )));
            }
        }

        if self.server.request_timeout_seconds == 0 || self.server.request_timeout_seconds > 300 {
            return Err(crate::error::BrainError::Config(format!(
                "server.request_timeout_seconds must be in (0, 300] seconds, got {}",
                self.server.request_timeout_seconds
            )));
        }

        let exp = &self.experiment;
        if exp.rollout_percent > 100 {
            return Err(crate::error::BrainError::Config(format!(
                "experiment.rollout_percent must be in [0, 100], got {}",
                exp.rollout_percent
            )));
        }
        for (name, value) in [
            ("error_rate_ceiling", exp.error_rate_ceiling),
            ("success_rate_floor", exp.success_rate_floor),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(crate::error::BrainError::Config(format!(
                    "experiment.{} must be a finite number in [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !exp.latency_gain_percent.is_finite() || exp.latency_gain_percent < 0.0 {
            return Err(crate::error::BrainError::Config(format!(
                "experiment.latency_gain_percent must be a non-negative finite number, got {}",
                exp.latency_gain_percent
            )));
        }
        if exp.min_samples == 0 {
            return Err(crate::error::BrainError::Config(
                "experiment.min_samples must be greater than 0".to_string(),
            ));
        }
        if exp.tick_seconds == 0 {
            return Err(crate::error::BrainError::Config(
                "experiment.tick_seconds must be greater than 0".to_string(),
            ));
        }
        if exp.window_seconds < exp.tick_seconds {
            return Err(crate::error::BrainError::Config(format!(
                "experiment.window_seconds ({}) must be at least tick_seconds ({})",
                exp.window_seconds, exp.tick_seconds
            )));
        }

        if self.prompt_cache.max_entries == 0 {
            return Err(crate::error::BrainError::Config(
                "prompt_cache.max_entries must be greater than 0".to_string(),
            ));
        }
        if self.prompt_cache.ttl_seconds == 0 || self.prompt_cache.sweep_seconds == 0 {
            return Err(crate::error::BrainError::Config(
                "prompt_cache ttl_seconds and sweep_seconds must be greater than 0".to_string(),
            ));
        }

        if self.resources.max_cache_entries == 0
            || self.resources.max_tracked_resources == 0
            || self.resources.memory_watermark_bytes == 0
        {
            return Err(crate::error::BrainError::Config(
                "resources limits (max_cache_entries, max_tracked_resources, \
                 memory_watermark_bytes) must be greater than 0"
                    .to_string(),
            ));
        }
        if self.resources.default_ttl_seconds == 0 || self.resources.sweep_seconds == 0 {
            return Err(crate::error::BrainError::Config(
                "resources default_ttl_seconds and sweep_seconds must be greater than 0"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = crate::error::BrainError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Config =
            toml::from_str(toml_str).map_err(|source| crate::error::BrainError::ConfigParse {
                path: "<string>".to_string(),
                source,
            })?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[server]
host = "127.0.0.1"
port = 3000

[backends.agent]
base_url = "http://localhost:8080/v1"
model = "agent-30b"

[backends.direct]
base_url = "http://localhost:11434/v1"
model = "direct-8b"
"#;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = Config::from_str(MINIMAL).unwrap();
        assert_eq!(config.server.request_timeout_seconds, 60);
        assert!(config.classifier.enabled());
        assert_eq!(config.classifier.complexity_threshold(), 0.45);
        assert_eq!(config.classifier.confidence_threshold(), 0.60);
        assert!(!config.experiment.enabled);
        assert_eq!(config.experiment.monitored_backend, BackendKind::Direct);
        assert_eq!(config.prompt_cache.max_entries, 128);
        assert_eq!(config.resources.max_cache_entries, 256);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_backend_defaults_applied() {
        let config = Config::from_str(MINIMAL).unwrap();
        let agent = &config.backends.agent;
        assert_eq!(agent.max_tokens(), 4096);
        assert_eq!(agent.temperature(), 0.7);
        assert_eq!(agent.max_tool_steps(), 6);
        assert_eq!(agent.timeout_seconds(), None);
    }

    #[test]
    fn test_timeout_for_backend_prefers_override() {
        let toml_str = r#"
[server]
host = "127.0.0.1"
port = 3000
request_timeout_seconds = 45

[backends.agent]
base_url = "http://localhost:8080/v1"
model = "agent-30b"
timeout_seconds = 120

[backends.direct]
base_url = "http://localhost:11434/v1"
model = "direct-8b"
"#;
        let config = Config::from_str(toml_str).unwrap();
        assert_eq!(
            config.timeout_for_backend(BackendKind::Agent),
            Duration::from_secs(120)
        );
        assert_eq!(
            config.timeout_for_backend(BackendKind::Direct),
            Duration::from_secs(45)
        );
    }

    #[test]
    fn test_classifier_threshold_out_of_range_rejected_at_parse_time() {
        let toml_str = format!("{MINIMAL}\n[classifier]\ncomplexity_threshold = 1.5\n");
        let err = Config::from_str(&toml_str).unwrap_err();
        assert!(err.to_string().contains("complexity_threshold"));
    }

    #[test]
    fn test_classifier_negative_confidence_rejected() {
        let toml_str = format!("{MINIMAL}\n[classifier]\nconfidence_threshold = -0.1\n");
        assert!(Config::from_str(&toml_str).is_err());
    }

    #[test]
    fn test_classifier_duplicate_field_rejected() {
        let toml_str = format!(
            "{MINIMAL}\n[classifier]\nenabled = true\ncomplexity_threshold = 0.4\n\
             complexity_threshold = 0.5\n"
        );
        assert!(Config::from_str(&toml_str).is_err());
    }

    #[test]
    fn test_base_url_must_end_with_v1() {
        let toml_str = r#"
[server]
host = "127.0.0.1"
port = 3000

[backends.agent]
base_url = "http://localhost:8080"
model = "agent-30b"

[backends.direct]
base_url = "http://localhost:11434/v1"
model = "direct-8b"
"#;
        let err = Config::from_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("/v1"));
    }

    #[test]
    fn test_base_url_must_have_scheme() {
        let toml_str = r#"
[server]
host = "127.0.0.1"
port = 3000

[backends.agent]
base_url = "localhost:8080/v1"
model = "agent-30b"

[backends.direct]
base_url = "http://localhost:11434/v1"
model = "direct-8b"
"#;
        assert!(Config::from_str(toml_str).is_err());
    }

    #[test]
    fn test_rollout_percent_over_100_rejected() {
        let toml_str = format!("{MINIMAL}\n[experiment]\nenabled = true\nrollout_percent = 101\n");
        let err = Config::from_str(&toml_str).unwrap_err();
        assert!(err.to_string().contains("rollout_percent"));
    }

    #[test]
    fn test_window_shorter_than_tick_rejected() {
        let toml_str = format!(
            "{MINIMAL}\n[experiment]\nenabled = true\nwindow_seconds = 10\ntick_seconds = 60\n"
        );
        assert!(Config::from_str(&toml_str).is_err());
    }

    #[test]
    fn test_error_rate_ceiling_bounds() {
        let toml_str = format!("{MINIMAL}\n[experiment]\nerror_rate_ceiling = 1.2\n");
        assert!(Config::from_str(&toml_str).is_err());
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let toml_str = r#"
[server]
host = "127.0.0.1"
port = 3000
request_timeout_seconds = 0

[backends.agent]
base_url = "http://localhost:8080/v1"
model = "agent-30b"

[backends.direct]
base_url = "http://localhost:11434/v1"
model = "direct-8b"
"#;
        assert!(Config::from_str(toml_str).is_err());
    }

    #[test]
    fn test_backend_timeout_over_300_rejected() {
        let toml_str = r#"
[server]
host = "127.0.0.1"
port = 3000

[backends.agent]
base_url = "http://localhost:8080/v1"
model = "agent-30b"
timeout_seconds = 301

[backends.direct]
base_url = "http://localhost:11434/v1"
model = "direct-8b"
"#;
        assert!(Config::from_str(toml_str).is_err());
    }

    #[test]
    fn test_max_tool_steps_bounds() {
        let toml_str = r#"
[server]
host = "127.0.0.1"
port = 3000

[backends.agent]
base_url = "http://localhost:8080/v1"
model = "agent-30b"
max_tool_steps = 0

[backends.direct]
base_url = "http://localhost:11434/v1"
model = "direct-8b"
"#;
        assert!(Config::from_str(toml_str).is_err());
    }

    #[test]
    fn test_zero_prompt_cache_entries_rejected() {
        let toml_str = format!("{MINIMAL}\n[prompt_cache]\nmax_entries = 0\n");
        assert!(Config::from_str(&toml_str).is_err());
    }

    #[test]
    fn test_zero_memory_watermark_rejected() {
        let toml_str = format!("{MINIMAL}\n[resources]\nmemory_watermark_bytes = 0\n");
        assert!(Config::from_str(&toml_str).is_err());
    }

    #[test]
    fn test_monitored_backend_parses_agent() {
        let toml_str = format!("{MINIMAL}\n[experiment]\nmonitored_backend = \"agent\"\n");
        let config = Config::from_str(&toml_str).unwrap();
        assert_eq!(config.experiment.monitored_backend, BackendKind::Agent);
    }

    #[test]
    fn test_from_file_reports_missing_path() {
        let err = Config::from_file("/nonexistent/duoroute.toml").unwrap_err();
        assert!(matches!(
            err,
            crate::error::BrainError::ConfigFileRead { .. }
        ));
    }

    #[test]
    fn test_from_file_round_trip() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.backends.direct.model(), "direct-8b");
    }
}
