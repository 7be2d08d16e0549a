//! Command-line interface for Duoroute
//!
//! Provides argument parsing and subcommand handling for the Duoroute binary.

use clap::{Parser, Subcommand};

/// Hybrid dual-backend chat orchestrator
#[derive(Parser)]
#[command(name = "duoroute")]
#[command(version)]
#[command(about = "Hybrid dual-backend chat orchestrator")]
#[command(
    long_about = "Duoroute classifies each chat request and routes it to one of two \
    execution engines - a multi-step tool agent or a lower-latency direct model - \
    with one-shot fallback, gradual A/B rollout, and automatic rollback."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: String,

    /// Log level override ("trace", "debug", "info", "warn", "error").
    /// Takes precedence over observability.log_level from the config file.
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,

        /// Overwrite the output file if it already exists
        #[arg(short, long)]
        force: bool,
    },
}

/// Generate template configuration content
pub fn generate_config_template() -> &'static str {
    r#"# Duoroute Configuration
# ======================
#
# This file configures the HTTP server, the two execution engines, query
# classification, the A/B rollout experiment, caching, and observability.

# ─────────────────────────────────────────────────────────────────────────────
# SERVER CONFIGURATION
# ─────────────────────────────────────────────────────────────────────────────

[server]
# IP address to bind to (0.0.0.0 for all interfaces, 127.0.0.1 for localhost only)
host = "0.0.0.0"

# Port to listen on
port = 3000

# Default execution timeout in seconds, used for any backend that does not
# set its own timeout_seconds. Must be in (0, 300].
request_timeout_seconds = 60

# ─────────────────────────────────────────────────────────────────────────────
# EXECUTION ENGINES
# ─────────────────────────────────────────────────────────────────────────────
#
# Duoroute dispatches every request to exactly one of two engines:
#
#   - AGENT: the superset-capability engine. Runs a bounded multi-step tool
#     loop against a larger model; handles task manipulation, integrations,
#     and multi-step work.
#   - DIRECT: the lower-latency engine. One streamed generation against a
#     smaller model with a minimal fixed toolset resolved locally.
#
# Both speak the OpenAI-compatible /chat/completions dialect. Endpoint fields:
#   - base_url: API base URL (must end with /v1; /chat/completions is appended)
#   - model: model identifier passed to the engine
#   - max_tokens: generation budget per completion
#   - temperature: sampling temperature (0.0-2.0)
#   - timeout_seconds: per-backend execution timeout, (0, 300]; falls back to
#     server.request_timeout_seconds when omitted
#   - max_tool_steps: tool-loop iteration bound, [1, 32] (agent engine only)

[backends.agent]
base_url = "http://your-agent-server:8080/v1"
model = "your-30b-model"
max_tokens = 8192
temperature = 0.7
timeout_seconds = 120
max_tool_steps = 6

[backends.direct]
base_url = "http://your-direct-server:11434/v1"
model = "your-8b-model"
max_tokens = 4096
temperature = 0.7
timeout_seconds = 30

# ─────────────────────────────────────────────────────────────────────────────
# QUERY CLASSIFIER
# ─────────────────────────────────────────────────────────────────────────────

[classifier]
# When disabled, every request routes to the agent backend.
enabled = true

# Utterances scoring at or above this complexity route to the agent backend.
# Must be in [0, 1].
complexity_threshold = 0.45

# Decisions below this confidence fall back to the agent backend regardless
# of the recommendation. Must be in [0, 1].
confidence_threshold = 0.60

# ─────────────────────────────────────────────────────────────────────────────
# A/B ROLLOUT EXPERIMENT
# ─────────────────────────────────────────────────────────────────────────────
#
# Gradual rollout of the monitored backend with automatic rollback. Each
# user/session/IP identity is deterministically bucketed; rollout_percent of
# buckets are eligible for the monitored backend. The controller aggregates
# per-backend performance over a sliding window and rolls the experiment
# back (rollout to 0, one-way) when the monitored backend breaches the
# error-rate ceiling or success-rate floor.

[experiment]
enabled = false

# Share of bucketed identities eligible for the monitored backend, [0, 100].
rollout_percent = 0

# Which backend is being rolled out: "direct" or "agent".
monitored_backend = "direct"

# Aggregates are advisory until this many samples accumulate in the window.
min_samples = 50

# Rollback triggers. Rates are in [0, 1].
error_rate_ceiling = 0.25
success_rate_floor = 0.90

# Mean-latency advantage (percent) the monitored backend must show before
# the controller recommends increasing the rollout.
latency_gain_percent = 20.0

# Sliding window length and evaluation cadence, in seconds. The window must
# be at least one tick long.
window_seconds = 900
tick_seconds = 60

# ─────────────────────────────────────────────────────────────────────────────
# SYSTEM PROMPT CACHE
# ─────────────────────────────────────────────────────────────────────────────

[prompt_cache]
# Entry-count ceiling; oldest-by-last-access entries are evicted beyond it.
max_entries = 128

# Per-entry time-to-live and background sweep cadence, in seconds.
ttl_seconds = 300
sweep_seconds = 60

# Directory holding {model}.md prompt templates (default.md as fallback).
template_dir = "prompts"

# ─────────────────────────────────────────────────────────────────────────────
# RESOURCE MANAGER
# ─────────────────────────────────────────────────────────────────────────────

[resources]
# General-purpose cache limits.
max_cache_entries = 256
default_ttl_seconds = 120

# Ceiling on registered cleanup handles.
max_tracked_resources = 64

# Byte watermark (sum of estimated entry sizes) above which the sweep evicts
# a larger fraction of the cache. 8 MiB.
memory_watermark_bytes = 8388608

# Background sweep cadence in seconds.
sweep_seconds = 30

# ─────────────────────────────────────────────────────────────────────────────
# OBSERVABILITY
# ─────────────────────────────────────────────────────────────────────────────

[observability]
# Log level: "trace", "debug", "info", "warn", "error"
log_level = "info"

# Prometheus metrics are always available at /metrics on the server port
# For production, consider using a reverse proxy to restrict access
"#
}
