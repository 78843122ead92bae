use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration — maps to `config.json` under the state directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding operator-editable identity files and user skills.
    pub workspace_path: PathBuf,
    /// Directory holding session logs, memory index and the cron table.
    pub state_path: PathBuf,
    pub provider: ProviderConfig,
    pub gateway: GatewayConfig,
    pub scheduler: SchedulerConfig,
    pub engine: EngineConfig,
    pub channels: HashMap<String, ChannelConfig>,
    pub logging: LoggingConfig,
}

// ── Provider ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Primary model identifier in `vendor/model` form.
    pub model: String,
    /// Ordered fallback chain tried on provider_timeout / rate_limit /
    /// auth_missing.
    pub fallback: Vec<String>,
    /// Anthropic API key. Environment variable takes priority.
    pub anthropic_api_key: Option<String>,
    /// OpenAI-compatible API key. Environment variable takes priority.
    pub openai_api_key: Option<String>,
    /// Custom base URL for the OpenAI-compatible endpoint (proxy setups).
    pub openai_base_url: Option<String>,
    /// Local model used when every remote provider fails, e.g.
    /// "local/llama3". None disables offline mode.
    pub offline_model: Option<String>,
    /// Address of the local inference server.
    pub local_base_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".into(),
            fallback: vec![],
            anthropic_api_key: None,
            openai_api_key: None,
            openai_base_url: None,
            offline_model: None,
            local_base_url: "http://127.0.0.1:11434".into(),
        }
    }
}

// ── Gateway ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token protecting every route except /health. Generated and
    /// persisted on first run when empty.
    pub token: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            token: String::new(),
        }
    }
}

// ── Scheduler ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub heartbeat_interval_seconds: u64,
    /// IANA timezone name used to interpret 5-field cron expressions.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 1800,
            timezone: "UTC".into(),
        }
    }
}

// ── Engine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tool-call loop bound per run.
    pub max_turns: u32,
    /// How many trailing session messages enter the prompt.
    pub history_limit: usize,
    /// Token budget for the history section; the smaller of the two wins.
    pub history_token_budget: usize,
    /// Memory snippets selected by lexical overlap.
    pub memory_top_k: usize,
    /// Hard timeout for a single tool execution.
    pub tool_timeout_secs: u64,
    /// Per-request provider timeout.
    pub provider_timeout_secs: u64,
    /// Max tokens per assistant response.
    pub max_tokens: u32,
    pub temperature: f32,
    /// Cross-session engine parallelism. 0 = number of cores × 2.
    pub max_concurrent_sessions: usize,
    /// Outbound idempotency dedupe window.
    pub outbound_dedupe_window_secs: u64,
    /// Idle time after which a session is consolidated into memory.
    pub idle_timeout_secs: u64,
    /// Bounded capacity of the inbound/outbound queues.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: 8,
            history_limit: 20,
            history_token_budget: 8_000,
            memory_top_k: 5,
            tool_timeout_secs: 120,
            provider_timeout_secs: 120,
            max_tokens: 4096,
            temperature: 0.7,
            max_concurrent_sessions: 0,
            outbound_dedupe_window_secs: 300,
            idle_timeout_secs: 1800,
            queue_capacity: 1000,
        }
    }
}

// ── Channels ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    /// Credential for the single-account form.
    pub token: String,
    /// Multi-account form; when non-empty, `token` is ignored.
    pub accounts: Vec<AccountConfig>,
    /// Sender identifiers allowed to create sessions. Input from anyone
    /// else is rejected before it reaches the bus.
    pub allow_from: Vec<String>,
    /// Long-poll server-side timeout.
    pub poll_timeout_secs: u64,
    /// Per-attempt outbound send timeout.
    pub send_timeout_secs: u64,
    /// Outbound attempts before giving up.
    pub max_send_attempts: u32,
    /// Channel to republish to when the circuit is open.
    pub fallback_channel: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            accounts: vec![],
            allow_from: vec![],
            poll_timeout_secs: 30,
            send_timeout_secs: 10,
            max_send_attempts: 5,
            fallback_channel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account: String,
    pub token: String,
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Default for root ───────────────────────────────────────────

impl Default for AppConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            workspace_path: home.join(".clawlite").join("workspace"),
            state_path: home.join(".clawlite").join("state"),
            provider: ProviderConfig::default(),
            gateway: GatewayConfig::default(),
            scheduler: SchedulerConfig::default(),
            engine: EngineConfig::default(),
            channels: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
        };
        write!(f, "[{}] {}: {}", tag, self.field, self.message)
    }
}

impl AppConfig {
    /// Validate the config. Warnings are returned for logging; any
    /// error-severity finding makes the whole load fail.
    pub fn validate(&self) -> std::result::Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        if self.provider.model.is_empty() {
            warnings.push(ConfigWarning {
                field: "provider.model".into(),
                message: "model is empty; set e.g. 'openai/gpt-4o-mini'".into(),
                severity: WarningSeverity::Error,
            });
        } else if !self.provider.model.contains('/') {
            warnings.push(ConfigWarning {
                field: "provider.model".into(),
                message: format!(
                    "model '{}' should be in 'vendor/model' form",
                    self.provider.model
                ),
                severity: WarningSeverity::Warning,
            });
        }

        if self.gateway.port == 0 {
            warnings.push(ConfigWarning {
                field: "gateway.port".into(),
                message: "port 0 is not a usable listen port".into(),
                severity: WarningSeverity::Error,
            });
        }
        if self.gateway.host == "0.0.0.0" && self.gateway.token.is_empty() {
            warnings.push(ConfigWarning {
                field: "gateway.token".into(),
                message: "gateway is network-accessible with no bearer token".into(),
                severity: WarningSeverity::Warning,
            });
        }

        if self.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
            warnings.push(ConfigWarning {
                field: "scheduler.timezone".into(),
                message: format!("unknown IANA timezone '{}'", self.scheduler.timezone),
                severity: WarningSeverity::Error,
            });
        }
        if self.scheduler.heartbeat_interval_seconds < 5 {
            warnings.push(ConfigWarning {
                field: "scheduler.heartbeat_interval_seconds".into(),
                message: "interval below 5s will hammer the provider".into(),
                severity: WarningSeverity::Warning,
            });
        }

        if self.engine.max_turns == 0 {
            warnings.push(ConfigWarning {
                field: "engine.max_turns".into(),
                message: "max_turns 0 means the engine can never answer".into(),
                severity: WarningSeverity::Error,
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
            });
        }
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
            });
        }

        for (name, ch) in &self.channels {
            if !ch.enabled {
                continue;
            }
            if ch.token.is_empty() && ch.accounts.is_empty() {
                warnings.push(ConfigWarning {
                    field: format!("channels.{name}"),
                    message: "enabled channel has neither token nor accounts".into(),
                    severity: WarningSeverity::Error,
                });
            }
            if ch.allow_from.is_empty() {
                warnings.push(ConfigWarning {
                    field: format!("channels.{name}.allow_from"),
                    message: "empty allowlist rejects every sender".into(),
                    severity: WarningSeverity::Warning,
                });
            }
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();
        if !errors.is_empty() {
            return Err(format!("configuration errors:\n  - {}", errors.join("\n  - ")));
        }
        Ok(warnings)
    }

    /// Effective cross-session engine parallelism.
    pub fn engine_concurrency(&self) -> usize {
        if self.engine.max_concurrent_sessions > 0 {
            self.engine.max_concurrent_sessions
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(8)
        }
    }
}
