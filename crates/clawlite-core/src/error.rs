use thiserror::Error;

/// Unified error type for the entire ClawLite runtime.
///
/// Variants map one-to-one to the wire-level error kinds surfaced in logs,
/// events and API responses; `kind()` returns the stable kind string.
#[derive(Error, Debug)]
pub enum ClawLiteError {
    // ── Config ─────────────────────────────────────────────────
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    // ── Auth ───────────────────────────────────────────────────
    #[error("missing credentials for {0}")]
    AuthMissing(String),

    #[error("invalid credentials for {0}")]
    AuthInvalid(String),

    // ── Provider ───────────────────────────────────────────────
    #[error("provider request timed out after {timeout_secs}s")]
    ProviderTimeout { timeout_secs: u64 },

    #[error("provider rate limited, retry after {retry_after_secs}s")]
    ProviderRateLimited { retry_after_secs: u64 },

    #[error("provider send failed: {0}")]
    ProviderSendFailed(String),

    #[error("provider circuit open: {0}")]
    ProviderCircuitOpen(String),

    #[error("no provider available for model: {0}")]
    ModelNotFound(String),

    // ── Channels ───────────────────────────────────────────────
    #[error("channel unavailable: {channel}: {reason}")]
    ChannelUnavailable { channel: String, reason: String },

    // ── Tools ──────────────────────────────────────────────────
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("invalid arguments for tool {tool}: {reason}")]
    ToolInvalidArgs { tool: String, reason: String },

    #[error("tool {tool} timed out after {timeout_secs}s")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("tool {tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    // ── Sessions / scheduler ───────────────────────────────────
    #[error("session cancelled")]
    SessionCancelled,

    #[error("session error: {0}")]
    Session(String),

    #[error("invalid cron expression: {0}")]
    CronExpressionInvalid(String),

    // ── Skills / memory ────────────────────────────────────────
    #[error("skill error: {0}")]
    Skill(String),

    #[error("memory error: {0}")]
    Memory(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ClawLiteError {
    /// Stable wire-level kind string, used in structured logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::AuthMissing(_) => "auth_missing",
            Self::AuthInvalid(_) => "auth_invalid",
            Self::ProviderTimeout { .. } => "provider_timeout",
            Self::ProviderRateLimited { .. } => "provider_rate_limited",
            Self::ProviderSendFailed(_) => "provider_send_failed",
            Self::ProviderCircuitOpen(_) => "provider_circuit_open",
            Self::ModelNotFound(_) => "provider_send_failed",
            Self::ChannelUnavailable { .. } => "channel_unavailable",
            Self::ToolNotFound(_) => "tool_not_found",
            Self::ToolInvalidArgs { .. } => "tool_invalid_args",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::ToolFailed { .. } => "tool_failed",
            Self::SessionCancelled => "session_cancelled",
            Self::Session(_) => "session_error",
            Self::CronExpressionInvalid(_) => "cron_expression_invalid",
            Self::Skill(_) => "skill_error",
            Self::Memory(_) => "memory_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Other(_) => "internal_error",
        }
    }

    /// True for errors that should trigger the engine's provider fallback
    /// chain rather than being surfaced immediately.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Self::ProviderTimeout { .. }
                | Self::ProviderRateLimited { .. }
                | Self::AuthMissing(_)
                | Self::ProviderCircuitOpen(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClawLiteError>;
