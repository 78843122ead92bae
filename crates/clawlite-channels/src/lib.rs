//! # clawlite-channels
//!
//! Chat-channel plumbing: the connector contract, the Telegram long-poll
//! implementation, per-instance outbound resilience (retry, circuit
//! breaker, idempotency, fallback), health evaluation and the manager that
//! supervises one worker per (channel, account).

pub mod adapter;
pub mod health;
pub mod manager;
pub mod outbound;
pub mod telegram;

pub use adapter::{ChannelConnector, ChannelEvent, IncomingEvent};
pub use health::{evaluate_outbound_health, HealthLevel, OutboundHealth};
pub use manager::{ChannelManager, WorkerStatus};
pub use outbound::{CircuitState, OutboundDispatcher, OutboundMetrics};
pub use telegram::TelegramConnector;
