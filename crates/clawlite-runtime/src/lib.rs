//! # clawlite-runtime
//!
//! The runtime plane that binds ClawLite together: the agent engine (prompt
//! assembly, bounded tool-call loop, cancellation, provider fallback), the
//! typed tool registry with the builtin tool set, the cron scheduler and
//! heartbeat, subagent spawning, and the explicit [`Runtime`] value that
//! wires every component at boot.
//!
//! ```text
//!   Channels ──inbound──▶ MessageBus ──▶ per-session workers ──▶ Engine
//!      ▲                                                            │
//!      └───────────── outbound dispatch ◀── MessageBus ◀────────────┘
//!                                             ▲
//!                     Scheduler / Heartbeat ──┘
//! ```

pub mod cancel;
pub mod engine;
pub mod heartbeat;
pub mod prompt;
pub mod runtime;
pub mod scheduler;
pub mod subagent;
pub mod tools;

pub use cancel::CancelRegistry;
pub use engine::{AgentEngine, AssistantMeta, AssistantResult};
pub use heartbeat::{ActivityTracker, HeartbeatService};
pub use runtime::Runtime;
pub use scheduler::{CronHandle, CronJob, CronService, JobRunner};
pub use tools::{ToolContext, ToolHandler, ToolRegistry};
