use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use clawlite_channels::{ChannelManager, TelegramConnector, WorkerStatus};
use clawlite_config::{ConfigLoader, WorkspaceLoader};
use clawlite_core::{
    BusStats, EventBus, InboundMessage, InboundReceiver, MessageBus, OutboundMessage,
    OutboundReceiver,
};
use clawlite_core::{ClawLiteError, Result};
use clawlite_llm::{
    anthropic::AnthropicProvider, local::LocalProvider, openai::OpenAiProvider, ProviderRouter,
};
use clawlite_memory::{MemoryIndex, SessionStore};
use clawlite_skills::{SkillRegistry, SkillRunner};

use crate::cancel::CancelRegistry;
use crate::engine::AgentEngine;
use crate::heartbeat::{ActivityTracker, HeartbeatService};
use crate::scheduler::{CronHandle, CronService, CronStore};
use crate::subagent::SubagentManager;
use crate::tools::{
    cron_tool_def, exec_tool_def, file_tool_defs, mcp_tool_def, message_tool_def,
    skill_tool_def, spawn_tool_def, web_fetch_tool_def, CronTool, EditFileTool, ExecTool,
    ListDirTool, McpTool, MessageTool, ReadFileTool, SkillTool, SpawnTool, ToolRegistry,
    WebFetchTool, WriteFileTool,
};

/// Read-only snapshot for the gateway's status surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub uptime_seconds: u64,
    pub model: String,
    pub active_sessions: usize,
    pub skills: usize,
    pub memory_entries: usize,
    pub subagents_active: usize,
    pub queue: BusStats,
    pub channels: Vec<WorkerStatus>,
}

/// The whole runtime plane as one explicit value constructed at boot and
/// passed to every collaborator — no process-wide singletons beyond
/// logging.
pub struct Runtime {
    pub config: Arc<RwLock<clawlite_config::AppConfig>>,
    pub bus: MessageBus,
    pub events: EventBus,
    pub engine: Arc<AgentEngine>,
    pub manager: Arc<ChannelManager>,
    pub cron: Arc<CronService>,
    pub cron_handle: CronHandle,
    pub heartbeat: Arc<HeartbeatService>,
    pub activity: Arc<ActivityTracker>,
    pub subagents: Arc<SubagentManager>,
    pub skills: Arc<RwLock<SkillRegistry>>,
    pub memory: Arc<MemoryIndex>,
    inbound_rx: Mutex<Option<InboundReceiver>>,
    outbound_rx: Mutex<Option<OutboundReceiver>>,
    started_at: Instant,
}

/// Builtin skills live next to the binary (shipped with it).
fn builtin_skills_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join("skills")))
        .unwrap_or_else(|| PathBuf::from("skills"))
}

impl Runtime {
    /// Wire every component from the loaded configuration. Workspace files
    /// are materialized here on first run.
    pub fn build(loader: &ConfigLoader) -> Result<Arc<Self>> {
        let cfg = loader.get();
        let config = loader.shared();
        let events = EventBus::default();

        let workspace = Arc::new(WorkspaceLoader::new(cfg.workspace_path.clone()));
        workspace.bootstrap()?;

        let sessions = Arc::new(SessionStore::open(cfg.state_path.join("sessions"))?);
        let memory = Arc::new(MemoryIndex::open(cfg.state_path.join("memory.jsonl"))?);

        // Marketplace downloads live beside the state directory
        let marketplace_root = cfg
            .state_path
            .parent()
            .map(|root| root.join("marketplace").join("skills"))
            .unwrap_or_else(|| cfg.state_path.join("marketplace").join("skills"));
        let mut skills = SkillRegistry::new(
            builtin_skills_root(),
            workspace.skills_dir(),
            marketplace_root,
        );
        let loaded = skills.discover()?;
        info!(count = loaded.len(), "skills discovered");
        let skills = Arc::new(RwLock::new(skills));

        let tools = Arc::new(ToolRegistry::new(Duration::from_secs(
            cfg.engine.tool_timeout_secs,
        )));
        tools.register(exec_tool_def(), Arc::new(ExecTool))?;
        let file_defs = file_tool_defs();
        tools.register(file_defs[0].clone(), Arc::new(ReadFileTool))?;
        tools.register(file_defs[1].clone(), Arc::new(WriteFileTool))?;
        tools.register(file_defs[2].clone(), Arc::new(EditFileTool))?;
        tools.register(file_defs[3].clone(), Arc::new(ListDirTool))?;
        tools.register(web_fetch_tool_def(), Arc::new(WebFetchTool::new()))?;
        tools.register(mcp_tool_def(), Arc::new(McpTool::new()))?;
        tools.register(
            skill_tool_def(),
            Arc::new(SkillTool::new(
                Arc::clone(&skills),
                SkillRunner::new(Duration::from_secs(cfg.engine.tool_timeout_secs)),
            )),
        )?;

        // Providers: env-first credentials were resolved at config load.
        let mut router = ProviderRouter::new(
            cfg.provider.fallback.clone(),
            cfg.provider.offline_model.clone(),
        );
        if let Some(ref key) = cfg.provider.anthropic_api_key {
            router.add_provider(Arc::new(AnthropicProvider::new(key.clone())));
        }
        if let Some(ref key) = cfg.provider.openai_api_key {
            let mut provider = OpenAiProvider::new(key.clone());
            if let Some(ref base) = cfg.provider.openai_base_url {
                provider = provider.with_base_url(base.clone());
            }
            router.add_provider(Arc::new(provider));
        }
        if let Some(ref offline) = cfg.provider.offline_model {
            let model = offline.split_once('/').map(|(_, m)| m).unwrap_or(offline);
            router.add_provider(Arc::new(LocalProvider::new(
                cfg.provider.local_base_url.clone(),
                model.to_string(),
            )));
        }
        if !router.has_providers() {
            warn!("no LLM providers configured — the engine cannot think");
        }
        let router = Arc::new(router);

        let (bus, inbound_rx, outbound_rx) = MessageBus::new(
            cfg.engine.queue_capacity,
            Duration::from_secs(cfg.engine.outbound_dedupe_window_secs),
        );

        let cancel = CancelRegistry::new();
        let engine = AgentEngine::new(
            Arc::clone(&config),
            Arc::clone(&router),
            Arc::clone(&tools),
            Arc::clone(&sessions),
            Arc::clone(&memory),
            Arc::clone(&skills),
            Arc::clone(&workspace),
            cancel,
            events.clone(),
        );

        let subagents = SubagentManager::new(Arc::clone(&engine), bus.clone());
        tools.register(spawn_tool_def(), Arc::new(SpawnTool::new(Arc::clone(&subagents))))?;
        tools.register(message_tool_def(), Arc::new(MessageTool::new(bus.clone())))?;

        let tz: chrono_tz::Tz = cfg
            .scheduler
            .timezone
            .parse()
            .map_err(|_| ClawLiteError::ConfigInvalid(format!(
                "unknown timezone '{}'",
                cfg.scheduler.timezone
            )))?;
        let cron_store = Arc::new(CronStore::open(&cfg.state_path.join("cron.db"))?);
        let cron_handle = CronHandle::new(Arc::clone(&cron_store), tz);
        tools.register(cron_tool_def(), Arc::new(CronTool::new(cron_handle.clone())))?;
        let cron = CronService::new(
            cron_store,
            tz,
            Arc::clone(&engine) as Arc<dyn crate::scheduler::JobRunner>,
            bus.clone(),
            events.clone(),
        );

        let activity = ActivityTracker::new();
        let heartbeat = HeartbeatService::new(
            Duration::from_secs(cfg.scheduler.heartbeat_interval_seconds),
            Arc::clone(&engine) as Arc<dyn crate::scheduler::JobRunner>,
            bus.clone(),
            events.clone(),
            Arc::clone(&activity),
            Arc::clone(&workspace),
        );

        let manager = Arc::new(ChannelManager::new(bus.clone(), events.clone()));

        Ok(Arc::new(Self {
            config,
            bus,
            events,
            engine,
            manager,
            cron,
            cron_handle,
            heartbeat,
            activity,
            subagents,
            skills,
            memory,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            started_at: Instant::now(),
        }))
    }

    /// Start every background loop: channel instances, the outbound pump,
    /// the inbound dispatcher, cron, heartbeat and the idle sweeper.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let cfg = self.config.read().clone();

        // Channel instances, one per (channel, account)
        for (name, channel_cfg) in &cfg.channels {
            if !channel_cfg.enabled {
                continue;
            }
            if name != "telegram" {
                warn!(channel = %name, "unsupported channel type, skipping");
                continue;
            }
            let accounts: Vec<(String, String)> = if channel_cfg.accounts.is_empty() {
                vec![("default".to_string(), channel_cfg.token.clone())]
            } else {
                channel_cfg
                    .accounts
                    .iter()
                    .map(|a| (a.account.clone(), a.token.clone()))
                    .collect()
            };
            for (account, token) in accounts {
                let connector = Arc::new(TelegramConnector::new(
                    account,
                    token,
                    channel_cfg.poll_timeout_secs,
                ));
                self.manager
                    .start_instance(
                        connector,
                        channel_cfg,
                        Duration::from_secs(cfg.engine.outbound_dedupe_window_secs),
                    )
                    .await?;
            }
        }

        // Outbound pump
        if let Some(outbound_rx) = self.outbound_rx.lock().take() {
            self.manager.run_outbound(outbound_rx);
        }

        // Inbound dispatcher
        if let Some(inbound_rx) = self.inbound_rx.lock().take() {
            let runtime = Arc::clone(&self);
            tokio::spawn(async move {
                dispatch_loop(runtime, inbound_rx).await;
            });
        }

        // Scheduler + heartbeat
        tokio::spawn(Arc::clone(&self.cron).run());
        tokio::spawn(Arc::clone(&self.heartbeat).run());

        // Idle consolidation sweeper
        {
            let runtime = Arc::clone(&self);
            let idle = Duration::from_secs(cfg.engine.idle_timeout_secs);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    for session in runtime.activity.drain_idle(idle) {
                        if let Err(e) = runtime.engine.consolidate_session(&session).await {
                            warn!(session = %session, error = %e, "idle consolidation failed");
                        }
                    }
                }
            });
        }

        info!("runtime started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.manager.stop_all().await;
        self.events.publish(clawlite_core::Event::Shutdown);
        info!("runtime stopped");
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            uptime_seconds: self.uptime_seconds(),
            model: self.config.read().provider.model.clone(),
            active_sessions: self.activity.session_count(),
            skills: self.skills.read().count(),
            memory_entries: self.memory.count(),
            subagents_active: self.subagents.active_count(),
            queue: self.bus.stats(),
            channels: self.manager.status(),
        }
    }
}

/// Inbound dispatch: each session gets a serialized worker (strict FIFO
/// within the session); a global semaphore bounds cross-session
/// parallelism. `/stop` bypasses the session queue so cancellation is
/// immediate even while a run is in flight.
async fn dispatch_loop(runtime: Arc<Runtime>, mut rx: InboundReceiver) {
    let concurrency = runtime.config.read().engine_concurrency();
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut workers: HashMap<String, mpsc::UnboundedSender<InboundMessage>> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        runtime
            .activity
            .record(&msg.session_id, msg.reply_handle.clone());

        if msg.text.trim() == "/stop" {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                let result = runtime.engine.stop_session(&msg.session_id).await;
                let reply =
                    OutboundMessage::text(msg.session_id.clone(), msg.reply_handle, result.text);
                let _ = runtime.bus.publish_outbound(reply).await;
            });
            continue;
        }

        let key = msg.session_id.to_string();
        let sender = workers
            .entry(key)
            .or_insert_with(|| spawn_session_worker(Arc::clone(&runtime), Arc::clone(&semaphore)));
        if sender.send(msg).is_err() {
            warn!("session worker died, message dropped");
        }
    }
}

fn spawn_session_worker(
    runtime: Arc<Runtime>,
    semaphore: Arc<Semaphore>,
) -> mpsc::UnboundedSender<InboundMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(_permit) = semaphore.acquire().await else {
                break;
            };
            let reply_text = match runtime.engine.run(&msg.session_id, &msg.text).await {
                Ok(result) => result.text,
                Err(e) if e.kind() == "session_cancelled" => {
                    // stop_session already produced the reply
                    continue;
                }
                Err(e) => {
                    warn!(session = %msg.session_id, error = %e, "engine run failed");
                    format!("Something went wrong ({}). Try again in a moment.", e.kind())
                }
            };
            if reply_text.is_empty() {
                continue;
            }
            let reply = OutboundMessage::text(msg.session_id.clone(), msg.reply_handle, reply_text);
            if let Err(e) = runtime.bus.publish_outbound(reply).await {
                warn!(error = %e, "reply publish failed");
            }
        }
    });
    tx
}
