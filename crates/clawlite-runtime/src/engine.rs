use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, info, warn};

use clawlite_config::{AppConfig, WorkspaceLoader};
use clawlite_core::{
    ChatMessage, ClawLiteError, Event, EventBus, Result, SessionId, ToolExecutor,
};
use clawlite_llm::{ChatRequest, ProviderRouter, StreamChunk, Usage};
use clawlite_memory::{MemoryIndex, SessionStore};
use clawlite_skills::SkillRegistry;

use crate::cancel::CancelRegistry;
use crate::prompt::{trim_history, PromptBuilder, PromptInputs};
use crate::scheduler::JobRunner;
use crate::tools::ToolRegistry;

/// Where and how a run was served, carried on every assistant result.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantMeta {
    pub model: String,
    /// "online" | "fallback" | "offline"
    pub mode: String,
    pub reason: String,
    pub tokens: u32,
    pub cost: f64,
    pub turns: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantResult {
    pub text: String,
    pub meta: AssistantMeta,
}

/// The agent engine: prompt assembly, the bounded tool-call loop, subagent
/// spawning (via the tool registry), per-session cancellation, and
/// session-end memory consolidation.
///
/// Engine invocations are serialized per session — an inbound message
/// arriving while the session is busy queues behind the current run.
pub struct AgentEngine {
    config: Arc<RwLock<AppConfig>>,
    router: Arc<ProviderRouter>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    memory: Arc<MemoryIndex>,
    skills: Arc<RwLock<SkillRegistry>>,
    prompt: PromptBuilder,
    cancel: CancelRegistry,
    run_locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
    events: EventBus,
}

impl AgentEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        router: Arc<ProviderRouter>,
        tools: Arc<ToolRegistry>,
        sessions: Arc<SessionStore>,
        memory: Arc<MemoryIndex>,
        skills: Arc<RwLock<SkillRegistry>>,
        workspace: Arc<WorkspaceLoader>,
        cancel: CancelRegistry,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            router,
            tools,
            sessions,
            memory,
            skills,
            prompt: PromptBuilder::new(workspace),
            cancel,
            run_locks: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn cancel_registry(&self) -> &CancelRegistry {
        &self.cancel
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    fn run_lock(&self, session_id: &SessionId) -> Arc<TokioMutex<()>> {
        let mut locks = self.run_locks.lock();
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(()))),
        )
    }

    /// Run one user message through the engine. `/stop` cancels every
    /// in-flight run of this session (subagents included) instead of
    /// starting a new one.
    pub async fn run(&self, session_id: &SessionId, user_text: &str) -> Result<AssistantResult> {
        if user_text.trim() == "/stop" {
            return Ok(self.stop_session(session_id).await);
        }
        self.run_inner(session_id, user_text, None).await
    }

    /// Streaming variant: text deltas are forwarded to `tx` as they arrive;
    /// the returned result carries the full text and meta.
    pub async fn run_streaming(
        &self,
        session_id: &SessionId,
        user_text: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<AssistantResult> {
        if user_text.trim() == "/stop" {
            return Ok(self.stop_session(session_id).await);
        }
        self.run_inner(session_id, user_text, Some(tx)).await
    }

    /// Resolve all cancellation handles for a session and its descendants,
    /// consolidate, and return the standardized cancelled reply. The host
    /// process stays alive.
    pub async fn stop_session(&self, session_id: &SessionId) -> AssistantResult {
        let resolved = self.cancel.cancel_session(session_id);
        info!(session = %session_id, resolved, "session stop requested");
        self.events.publish(Event::RunCancelled {
            session_id: session_id.to_string(),
        });
        if let Err(e) = self.consolidate_session(session_id).await {
            warn!(session = %session_id, error = %e, "consolidation on stop failed");
        }
        let model = self.config.read().provider.model.clone();
        AssistantResult {
            text: "Cancelled.".into(),
            meta: AssistantMeta {
                model,
                mode: "online".into(),
                reason: "session_cancelled".into(),
                tokens: 0,
                cost: 0.0,
                turns: 0,
            },
        }
    }

    async fn run_inner(
        &self,
        session_id: &SessionId,
        user_text: &str,
        stream_tx: Option<mpsc::Sender<String>>,
    ) -> Result<AssistantResult> {
        // Serialize runs per session
        let lock = self.run_lock(session_id);
        let _run_guard = lock.lock().await;

        let (_cancel_guard, mut cancel_token) = self.cancel.register(session_id);
        self.events.publish(Event::RunStarted {
            session_id: session_id.to_string(),
        });

        let cfg = self.config.read().clone();

        // Assemble the system block: identity files, tool sheet, skills,
        // memory, trailing history — in that order.
        let history = self.sessions.read_last(session_id, cfg.engine.history_limit)?;
        let history = trim_history(
            history,
            cfg.engine.history_limit,
            cfg.engine.history_token_budget,
        );
        let memory_snippets: Vec<String> = self
            .memory
            .search(user_text, cfg.engine.memory_top_k)
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.text)
            .collect();
        let (skill_catalog, always_skills) = {
            let skills = self.skills.read();
            (skills.catalog_block(), skills.always_bodies())
        };
        let system = self.prompt.build_system(&PromptInputs {
            tool_sheet: self.tools.tool_sheet(),
            skill_catalog,
            always_skills,
            memory_snippets,
            history: &history,
        });

        let user_msg = ChatMessage::user(user_text);
        self.sessions.append(session_id, &user_msg)?;
        let mut messages = vec![user_msg];

        let tool_defs = ToolExecutor::tools(self.tools.as_ref());
        let mut total_usage = Usage::default();
        let mut turns: u32 = 0;
        let mut model = cfg.provider.model.clone();
        let mut mode = "online".to_string();
        let mut reason = "primary".to_string();

        loop {
            if turns >= cfg.engine.max_turns {
                // No final text within the bound: surface the typed error
                // as a brief assistant message.
                warn!(session = %session_id, turns, "max_turns reached without final reply");
                let text =
                    "I could not finish within the tool-call limit. Send the request again to continue.";
                let brief = ChatMessage::assistant(text);
                self.sessions.append(session_id, &brief)?;
                return Ok(AssistantResult {
                    text: text.into(),
                    meta: AssistantMeta {
                        model,
                        mode,
                        reason: "max_turns_exceeded".into(),
                        tokens: total_usage.total_tokens(),
                        cost: total_usage.estimated_cost_usd,
                        turns,
                    },
                });
            }
            turns += 1;

            let request = ChatRequest {
                model: cfg.provider.model.clone(),
                messages: messages.clone(),
                tools: tool_defs.clone(),
                system: Some(system.clone()),
                max_tokens: cfg.engine.max_tokens,
                temperature: cfg.engine.temperature,
            };

            let (text, tool_calls, usage) = if let Some(ref tx) = stream_tx {
                let outcome = tokio::select! {
                    r = self.router.stream(&request) => r?,
                    _ = cancel_token.cancelled() => return Err(ClawLiteError::SessionCancelled),
                };
                model = outcome.model;
                mode = outcome.mode.as_str().to_string();
                reason = outcome.reason;

                let mut chunks = outcome.chunks;
                let mut text = String::new();
                let mut calls = Vec::new();
                let mut usage = Usage::default();
                loop {
                    tokio::select! {
                        chunk = chunks.recv() => match chunk {
                            Some(StreamChunk::TextDelta(delta)) => {
                                text.push_str(&delta);
                                let _ = tx.send(delta).await;
                            }
                            Some(StreamChunk::ToolCall(tc)) => calls.push(tc),
                            Some(StreamChunk::Usage(u)) => usage.merge(&u),
                            Some(StreamChunk::Error(e)) => {
                                return Err(ClawLiteError::ProviderSendFailed(e));
                            }
                            Some(StreamChunk::Done(_)) | None => break,
                        },
                        _ = cancel_token.cancelled() => return Err(ClawLiteError::SessionCancelled),
                    }
                }
                (text, calls, usage)
            } else {
                let outcome = tokio::select! {
                    r = self.router.complete(&request) => r?,
                    _ = cancel_token.cancelled() => return Err(ClawLiteError::SessionCancelled),
                };
                model = outcome.model;
                mode = outcome.mode.as_str().to_string();
                reason = outcome.reason;
                (
                    outcome.response.text,
                    outcome.response.tool_calls,
                    outcome.response.usage,
                )
            };
            total_usage.merge(&usage);

            let mut assistant = ChatMessage::assistant(&text);
            assistant.tool_calls = tool_calls.clone();
            assistant.tokens = Some(usage.total_tokens());
            assistant.cost = Some(usage.estimated_cost_usd);
            self.sessions.append(session_id, &assistant)?;
            messages.push(assistant);

            // The single contract: structured tool_calls continue the loop,
            // anything else is final text.
            if tool_calls.is_empty() {
                self.events.publish(Event::RunFinished {
                    session_id: session_id.to_string(),
                    turns,
                });
                return Ok(AssistantResult {
                    text,
                    meta: AssistantMeta {
                        model,
                        mode,
                        reason,
                        tokens: total_usage.total_tokens(),
                        cost: total_usage.estimated_cost_usd,
                        turns,
                    },
                });
            }

            for call in &tool_calls {
                debug!(session = %session_id, tool = %call.name, "dispatching tool call");
                let result = tokio::select! {
                    r = self.tools.execute(call, session_id) => r,
                    _ = cancel_token.cancelled() => return Err(ClawLiteError::SessionCancelled),
                };
                let record = ChatMessage::tool_for(call, &result.content);
                self.sessions.append(session_id, &record)?;
                messages.push(record);
            }
        }
    }

    /// Summarize the session log into a long-term memory entry tagged
    /// `session:<id>`. Idempotent within the index's debounce window.
    pub async fn consolidate_session(&self, session_id: &SessionId) -> Result<bool> {
        let tag = format!("session:{session_id}");
        if !self.memory.begin_consolidation(&tag) {
            debug!(session = %session_id, "consolidation debounced");
            return Ok(false);
        }
        let log = self.sessions.read_last(session_id, 40)?;
        if log.is_empty() {
            return Ok(false);
        }

        let transcript: String = log
            .iter()
            .filter_map(|m| {
                let content = m
                    .tool_result
                    .clone()
                    .unwrap_or_else(|| m.text.clone());
                (!content.is_empty()).then(|| format!("{}: {}", m.role.as_str(), content))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let cfg = self.config.read().clone();
        let request = ChatRequest {
            model: cfg.provider.model.clone(),
            messages: vec![ChatMessage::user(format!(
                "Summarize this conversation in under 120 words. Keep decisions, \
                 stated facts, preferences and open items. Output only the summary.\n\n{transcript}"
            ))],
            tools: vec![],
            system: None,
            max_tokens: 512,
            temperature: 0.3,
        };

        let summary = match self.router.complete(&request).await {
            Ok(outcome) => outcome.response.text,
            Err(e) => {
                // Provider down: keep a raw tail instead of losing the session
                warn!(session = %session_id, error = %e, "summarization failed, storing raw tail");
                transcript.chars().rev().take(600).collect::<Vec<_>>().into_iter().rev().collect()
            }
        };
        if summary.trim().is_empty() {
            return Ok(false);
        }

        self.memory.add(summary.trim(), &tag)?;
        self.events.publish(Event::SessionConsolidated {
            session_id: session_id.to_string(),
        });
        info!(session = %session_id, "session consolidated into memory");
        Ok(true)
    }
}

#[async_trait::async_trait]
impl JobRunner for AgentEngine {
    async fn run_job(&self, session_id: &SessionId, prompt: &str) -> Result<String> {
        self.run(session_id, prompt).await.map(|r| r.text)
    }
}
