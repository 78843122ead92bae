use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use clawlite_core::{ClawLiteError, MessageBus, OutboundMessage, SessionId};

use crate::engine::AgentEngine;

/// One delegated background run.
#[derive(Debug, Clone)]
pub struct SubagentRun {
    pub run_id: String,
    pub parent: SessionId,
    pub child: SessionId,
    pub objective: String,
    pub status: RunStatus,
    pub result: String,
    pub error: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Done,
    Error,
    Cancelled,
}

/// Spawns isolated short-lived agent runs and returns their results to the
/// originating session via the outbound queue. Each child session is linked
/// to its parent so a `/stop` on the parent cancels the whole tree.
///
/// Clones share the run table.
#[derive(Clone)]
pub struct SubagentManager {
    engine: Arc<AgentEngine>,
    bus: MessageBus,
    runs: Arc<Mutex<HashMap<String, SubagentRun>>>,
}

impl SubagentManager {
    pub fn new(engine: Arc<AgentEngine>, bus: MessageBus) -> Arc<Self> {
        Arc::new(Self {
            engine,
            bus,
            runs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Spawn a child run. Returns the run id immediately; the result is
    /// published back to the parent session when the child finishes.
    pub async fn spawn(&self, parent: &SessionId, objective: &str) -> String {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let child = SessionId::parse(&format!("sub:{}", &run_id[..12]))
            .expect("sub session ids are well-formed");

        self.engine.cancel_registry().link_child(parent, &child);

        let run = SubagentRun {
            run_id: run_id.clone(),
            parent: parent.clone(),
            child: child.clone(),
            objective: objective.to_string(),
            status: RunStatus::Running,
            result: String::new(),
            error: String::new(),
            started_at: Utc::now(),
            finished_at: None,
        };
        self.runs.lock().insert(run_id.clone(), run);
        info!(run_id = %run_id, parent = %parent, "subagent spawned");

        let manager = self.clone();
        let parent = parent.clone();
        let objective = objective.to_string();
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            let outcome = manager.engine.run(&child, &objective).await;
            let publish = {
                let mut runs = manager.runs.lock();
                let Some(run) = runs.get_mut(&task_run_id) else {
                    return;
                };
                run.finished_at = Some(Utc::now());
                match outcome {
                    Ok(result) => {
                        run.status = RunStatus::Done;
                        run.result = result.text.clone();
                        Some(result.text)
                    }
                    Err(ClawLiteError::SessionCancelled) => {
                        run.status = RunStatus::Cancelled;
                        None
                    }
                    Err(e) => {
                        run.status = RunStatus::Error;
                        run.error = e.to_string();
                        warn!(run_id = %task_run_id, error = %e, "subagent run failed");
                        None
                    }
                }
            };

            if let Some(text) = publish {
                let msg =
                    OutboundMessage::text(parent, None, format!("Subagent finished:\n{text}"));
                if let Err(e) = manager.bus.publish_outbound(msg).await {
                    warn!(run_id = %task_run_id, error = %e, "subagent result publish failed");
                }
            }
        });

        run_id
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.runs.lock().get(run_id).cloned()
    }

    pub fn list(&self, parent: Option<&SessionId>) -> Vec<SubagentRun> {
        let runs = self.runs.lock();
        let mut out: Vec<SubagentRun> = runs
            .values()
            .filter(|r| parent.map(|p| &r.parent == p).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }

    pub fn active_count(&self) -> usize {
        self.runs
            .lock()
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .count()
    }
}
