use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use clawlite_core::{
    ClawLiteError, MessageBus, OutboundMessage, ReplyHandle, Result, SessionId, Tool, ToolCall,
    ToolExecutor, ToolResult,
};
use clawlite_skills::{split_command, SkillRegistry, SkillRunner};

use crate::scheduler::CronHandle;
use crate::subagent::SubagentManager;

/// Call-site context handed to every tool handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
}

/// A typed tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn run(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String>;
}

struct RegisteredTool {
    def: Tool,
    /// Required argument names, extracted from the schema at registration.
    required: Vec<String>,
    handler: Arc<dyn ToolHandler>,
}

/// Named callable tools with JSON-schema arguments.
///
/// Registration validates the schema once; dispatch validates required
/// arguments, applies the hard timeout, and folds every failure into an
/// error-flagged [`ToolResult`] so the model can choose another path.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a tool. The schema must be a JSON-schema object; `required`
    /// is captured here so dispatch never re-parses it.
    pub fn register(&self, def: Tool, handler: Arc<dyn ToolHandler>) -> Result<()> {
        if def.parameters.get("type").and_then(|t| t.as_str()) != Some("object") {
            return Err(ClawLiteError::ToolInvalidArgs {
                tool: def.name.clone(),
                reason: "parameters schema must be an object schema".into(),
            });
        }
        let required = def
            .parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut tools = self.tools.write();
        if tools.contains_key(&def.name) {
            return Err(ClawLiteError::ToolInvalidArgs {
                tool: def.name.clone(),
                reason: "tool already registered".into(),
            });
        }
        debug!(tool = %def.name, "registered tool");
        tools.insert(
            def.name.clone(),
            RegisteredTool {
                def,
                required,
                handler,
            },
        );
        Ok(())
    }

    pub fn definitions(&self) -> Vec<Tool> {
        let tools = self.tools.read();
        let mut defs: Vec<Tool> = tools.values().map(|t| t.def.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// The generated tool sheet for the system prompt: name, one-line
    /// description, argument schema.
    pub fn tool_sheet(&self) -> String {
        self.definitions()
            .iter()
            .map(|t| format!("- {}: {} args={}", t.name, t.description, t.parameters))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Execute one tool call. Never returns `Err` — failures become
    /// error-flagged results fed back to the model.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let (handler, required) = {
            let tools = self.tools.read();
            match tools.get(&call.name) {
                Some(t) => (Arc::clone(&t.handler), t.required.clone()),
                None => {
                    return ToolResult::error(call, format!("tool_not_found: {}", call.name));
                }
            }
        };

        let Some(args) = call.arguments.as_object() else {
            return ToolResult::error(
                call,
                format!("tool_invalid_args: {}: arguments must be an object", call.name),
            );
        };
        for key in &required {
            if !args.contains_key(key) {
                return ToolResult::error(
                    call,
                    format!("tool_invalid_args: {}: missing '{key}'", call.name),
                );
            }
        }

        match tokio::time::timeout(self.timeout, handler.run(&call.arguments, ctx)).await {
            Ok(Ok(content)) => ToolResult::ok(call, content),
            Ok(Err(e)) => {
                warn!(tool = %call.name, error = %e, "tool execution failed");
                ToolResult::error(call, format!("{}: {e}", e.kind()))
            }
            Err(_) => ToolResult::error(
                call,
                format!("tool_timeout: {} after {}s", call.name, self.timeout.as_secs()),
            ),
        }
    }
}

/// The registry is the runtime's [`ToolExecutor`] — the engine drives its
/// tool-call loop through this contract.
#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn tools(&self) -> Vec<Tool> {
        self.definitions()
    }

    async fn execute(&self, call: &ToolCall, session_id: &SessionId) -> ToolResult {
        let ctx = ToolContext {
            session_id: session_id.clone(),
        };
        self.dispatch(call, &ctx).await
    }
}

// ── Builtin: exec ──────────────────────────────────────────────

/// Run a shell command as a direct child process — the command string is
/// tokenized by quoting rules, never handed to a shell interpreter.
pub struct ExecTool;

#[async_trait]
impl ToolHandler for ExecTool {
    async fn run(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
        let command = args["command"].as_str().unwrap_or("").trim();
        if command.is_empty() {
            return Err(ClawLiteError::ToolInvalidArgs {
                tool: "exec".into(),
                reason: "command is required".into(),
            });
        }
        let timeout = Duration::from_secs_f64(args["timeout"].as_f64().unwrap_or(30.0).max(1.0));
        let argv = split_command(command)?;
        if argv.is_empty() {
            return Err(ClawLiteError::ToolInvalidArgs {
                tool: "exec".into(),
                reason: "empty command".into(),
            });
        }

        let child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) => return Ok(format!("exit=-1\nstdout=\nstderr={e}")),
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(format!(
                "exit={}\nstdout={}\nstderr={}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).trim(),
                String::from_utf8_lossy(&output.stderr).trim(),
            )),
            Ok(Err(e)) => Ok(format!("exit=-1\nstdout=\nstderr={e}")),
            Err(_) => Ok(format!(
                "exit=-1\nstdout=\nstderr=timeout after {}s",
                timeout.as_secs()
            )),
        }
    }
}

pub fn exec_tool_def() -> Tool {
    Tool {
        name: "exec".into(),
        description: "Run a shell command safely (argv, no shell) and return exit/stdout/stderr"
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "timeout": { "type": "number", "default": 30 }
            },
            "required": ["command"]
        }),
    }
}

// ── Builtin: files ─────────────────────────────────────────────

pub struct ReadFileTool;

#[async_trait]
impl ToolHandler for ReadFileTool {
    async fn run(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
        let path = args["path"].as_str().unwrap_or("");
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ClawLiteError::ToolFailed {
                tool: "read_file".into(),
                reason: format!("{path}: {e}"),
            })
    }
}

pub struct WriteFileTool;

#[async_trait]
impl ToolHandler for WriteFileTool {
    async fn run(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
        let path = args["path"].as_str().unwrap_or("");
        let content = args["content"].as_str().unwrap_or("");
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ClawLiteError::ToolFailed {
                tool: "write_file".into(),
                reason: format!("{path}: {e}"),
            })?;
        Ok(format!("ok:{path}"))
    }
}

pub struct EditFileTool;

#[async_trait]
impl ToolHandler for EditFileTool {
    async fn run(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
        let path = args["path"].as_str().unwrap_or("");
        let search = args["search"].as_str().unwrap_or("");
        let replace = args["replace"].as_str().unwrap_or("");
        let old = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ClawLiteError::ToolFailed {
                tool: "edit_file".into(),
                reason: format!("{path}: {e}"),
            })?;
        if !old.contains(search) {
            return Ok("no_change".into());
        }
        tokio::fs::write(path, old.replace(search, replace))
            .await
            .map_err(|e| ClawLiteError::ToolFailed {
                tool: "edit_file".into(),
                reason: e.to_string(),
            })?;
        Ok("ok".into())
    }
}

pub struct ListDirTool;

#[async_trait]
impl ToolHandler for ListDirTool {
    async fn run(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
        let path = args["path"].as_str().unwrap_or(".");
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| ClawLiteError::ToolFailed {
                tool: "list_dir".into(),
                reason: format!("{path}: {e}"),
            })?;
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names.join("\n"))
    }
}

pub fn file_tool_defs() -> Vec<Tool> {
    vec![
        Tool {
            name: "read_file".into(),
            description: "Read text file content".into(),
            parameters: json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        },
        Tool {
            name: "write_file".into(),
            description: "Write text file content (creates parent directories)".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        },
        Tool {
            name: "edit_file".into(),
            description: "Replace text in a file".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "search": { "type": "string" },
                    "replace": { "type": "string" }
                },
                "required": ["path", "search", "replace"]
            }),
        },
        Tool {
            name: "list_dir".into(),
            description: "List entries of a directory".into(),
            parameters: json!({
                "type": "object",
                "properties": { "path": { "type": "string", "default": "." } }
            }),
        },
    ]
}

// ── Builtin: web ───────────────────────────────────────────────

pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ToolHandler for WebFetchTool {
    async fn run(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
        let url = args["url"].as_str().unwrap_or("").trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ClawLiteError::ToolInvalidArgs {
                tool: "web_fetch".into(),
                reason: "only http/https URLs are supported".into(),
            });
        }
        let timeout = Duration::from_secs_f64(args["timeout"].as_f64().unwrap_or(15.0).max(1.0));
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ClawLiteError::ToolFailed {
                tool: "web_fetch".into(),
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(ClawLiteError::ToolFailed {
                tool: "web_fetch".into(),
                reason: format!("HTTP {}", resp.status()),
            });
        }
        let text = resp.text().await.map_err(|e| ClawLiteError::ToolFailed {
            tool: "web_fetch".into(),
            reason: e.to_string(),
        })?;
        Ok(text.chars().take(12_000).collect())
    }
}

pub fn web_fetch_tool_def() -> Tool {
    Tool {
        name: "web_fetch".into(),
        description: "Fetch text content from an http(s) URL".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "timeout": { "type": "number", "default": 15 }
            },
            "required": ["url"]
        }),
    }
}

// ── Builtin: mcp ───────────────────────────────────────────────

/// Call a remote MCP-compatible HTTP endpoint (JSON-RPC `tools/call`).
pub struct McpTool {
    client: reqwest::Client,
}

impl McpTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ToolHandler for McpTool {
    async fn run(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
        let url = args["url"].as_str().unwrap_or("").trim();
        let tool = args["tool"].as_str().unwrap_or("").trim();
        if url.is_empty() || tool.is_empty() {
            return Err(ClawLiteError::ToolInvalidArgs {
                tool: "mcp".into(),
                reason: "url and tool are required".into(),
            });
        }
        let payload = json!({
            "jsonrpc": "2.0",
            "id": "clawlite-mcp",
            "method": "tools/call",
            "params": { "name": tool, "arguments": args.get("arguments").cloned().unwrap_or(json!({})) },
        });
        let resp = self
            .client
            .post(url)
            .timeout(Duration::from_secs(20))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ClawLiteError::ToolFailed {
                tool: "mcp".into(),
                reason: e.to_string(),
            })?;
        let data: serde_json::Value = resp.json().await.map_err(|e| ClawLiteError::ToolFailed {
            tool: "mcp".into(),
            reason: e.to_string(),
        })?;
        if let Some(error) = data.get("error") {
            return Ok(format!("mcp_error:{error}"));
        }
        Ok(data
            .get("result")
            .map(|r| r.to_string())
            .unwrap_or_else(|| data.to_string()))
    }
}

pub fn mcp_tool_def() -> Tool {
    Tool {
        name: "mcp".into(),
        description: "Call a tool on a remote MCP-compatible HTTP endpoint".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "tool": { "type": "string" },
                "arguments": { "type": "object" }
            },
            "required": ["url", "tool"]
        }),
    }
}

// ── Builtin: cron ──────────────────────────────────────────────

/// Add, list or remove scheduled jobs from inside a conversation.
pub struct CronTool {
    handle: CronHandle,
}

impl CronTool {
    pub fn new(handle: CronHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ToolHandler for CronTool {
    async fn run(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String> {
        let action = args["action"].as_str().unwrap_or("");
        match action {
            "add" => {
                let expression = args["expression"].as_str().unwrap_or("").trim();
                let prompt = args["prompt"].as_str().unwrap_or("").trim();
                if expression.is_empty() || prompt.is_empty() {
                    return Err(ClawLiteError::ToolInvalidArgs {
                        tool: "cron".into(),
                        reason: "expression and prompt are required for action=add".into(),
                    });
                }
                let name = args["name"].as_str().unwrap_or("");
                let id = self
                    .handle
                    .add(ctx.session_id.as_str(), expression, prompt, name)?;
                Ok(format!("job_id={id}"))
            }
            "list" => {
                let jobs = self.handle.list(Some(ctx.session_id.as_str()))?;
                if jobs.is_empty() {
                    return Ok("empty".into());
                }
                Ok(jobs
                    .iter()
                    .map(|j| format!("{} {} {}", j.id, j.expression, j.name))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "remove" => {
                let id = args["job_id"].as_i64().unwrap_or(-1);
                Ok(if self.handle.remove(id)? {
                    format!("removed={id}")
                } else {
                    format!("not_found={id}")
                })
            }
            other => Err(ClawLiteError::ToolInvalidArgs {
                tool: "cron".into(),
                reason: format!("invalid action '{other}'"),
            }),
        }
    }
}

pub fn cron_tool_def() -> Tool {
    Tool {
        name: "cron".into(),
        description: "Add, list or remove scheduled jobs for this session".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["add", "list", "remove"] },
                "expression": { "type": "string" },
                "prompt": { "type": "string" },
                "name": { "type": "string" },
                "job_id": { "type": "integer" }
            },
            "required": ["action"]
        }),
    }
}

// ── Builtin: message ───────────────────────────────────────────

/// Send a proactive message to a channel target via the outbound queue.
pub struct MessageTool {
    bus: MessageBus,
}

impl MessageTool {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ToolHandler for MessageTool {
    async fn run(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String> {
        let channel = args["channel"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ctx.session_id.channel());
        let target = args["target"].as_str().unwrap_or("").trim();
        let text = args["text"].as_str().unwrap_or("").trim();
        if target.is_empty() || text.is_empty() {
            return Err(ClawLiteError::ToolInvalidArgs {
                tool: "message".into(),
                reason: "target and text are required".into(),
            });
        }
        let session = SessionId::for_channel(channel, target, None);
        let msg = OutboundMessage::text(
            session,
            Some(ReplyHandle {
                channel: channel.to_string(),
                account: String::new(),
                chat_id: target.to_string(),
                thread_id: None,
            }),
            text,
        );
        let delivered = self.bus.publish_outbound(msg).await?;
        Ok(if delivered { "queued".into() } else { "deduplicated".into() })
    }
}

pub fn message_tool_def() -> Tool {
    Tool {
        name: "message".into(),
        description: "Send a proactive message to a channel target".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "channel": { "type": "string" },
                "target": { "type": "string" },
                "text": { "type": "string" }
            },
            "required": ["target", "text"]
        }),
    }
}

// ── Builtin: spawn_subagent ────────────────────────────────────

pub struct SpawnTool {
    subagents: Arc<SubagentManager>,
}

impl SpawnTool {
    pub fn new(subagents: Arc<SubagentManager>) -> Self {
        Self { subagents }
    }
}

#[async_trait]
impl ToolHandler for SpawnTool {
    async fn run(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String> {
        let objective = args["objective"].as_str().unwrap_or("").trim();
        if objective.is_empty() {
            return Err(ClawLiteError::ToolInvalidArgs {
                tool: "spawn_subagent".into(),
                reason: "objective is required".into(),
            });
        }
        let run = self.subagents.spawn(&ctx.session_id, objective).await;
        Ok(format!("spawned run_id={run}"))
    }
}

pub fn spawn_tool_def() -> Tool {
    Tool {
        name: "spawn_subagent".into(),
        description: "Spawn an isolated subagent run; its result is posted back to this session"
            .into(),
        parameters: json!({
            "type": "object",
            "properties": { "objective": { "type": "string" } },
            "required": ["objective"]
        }),
    }
}

// ── Builtin: run_skill ─────────────────────────────────────────

/// Bridge from discovered SKILL.md descriptors to actual execution.
pub struct SkillTool {
    skills: Arc<RwLock<SkillRegistry>>,
    runner: SkillRunner,
}

impl SkillTool {
    pub fn new(skills: Arc<RwLock<SkillRegistry>>, runner: SkillRunner) -> Self {
        Self { skills, runner }
    }
}

#[async_trait]
impl ToolHandler for SkillTool {
    async fn run(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
        let name = args["name"].as_str().unwrap_or("").trim().to_lowercase();
        if name.is_empty() {
            return Err(ClawLiteError::ToolInvalidArgs {
                tool: "run_skill".into(),
                reason: "name is required".into(),
            });
        }
        let skill = {
            let skills = self.skills.read();
            skills
                .get(&name)
                .cloned()
                .ok_or_else(|| ClawLiteError::ToolNotFound(format!("skill '{name}'")))?
        };
        let empty = serde_json::Map::new();
        let skill_args = args["arguments"].as_object().unwrap_or(&empty);
        let output = self.runner.run(&skill, skill_args).await?;
        Ok(output.render())
    }
}

pub fn skill_tool_def() -> Tool {
    Tool {
        name: "run_skill".into(),
        description: "Execute a discovered SKILL.md binding via its command or script".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "arguments": { "type": "object" }
            },
            "required": ["name"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::parse("cli:test").unwrap(),
        }
    }

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn run(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
            Ok(args["word"].as_str().unwrap_or("").to_string())
        }
    }

    fn echo_def() -> Tool {
        Tool {
            name: "echo".into(),
            description: "Echo a word".into(),
            parameters: json!({
                "type": "object",
                "properties": { "word": { "type": "string" } },
                "required": ["word"]
            }),
        }
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: name.into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn dispatch_runs_registered_tool() {
        let registry = ToolRegistry::new(Duration::from_secs(5));
        registry.register(echo_def(), Arc::new(EchoTool)).unwrap();

        let result = registry.dispatch(&call("echo", json!({"word": "hi"})), &ctx()).await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result_not_a_panic() {
        let registry = ToolRegistry::new(Duration::from_secs(5));
        let result = registry.dispatch(&call("ghost", json!({})), &ctx()).await;
        assert!(result.is_error);
        assert!(result.content.contains("tool_not_found"));
    }

    #[tokio::test]
    async fn missing_required_arg_is_reported() {
        let registry = ToolRegistry::new(Duration::from_secs(5));
        registry.register(echo_def(), Arc::new(EchoTool)).unwrap();

        let result = registry.dispatch(&call("echo", json!({})), &ctx()).await;
        assert!(result.is_error);
        assert!(result.content.contains("tool_invalid_args"));
        assert!(result.content.contains("word"));
    }

    struct SlowTool;

    #[async_trait]
    impl ToolHandler for SlowTool {
        async fn run(&self, _args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("done".into())
        }
    }

    #[tokio::test]
    async fn dispatch_enforces_the_timeout() {
        let registry = ToolRegistry::new(Duration::from_millis(100));
        registry
            .register(
                Tool {
                    name: "slow".into(),
                    description: "sleeps".into(),
                    parameters: json!({"type": "object", "properties": {}}),
                },
                Arc::new(SlowTool),
            )
            .unwrap();

        let result = registry.dispatch(&call("slow", json!({})), &ctx()).await;
        assert!(result.is_error);
        assert!(result.content.contains("tool_timeout"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ToolRegistry::new(Duration::from_secs(5));
        registry.register(echo_def(), Arc::new(EchoTool)).unwrap();
        assert!(registry.register(echo_def(), Arc::new(EchoTool)).is_err());
    }

    #[test]
    fn non_object_schema_is_rejected_at_registration() {
        let registry = ToolRegistry::new(Duration::from_secs(5));
        let bad = Tool {
            name: "bad".into(),
            description: "bad schema".into(),
            parameters: json!({"type": "string"}),
        };
        assert!(registry.register(bad, Arc::new(EchoTool)).is_err());
    }

    #[tokio::test]
    async fn exec_tool_never_uses_a_shell() {
        let registry = ToolRegistry::new(Duration::from_secs(10));
        registry.register(exec_tool_def(), Arc::new(ExecTool)).unwrap();

        // Shell metacharacters stay literal argv text
        let result = registry
            .dispatch(&call("exec", json!({"command": "echo hi; echo injected"})), &ctx())
            .await;
        assert!(!result.is_error);
        assert!(result.content.contains("hi; echo injected"));
        assert!(!result.content.contains("\ninjected"));
    }

    #[tokio::test]
    async fn tool_sheet_lists_name_description_and_schema() {
        let registry = ToolRegistry::new(Duration::from_secs(5));
        registry.register(echo_def(), Arc::new(EchoTool)).unwrap();
        let sheet = registry.tool_sheet();
        assert!(sheet.contains("- echo: Echo a word"));
        assert!(sheet.contains("\"word\""));
    }

    #[tokio::test]
    async fn registry_fulfills_the_tool_executor_contract() {
        let registry = ToolRegistry::new(Duration::from_secs(5));
        registry.register(echo_def(), Arc::new(EchoTool)).unwrap();
        let executor: &dyn ToolExecutor = &registry;

        let defs = executor.tools();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");

        let session = SessionId::parse("cli:test").unwrap();
        let result = executor
            .execute(&call("echo", json!({"word": "via trait"})), &session)
            .await;
        assert!(!result.is_error);
        assert_eq!(result.content, "via trait");
    }
}
