use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

use clawlite_core::{ClawLiteError, Result};

use crate::definition::SkillDescriptor;

/// Captured output of a skill invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CapturedOutput {
    /// Compact textual form fed back to the model as a tool result.
    pub fn render(&self) -> String {
        format!(
            "exit={}\nstdout={}\nstderr={}",
            self.exit_code, self.stdout, self.stderr
        )
    }
}

/// Split a command string into argv tokens by shell-quoting rules — double
/// and single quotes group, backslash escapes inside double quotes and bare
/// text — without ever invoking a shell interpreter.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_token = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(ClawLiteError::Skill(
                                "unclosed single quote in command".into(),
                            ))
                        }
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc @ ('"' | '\\' | '$' | '`')) => current.push(esc),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(ClawLiteError::Skill(
                                    "trailing backslash in command".into(),
                                ))
                            }
                        },
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(ClawLiteError::Skill(
                                "unclosed double quote in command".into(),
                            ))
                        }
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(esc) => current.push(esc),
                    None => {
                        return Err(ClawLiteError::Skill("trailing backslash in command".into()))
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Substitute `{name}` placeholders in argv tokens.
///
/// Each placeholder is replaced by a single argv token: a token that is
/// exactly `{name}` becomes the argument value verbatim, and embedded
/// placeholders are replaced inside their token. No spaces, quoting or
/// expansion is honored — substitution never grows the token list.
pub fn substitute_argv(tokens: &[String], args: &serde_json::Map<String, serde_json::Value>) -> Vec<String> {
    tokens
        .iter()
        .map(|token| {
            let mut out = token.clone();
            for (key, value) in args {
                let placeholder = format!("{{{key}}}");
                if out.contains(&placeholder) {
                    let rendered = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    out = out.replace(&placeholder, &rendered);
                }
            }
            out
        })
        .collect()
}

/// Runs executable skills as direct child processes.
pub struct SkillRunner {
    timeout: Duration,
}

impl Default for SkillRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl SkillRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Execute a skill's `command` or `script` with the given arguments.
    ///
    /// Availability is re-checked at call time; an unavailable skill never
    /// spawns a process. Execution is capped by the hard timeout and the
    /// child is killed on expiry.
    pub async fn run(
        &self,
        skill: &SkillDescriptor,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<CapturedOutput> {
        if !skill.available {
            return Err(ClawLiteError::ToolNotFound(format!(
                "skill '{}' unavailable: {}",
                skill.name,
                skill.missing.join(", ")
            )));
        }

        let argv = if let Some(ref command) = skill.command {
            substitute_argv(&split_command(command)?, args)
        } else if let Some(ref script) = skill.script {
            // Script paths resolve relative to the descriptor's directory.
            let script_path = skill.base_dir.join(script);
            let mut argv = vec![script_path.to_string_lossy().to_string()];
            if let Some(extra) = args.get("args").and_then(|v| v.as_array()) {
                argv.extend(extra.iter().map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                }));
            }
            argv
        } else {
            return Err(ClawLiteError::ToolNotFound(format!(
                "skill '{}' has no command or script",
                skill.name
            )));
        };

        if argv.is_empty() {
            return Err(ClawLiteError::Skill("empty skill command".into()));
        }

        self.spawn(&skill.name, &argv).await
    }

    async fn spawn(&self, name: &str, argv: &[String]) -> Result<CapturedOutput> {
        let started = Instant::now();
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClawLiteError::ToolFailed {
                tool: name.to_string(),
                reason: format!("spawn {}: {e}", argv[0]),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| ClawLiteError::ToolFailed {
                tool: name.to_string(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                // kill_on_drop reaps the child
                return Err(ClawLiteError::ToolTimeout {
                    tool: name.to_string(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
