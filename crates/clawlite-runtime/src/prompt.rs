use std::sync::Arc;

use clawlite_config::WorkspaceLoader;
use clawlite_core::ChatMessage;

/// Operator identity files, read in prompt-assembly order.
const IDENTITY_FILES: &[&str] = &["IDENTITY.md", "SOUL.md", "USER.md", "AGENTS.md"];

/// Everything that goes into one system block, already rendered.
pub struct PromptInputs<'a> {
    /// Generated tool sheet from the registry.
    pub tool_sheet: String,
    /// Skill catalog summary (one-liners, availability annotated).
    pub skill_catalog: Option<String>,
    /// Bodies of always-on skills, inlined verbatim.
    pub always_skills: Vec<(String, String)>,
    /// Top-K memory snippets for the current user text.
    pub memory_snippets: Vec<String>,
    /// Trailing session history (already limited).
    pub history: &'a [ChatMessage],
}

/// Assembles the system block in a fixed order; missing pieces are
/// silently skipped:
///
/// 1. IDENTITY, 2. SOUL, 3. USER, 4. AGENTS (workspace files),
/// 5. tool sheet, 6. skill sheet (+ inlined always-bodies),
/// 7. memory snippets, 8. trailing history.
pub struct PromptBuilder {
    workspace: Arc<WorkspaceLoader>,
}

impl PromptBuilder {
    pub fn new(workspace: Arc<WorkspaceLoader>) -> Self {
        Self { workspace }
    }

    pub fn build_system(&self, inputs: &PromptInputs<'_>) -> String {
        let mut sections: Vec<String> = Vec::new();

        for (name, text) in self.workspace.read(IDENTITY_FILES) {
            sections.push(format!("## {name}\n{text}"));
        }

        if !inputs.tool_sheet.is_empty() {
            sections.push(format!("[Tools]\n{}", inputs.tool_sheet));
        }

        if let Some(ref catalog) = inputs.skill_catalog {
            sections.push(format!("[Skills]\n{catalog}"));
        }
        for (name, body) in &inputs.always_skills {
            sections.push(format!("[Skill: {name}]\n{body}"));
        }

        if !inputs.memory_snippets.is_empty() {
            let lines: Vec<String> = inputs
                .memory_snippets
                .iter()
                .map(|s| format!("- {s}"))
                .collect();
            sections.push(format!("[Memory]\n{}", lines.join("\n")));
        }

        if !inputs.history.is_empty() {
            let lines: Vec<String> = inputs
                .history
                .iter()
                .filter(|m| !m.text.is_empty() || m.tool_result.is_some())
                .map(|m| {
                    let content = if let Some(ref result) = m.tool_result {
                        format!("{}: {}", m.tool_name.as_deref().unwrap_or("tool"), result)
                    } else {
                        m.text.clone()
                    };
                    format!("{}: {}", m.role.as_str(), content)
                })
                .collect();
            if !lines.is_empty() {
                sections.push(format!("[History]\n{}", lines.join("\n")));
            }
        }

        sections.join("\n\n").trim().to_string()
    }
}

/// Trim history to the last `limit` messages and the token budget,
/// whichever is smaller. Oldest messages drop first.
pub fn trim_history(mut history: Vec<ChatMessage>, limit: usize, token_budget: usize) -> Vec<ChatMessage> {
    if history.len() > limit {
        history.drain(..history.len() - limit);
    }
    let mut total: usize = history.iter().map(|m| m.estimate_tokens()).sum();
    while total > token_budget && history.len() > 1 {
        let dropped = history.remove(0);
        total -= dropped.estimate_tokens();
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawlite_core::Role;

    fn builder(dir: &tempfile::TempDir) -> PromptBuilder {
        let ws = Arc::new(WorkspaceLoader::new(dir.path()));
        ws.bootstrap().unwrap();
        PromptBuilder::new(ws)
    }

    #[test]
    fn sections_appear_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder(&dir);

        let history = vec![ChatMessage::user("earlier question")];
        let system = builder.build_system(&PromptInputs {
            tool_sheet: "- exec: run a command".into(),
            skill_catalog: Some("- github: manage repos".into()),
            always_skills: vec![("style".into(), "Be terse.".into())],
            memory_snippets: vec!["operator likes coffee".into()],
            history: &history,
        });

        let identity = system.find("## IDENTITY.md").unwrap();
        let soul = system.find("## SOUL.md").unwrap();
        let user = system.find("## USER.md").unwrap();
        let agents = system.find("## AGENTS.md").unwrap();
        let tools = system.find("[Tools]").unwrap();
        let skills = system.find("[Skills]").unwrap();
        let always = system.find("[Skill: style]").unwrap();
        let memory = system.find("[Memory]").unwrap();
        let history_pos = system.find("[History]").unwrap();

        assert!(identity < soul && soul < user && user < agents);
        assert!(agents < tools && tools < skills && skills < always);
        assert!(always < memory && memory < history_pos);
        assert!(system.contains("user: earlier question"));
    }

    #[test]
    fn missing_pieces_are_silently_skipped() {
        let dir = tempfile::tempdir().unwrap();
        // No bootstrap: no identity files on disk
        let builder = PromptBuilder::new(Arc::new(WorkspaceLoader::new(dir.path())));

        let system = builder.build_system(&PromptInputs {
            tool_sheet: String::new(),
            skill_catalog: None,
            always_skills: vec![],
            memory_snippets: vec![],
            history: &[],
        });
        assert!(system.is_empty());
    }

    #[test]
    fn history_renders_tool_records() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder(&dir);
        let history = vec![ChatMessage::tool("exec", serde_json::json!({}), "exit=0")];
        let system = builder.build_system(&PromptInputs {
            tool_sheet: String::new(),
            skill_catalog: None,
            always_skills: vec![],
            memory_snippets: vec![],
            history: &history,
        });
        assert!(system.contains("tool: exec: exit=0"));
    }

    #[test]
    fn trim_history_respects_count_and_budget() {
        let history: Vec<ChatMessage> = (0..30)
            .map(|i| ChatMessage::new(Role::User, format!("message number {i}")))
            .collect();

        let trimmed = trim_history(history.clone(), 20, usize::MAX);
        assert_eq!(trimmed.len(), 20);
        assert_eq!(trimmed[0].text, "message number 10");

        // A tiny token budget trims further, keeping the newest
        let trimmed = trim_history(history, 20, 10);
        assert!(trimmed.len() < 20);
        assert_eq!(trimmed.last().unwrap().text, "message number 29");
    }
}
