use std::path::{Path, PathBuf};
use tracing::info;

use clawlite_core::Result;

/// Operator-editable files materialized into the workspace on first run.
/// Existing files are never touched — they are user-owned after creation.
pub const TEMPLATE_FILES: &[(&str, &str)] = &[
    (
        "IDENTITY.md",
        "# Identity\n\nYou are {{assistant_name}}, a {{assistant_creature}} \
         assistant. Vibe: {{assistant_vibe}}.\n",
    ),
    (
        "SOUL.md",
        "# Soul\n\n{{assistant_backstory}}\n\nStay concise. Prefer doing over \
         describing. Never invent results you did not produce.\n",
    ),
    (
        "USER.md",
        "# Operator\n\nName: {{user_name}}\nTimezone: {{user_timezone}}\n\
         Context: {{user_context}}\nPreferences: {{user_preferences}}\n",
    ),
    (
        "AGENTS.md",
        "# Policy\n\n- Ask before destructive actions.\n- Keep replies short \
         on chat channels.\n- Use tools instead of guessing.\n",
    ),
    (
        "TOOLS.md",
        "# Tool notes\n\nOperator notes about local tools and credentials. \
         The runtime generates the actual tool sheet at prompt time.\n",
    ),
    (
        "HEARTBEAT.md",
        "# Heartbeat\n\n# Lines starting with '#' are ignored. Add standing \
         tasks below; leave empty to keep the heartbeat silent.\n",
    ),
];

const DEFAULT_VARS: &[(&str, &str)] = &[
    ("assistant_name", "ClawLite"),
    ("assistant_creature", "fox"),
    ("assistant_vibe", "direct, pragmatic, autonomous"),
    (
        "assistant_backstory",
        "An autonomous personal assistant focused on execution.",
    ),
    ("user_name", "Owner"),
    ("user_timezone", "UTC"),
    ("user_context", "Personal operations and software projects"),
    ("user_preferences", "Clear answers, direct actions, concise updates"),
];

/// Materializes and reads the operator workspace.
pub struct WorkspaceLoader {
    workspace: PathBuf,
}

impl WorkspaceLoader {
    pub fn new(workspace_path: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace_path.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.workspace
    }

    fn render(template: &str, variables: &[(&str, &str)]) -> String {
        let mut rendered = template.to_string();
        for (key, value) in variables {
            rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
        }
        rendered
    }

    /// Create missing template files. Returns the paths created.
    pub fn bootstrap(&self) -> Result<Vec<PathBuf>> {
        let mut created = Vec::new();
        std::fs::create_dir_all(&self.workspace)?;
        std::fs::create_dir_all(self.workspace.join("skills"))?;

        for (name, template) in TEMPLATE_FILES {
            let dst = self.workspace.join(name);
            if dst.exists() {
                continue;
            }
            std::fs::write(&dst, Self::render(template, DEFAULT_VARS))?;
            created.push(dst);
        }
        if !created.is_empty() {
            info!(count = created.len(), workspace = %self.workspace.display(), "materialized workspace templates");
        }
        Ok(created)
    }

    /// Read a set of workspace files, skipping missing or empty ones.
    pub fn read(&self, filenames: &[&str]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for filename in filenames {
            let path = self.workspace.join(filename);
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let text = text.trim().to_string();
            if !text.is_empty() {
                out.push((filename.to_string(), text));
            }
        }
        out
    }

    /// Read a single workspace file, None when missing or empty.
    pub fn read_one(&self, filename: &str) -> Option<String> {
        let text = std::fs::read_to_string(self.workspace.join(filename)).ok()?;
        let text = text.trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    /// Path of the workspace skills root.
    pub fn skills_dir(&self) -> PathBuf {
        self.workspace.join("skills")
    }
}
