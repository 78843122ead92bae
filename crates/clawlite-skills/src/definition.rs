use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use clawlite_core::{ClawLiteError, Result};

/// Which discovery root a descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillSource {
    Builtin,
    Workspace,
    Marketplace,
}

impl SkillSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillSource::Builtin => "builtin",
            SkillSource::Workspace => "workspace",
            SkillSource::Marketplace => "marketplace",
        }
    }
}

/// Environment requirements gating a skill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requires {
    /// Binaries that must resolve on PATH.
    #[serde(default)]
    pub bins: Vec<String>,
    /// Environment variables that must be set and non-empty.
    #[serde(default)]
    pub env: Vec<String>,
    /// Accepted OS names (`linux`, `macos`, `windows`). Empty = any.
    #[serde(default)]
    pub os: Vec<String>,
}

impl Requires {
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty() && self.env.is_empty() && self.os.is_empty()
    }
}

/// Frontmatter parse strictness. Strict rejects unknown keys; lenient logs
/// and carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Strict,
    Lenient,
}

/// A skill parsed from a `SKILL.md` file: YAML-like frontmatter followed by
/// a freeform Markdown body.
///
/// A descriptor with `always: true` and no `command`/`script` is a pure
/// context injection — its body is inlined into every prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub always: bool,
    #[serde(default)]
    pub requires: Requires,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    pub source_root: SkillSource,
    /// Markdown body (instructions for the model).
    #[serde(skip)]
    pub body: String,
    #[serde(skip)]
    pub file_path: PathBuf,
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// Whether every requirement is currently met.
    #[serde(skip)]
    pub available: bool,
    /// Unmet requirements, reported in listings.
    #[serde(skip)]
    pub missing: Vec<String>,
}

impl SkillDescriptor {
    pub fn from_file(path: &Path, source: SkillSource, mode: ParseMode) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClawLiteError::Skill(format!("failed to read {}: {e}", path.display())))?;
        let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        Self::parse(&content, path.to_path_buf(), base_dir, source, mode)
    }

    /// Parse SKILL.md content with known path info.
    pub fn parse(
        content: &str,
        file_path: PathBuf,
        base_dir: PathBuf,
        source: SkillSource,
        mode: ParseMode,
    ) -> Result<Self> {
        let (frontmatter, body) = split_frontmatter(content)?;
        let mut def = parse_frontmatter(&frontmatter, mode)?;

        def.body = body;
        def.source_root = source;
        def.file_path = file_path;
        def.base_dir = base_dir;

        // Fall back to the directory name when frontmatter has no name
        if def.name.is_empty() {
            def.name = def
                .base_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();
        }
        if def.name.is_empty() {
            return Err(ClawLiteError::Skill("skill name is empty".into()));
        }
        if def.description.is_empty() {
            def.description = format!("Skill '{}'", def.name);
        }

        // Resolve {baseDir} in the body
        let base_dir_str = def.base_dir.to_string_lossy().to_string();
        def.body = def.body.replace("{baseDir}", &base_dir_str);

        Ok(def)
    }

    /// Serialize back to a SKILL.md document (canonical frontmatter).
    /// `parse(to_markdown(d)) == d` up to path metadata.
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("---\n");
        out.push_str(&format!("name: {}\n", self.name));
        out.push_str(&format!("description: {}\n", self.description));
        if self.always {
            out.push_str("always: true\n");
        }
        if !self.requires.is_empty() {
            out.push_str("requires:\n");
            if !self.requires.bins.is_empty() {
                out.push_str(&format!("  bins: [{}]\n", self.requires.bins.join(", ")));
            }
            if !self.requires.env.is_empty() {
                out.push_str(&format!("  env: [{}]\n", self.requires.env.join(", ")));
            }
            if !self.requires.os.is_empty() {
                out.push_str(&format!("  os: [{}]\n", self.requires.os.join(", ")));
            }
        }
        if let Some(ref command) = self.command {
            out.push_str(&format!("command: {command}\n"));
        }
        if let Some(ref script) = self.script {
            out.push_str(&format!("script: {script}\n"));
        }
        out.push_str("---\n\n");
        out.push_str(&self.body);
        out
    }

    /// True when this descriptor can be invoked through `run_skill`.
    pub fn is_executable(&self) -> bool {
        self.command.is_some() || self.script.is_some()
    }
}

/// Split a SKILL.md file into frontmatter and Markdown body.
fn split_frontmatter(content: &str) -> Result<(String, String)> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return Err(ClawLiteError::Skill(
            "SKILL.md must start with YAML frontmatter (---)".into(),
        ));
    }
    let after_first = &trimmed[3..];
    let end_pos = after_first.find("\n---").ok_or_else(|| {
        ClawLiteError::Skill("SKILL.md: missing closing --- for frontmatter".into())
    })?;
    let frontmatter = after_first[..end_pos].trim().to_string();
    let body = after_first[end_pos + 4..].trim().to_string();
    Ok((frontmatter, body))
}

/// Remove surrounding quotes from a YAML value.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "on" | "1")
}

/// Parse an inline `[a, b]` or bare `a, b` list.
fn parse_inline_list(value: &str) -> Vec<String> {
    let inner = value.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .map(|t| unquote(t.trim()))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Parse the restricted frontmatter grammar: flat `key: value` pairs plus a
/// nested `requires:` block whose subkeys (`bins`, `env`, `os`) take either
/// inline lists or indented `- item` entries.
fn parse_frontmatter(yaml: &str, mode: ParseMode) -> Result<SkillDescriptor> {
    let mut def = SkillDescriptor {
        name: String::new(),
        description: String::new(),
        always: false,
        requires: Requires::default(),
        command: None,
        script: None,
        source_root: SkillSource::Builtin,
        body: String::new(),
        file_path: PathBuf::new(),
        base_dir: PathBuf::new(),
        available: true,
        missing: vec![],
    };

    let mut in_requires = false;
    let mut requires_list: Option<&'static str> = None;

    for raw_line in yaml.lines() {
        let line = raw_line.trim_end();
        let stripped = line.trim_start();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        let indent = line.len() - stripped.len();

        // `- item` entries under requires.<list>
        if stripped.starts_with("- ") {
            if in_requires {
                let value = unquote(&stripped[2..]);
                if value.is_empty() {
                    continue;
                }
                match requires_list {
                    Some("bins") => def.requires.bins.push(value),
                    Some("env") => def.requires.env.push(value),
                    Some("os") => def.requires.os.push(value),
                    _ => {}
                }
            }
            continue;
        }

        let Some((key, value)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if indent == 0 {
            in_requires = false;
            requires_list = None;
            match key {
                "name" => def.name = unquote(value).to_lowercase(),
                "description" => def.description = unquote(value),
                "always" => def.always = parse_bool(value),
                "command" => {
                    let v = unquote(value);
                    def.command = (!v.is_empty()).then_some(v);
                }
                "script" => {
                    let v = unquote(value);
                    def.script = (!v.is_empty()).then_some(v);
                }
                "requires" => {
                    in_requires = true;
                    // `requires: {}` inline form carries nothing
                }
                other => match mode {
                    ParseMode::Strict => {
                        return Err(ClawLiteError::Skill(format!(
                            "unknown frontmatter key: {other}"
                        )))
                    }
                    ParseMode::Lenient => {
                        tracing::warn!(key = other, "ignoring unknown frontmatter key")
                    }
                },
            }
        } else if in_requires {
            match key {
                "bins" => {
                    if value.is_empty() {
                        requires_list = Some("bins");
                    } else {
                        def.requires.bins = parse_inline_list(value);
                        requires_list = None;
                    }
                }
                "env" => {
                    if value.is_empty() {
                        requires_list = Some("env");
                    } else {
                        def.requires.env = parse_inline_list(value);
                        requires_list = None;
                    }
                }
                "os" => {
                    if value.is_empty() {
                        requires_list = Some("os");
                    } else {
                        def.requires.os = parse_inline_list(value);
                        requires_list = None;
                    }
                }
                other => match mode {
                    ParseMode::Strict => {
                        return Err(ClawLiteError::Skill(format!(
                            "unknown requires key: {other}"
                        )))
                    }
                    ParseMode::Lenient => {
                        tracing::warn!(key = other, "ignoring unknown requires key")
                    }
                },
            }
        }
    }

    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str, mode: ParseMode) -> Result<SkillDescriptor> {
        SkillDescriptor::parse(
            content,
            PathBuf::from("/skills/test/SKILL.md"),
            PathBuf::from("/skills/test"),
            SkillSource::Workspace,
            mode,
        )
    }

    #[test]
    fn parse_full_descriptor() {
        let content = r#"---
name: github
description: Manage GitHub repos and PRs
always: false
requires:
  bins: [gh, git]
  env:
    - GITHUB_TOKEN
  os: [linux, macos]
command: gh {subcommand}
---

# GitHub

Use `gh` for everything.
"#;
        let def = parse(content, ParseMode::Strict).unwrap();
        assert_eq!(def.name, "github");
        assert_eq!(def.description, "Manage GitHub repos and PRs");
        assert!(!def.always);
        assert_eq!(def.requires.bins, vec!["gh", "git"]);
        assert_eq!(def.requires.env, vec!["GITHUB_TOKEN"]);
        assert_eq!(def.requires.os, vec!["linux", "macos"]);
        assert_eq!(def.command.as_deref(), Some("gh {subcommand}"));
        assert!(def.script.is_none());
        assert!(def.body.contains("# GitHub"));
    }

    #[test]
    fn parse_pure_context_skill() {
        let content = "---\nname: tone\ndescription: House style\nalways: true\n---\n\nBe terse.";
        let def = parse(content, ParseMode::Strict).unwrap();
        assert!(def.always);
        assert!(!def.is_executable());
    }

    #[test]
    fn name_falls_back_to_directory() {
        let content = "---\ndescription: No name given\n---\n\nBody.";
        let def = parse(content, ParseMode::Strict).unwrap();
        assert_eq!(def.name, "test");
    }

    #[test]
    fn strict_rejects_unknown_keys() {
        let content = "---\nname: x\ndescription: d\ncolor: purple\n---\n\nBody.";
        assert!(parse(content, ParseMode::Strict).is_err());
    }

    #[test]
    fn lenient_carries_unknown_keys() {
        let content = "---\nname: x\ndescription: d\ncolor: purple\n---\n\nBody.";
        let def = parse(content, ParseMode::Lenient).unwrap();
        assert_eq!(def.name, "x");
    }

    #[test]
    fn missing_frontmatter_errors() {
        assert!(parse("# Just markdown", ParseMode::Lenient).is_err());
        assert!(parse("---\nname: x\nno closing fence", ParseMode::Lenient).is_err());
    }

    #[test]
    fn base_dir_substitution() {
        let content = "---\nname: data\ndescription: d\n---\n\nRead {baseDir}/data.json";
        let def = parse(content, ParseMode::Strict).unwrap();
        assert!(def.body.contains("/skills/test/data.json"));
        assert!(!def.body.contains("{baseDir}"));
    }

    #[test]
    fn roundtrip_parse_serialize_parse() {
        let content = r#"---
name: deploy
description: Deploy the app
always: true
requires:
  bins: [docker, kubectl]
  env: [KUBECONFIG]
script: deploy.sh
---

Run the deploy script.
"#;
        let first = parse(content, ParseMode::Strict).unwrap();
        let rendered = first.to_markdown();
        let second = parse(&rendered, ParseMode::Strict).unwrap();

        assert_eq!(second.name, first.name);
        assert_eq!(second.description, first.description);
        assert_eq!(second.always, first.always);
        assert_eq!(second.requires, first.requires);
        assert_eq!(second.command, first.command);
        assert_eq!(second.script, first.script);
        assert_eq!(second.body, first.body);
    }

    #[test]
    fn quoted_values() {
        let content = "---\nname: \"quoted\"\ndescription: 'Single quoted'\n---\n\nBody.";
        let def = parse(content, ParseMode::Strict).unwrap();
        assert_eq!(def.name, "quoted");
        assert_eq!(def.description, "Single quoted");
    }
}
