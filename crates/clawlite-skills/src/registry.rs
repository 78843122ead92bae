use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use clawlite_core::Result;

use crate::definition::{ParseMode, SkillDescriptor, SkillSource};

/// Discovers and manages SKILL.md descriptors.
///
/// Roots are scanned in order — builtin, workspace, marketplace — and a
/// later root overrides an earlier one carrying the same skill name, so an
/// operator's workspace copy beats the shipped version and a marketplace
/// download beats both.
pub struct SkillRegistry {
    skills: HashMap<String, SkillDescriptor>,
    roots: Vec<(PathBuf, SkillSource)>,
    mode: ParseMode,
}

impl SkillRegistry {
    pub fn new(
        builtin_root: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        marketplace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            skills: HashMap::new(),
            roots: vec![
                (builtin_root.into(), SkillSource::Builtin),
                (workspace_root.into(), SkillSource::Workspace),
                (marketplace_root.into(), SkillSource::Marketplace),
            ],
            mode: ParseMode::Lenient,
        }
    }

    /// Create an empty registry (for tests).
    pub fn new_empty() -> Self {
        Self {
            skills: HashMap::new(),
            roots: vec![],
            mode: ParseMode::Lenient,
        }
    }

    pub fn with_mode(mut self, mode: ParseMode) -> Self {
        self.mode = mode;
        self
    }

    /// Recursively collect SKILL.md paths under a root.
    fn collect_skill_files(dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut entries: Vec<_> = entries.flatten().map(|e| e.path()).collect();
        entries.sort();
        for path in entries {
            if path.is_dir() {
                Self::collect_skill_files(&path, out);
            } else if path.file_name().is_some_and(|n| n == "SKILL.md") {
                out.push(path);
            }
        }
    }

    /// Discover and (re)load all descriptors. Returns the loaded names.
    pub fn discover(&mut self) -> Result<Vec<String>> {
        self.skills.clear();
        let mut loaded = Vec::new();

        for (root, source) in self.roots.clone() {
            if !root.exists() {
                debug!(?root, "skills root does not exist, skipping");
                continue;
            }
            let mut files = Vec::new();
            Self::collect_skill_files(&root, &mut files);

            for path in files {
                match SkillDescriptor::from_file(&path, source, self.mode) {
                    Ok(mut def) => {
                        Self::check_requirements(&mut def);
                        if self.skills.contains_key(&def.name) {
                            debug!(
                                skill = %def.name,
                                root = source.as_str(),
                                "overriding skill from earlier root"
                            );
                        } else {
                            loaded.push(def.name.clone());
                        }
                        info!(skill = %def.name, path = ?path, available = def.available, "loaded skill");
                        self.skills.insert(def.name.clone(), def);
                    }
                    Err(e) => {
                        warn!(path = ?path, error = %e, "failed to load skill");
                    }
                }
            }
        }

        Ok(loaded)
    }

    /// Evaluate `requires` against the current environment.
    fn check_requirements(def: &mut SkillDescriptor) {
        let mut missing = Vec::new();
        for bin in &def.requires.bins {
            if find_on_path(bin).is_none() {
                missing.push(format!("bin:{bin}"));
            }
        }
        for var in &def.requires.env {
            if std::env::var(var).map(|v| v.is_empty()).unwrap_or(true) {
                missing.push(format!("env:{var}"));
            }
        }
        if !def.requires.os.is_empty() {
            let current = std::env::consts::OS;
            if !def.requires.os.iter().any(|os| os.eq_ignore_ascii_case(current)) {
                missing.push(format!("os:{current}"));
            }
        }
        def.available = missing.is_empty();
        def.missing = missing;
    }

    /// Register a descriptor programmatically (tests, builtins).
    pub fn register(&mut self, mut def: SkillDescriptor) {
        Self::check_requirements(&mut def);
        self.skills.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&SkillDescriptor> {
        self.skills.get(name)
    }

    /// All skills, available or not, sorted by name.
    pub fn list_all(&self) -> Vec<&SkillDescriptor> {
        let mut skills: Vec<_> = self.skills.values().collect();
        skills.sort_by_key(|s| &s.name);
        skills
    }

    /// Only skills whose requirements are met.
    pub fn list_available(&self) -> Vec<&SkillDescriptor> {
        self.list_all().into_iter().filter(|s| s.available).collect()
    }

    pub fn count(&self) -> usize {
        self.skills.len()
    }

    /// The skill-sheet block for the system prompt: every skill as a
    /// one-liner; unavailable ones annotated with what is missing. Bodies
    /// of `always` skills are inlined separately via [`Self::always_bodies`].
    pub fn catalog_block(&self) -> Option<String> {
        if self.skills.is_empty() {
            return None;
        }
        let mut lines = vec!["Skills:".to_string()];
        for skill in self.list_all() {
            if skill.available {
                lines.push(format!("- {}: {}", skill.name, skill.description));
            } else {
                lines.push(format!(
                    "- {}: {} (unavailable: {})",
                    skill.name,
                    skill.description,
                    skill.missing.join(", ")
                ));
            }
        }
        Some(lines.join("\n"))
    }

    /// Bodies of available `always: true` skills, inlined into every prompt.
    pub fn always_bodies(&self) -> Vec<(String, String)> {
        self.list_all()
            .into_iter()
            .filter(|s| s.always && s.available)
            .map(|s| (s.name.clone(), s.body.clone()))
            .collect()
    }
}

/// Resolve a binary on PATH, honoring PATHEXT-free unix semantics.
pub fn find_on_path(bin: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(bin);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Requires;

    fn write_skill(root: &Path, dir_name: &str, content: &str) {
        let dir = root.join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SKILL.md"), content).unwrap();
    }

    fn three_roots() -> (tempfile::TempDir, tempfile::TempDir, tempfile::TempDir) {
        (
            tempfile::tempdir().unwrap(),
            tempfile::tempdir().unwrap(),
            tempfile::tempdir().unwrap(),
        )
    }

    #[test]
    fn discovers_across_roots() {
        let (builtin, workspace, market) = three_roots();
        write_skill(
            builtin.path(),
            "alpha",
            "---\nname: alpha\ndescription: First\n---\n\nA.",
        );
        write_skill(
            workspace.path(),
            "beta",
            "---\nname: beta\ndescription: Second\n---\n\nB.",
        );

        let mut reg = SkillRegistry::new(builtin.path(), workspace.path(), market.path());
        let loaded = reg.discover().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(reg.get("alpha").is_some());
        assert!(reg.get("beta").is_some());
    }

    #[test]
    fn later_root_overrides_earlier_by_name() {
        let (builtin, workspace, market) = three_roots();
        write_skill(
            builtin.path(),
            "dup",
            "---\nname: dup\ndescription: builtin version\n---\n\nBuiltin.",
        );
        write_skill(
            workspace.path(),
            "dup",
            "---\nname: dup\ndescription: workspace version\n---\n\nWorkspace.",
        );
        write_skill(
            market.path(),
            "dup",
            "---\nname: dup\ndescription: marketplace version\n---\n\nMarket.",
        );

        let mut reg = SkillRegistry::new(builtin.path(), workspace.path(), market.path());
        reg.discover().unwrap();
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.get("dup").unwrap().description, "marketplace version");
    }

    #[test]
    fn nested_skill_directories_are_found() {
        let (builtin, workspace, market) = three_roots();
        write_skill(
            builtin.path(),
            "group/inner",
            "---\nname: inner\ndescription: Nested\n---\n\nN.",
        );
        let mut reg = SkillRegistry::new(builtin.path(), workspace.path(), market.path());
        reg.discover().unwrap();
        assert!(reg.get("inner").is_some());
    }

    #[test]
    fn unmet_bin_requirement_marks_unavailable_but_listed() {
        let mut reg = SkillRegistry::new_empty();
        reg.register(SkillDescriptor {
            name: "ghost".into(),
            description: "Needs a binary that cannot exist".into(),
            always: false,
            requires: Requires {
                bins: vec!["definitely-not-a-real-binary-9f2d".into()],
                ..Default::default()
            },
            command: Some("definitely-not-a-real-binary-9f2d".into()),
            script: None,
            source_root: SkillSource::Workspace,
            body: "B.".into(),
            file_path: PathBuf::new(),
            base_dir: PathBuf::new(),
            available: true,
            missing: vec![],
        });

        let skill = reg.get("ghost").unwrap();
        assert!(!skill.available);
        assert_eq!(skill.missing, vec!["bin:definitely-not-a-real-binary-9f2d"]);

        // Still present in the full listing, with the missing piece reported
        let block = reg.catalog_block().unwrap();
        assert!(block.contains("unavailable: bin:definitely-not-a-real-binary-9f2d"));
        assert!(reg.list_available().is_empty());
    }

    #[test]
    fn unmet_env_requirement() {
        let mut reg = SkillRegistry::new_empty();
        reg.register(SkillDescriptor {
            name: "needs-env".into(),
            description: "d".into(),
            always: false,
            requires: Requires {
                env: vec!["CLAWLITE_TEST_UNSET_VAR_X".into()],
                ..Default::default()
            },
            command: None,
            script: None,
            source_root: SkillSource::Workspace,
            body: String::new(),
            file_path: PathBuf::new(),
            base_dir: PathBuf::new(),
            available: true,
            missing: vec![],
        });
        assert!(!reg.get("needs-env").unwrap().available);
    }

    #[test]
    fn os_requirement_matches_current() {
        let mut reg = SkillRegistry::new_empty();
        reg.register(SkillDescriptor {
            name: "here".into(),
            description: "d".into(),
            always: false,
            requires: Requires {
                os: vec![std::env::consts::OS.to_string()],
                ..Default::default()
            },
            command: None,
            script: None,
            source_root: SkillSource::Builtin,
            body: String::new(),
            file_path: PathBuf::new(),
            base_dir: PathBuf::new(),
            available: true,
            missing: vec![],
        });
        assert!(reg.get("here").unwrap().available);
    }

    #[test]
    fn always_bodies_only_include_available_always_skills() {
        let (builtin, workspace, market) = three_roots();
        write_skill(
            builtin.path(),
            "style",
            "---\nname: style\ndescription: House style\nalways: true\n---\n\nBe terse.",
        );
        write_skill(
            builtin.path(),
            "plain",
            "---\nname: plain\ndescription: Not always\n---\n\nBody.",
        );
        let mut reg = SkillRegistry::new(builtin.path(), workspace.path(), market.path());
        reg.discover().unwrap();

        let bodies = reg.always_bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].0, "style");
        assert!(bodies[0].1.contains("Be terse."));
    }

    #[test]
    fn nonexistent_roots_are_fine() {
        let mut reg = SkillRegistry::new("/nonexistent/a", "/nonexistent/b", "/nonexistent/c");
        assert!(reg.discover().unwrap().is_empty());
        assert!(reg.catalog_block().is_none());
    }
}
