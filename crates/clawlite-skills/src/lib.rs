//! # clawlite-skills
//!
//! Discovers `SKILL.md` descriptors from the builtin, workspace and
//! marketplace roots, filters them by environment requirements, and runs
//! executable skills without ever touching a shell interpreter.

pub mod definition;
pub mod exec;
pub mod registry;

pub use definition::{ParseMode, Requires, SkillDescriptor, SkillSource};
pub use exec::{split_command, substitute_argv, CapturedOutput, SkillRunner};
pub use registry::SkillRegistry;
