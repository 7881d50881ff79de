//! Skill catalog backed by the `SKILL.md` files of the configured workspaces.
//!
//! Each skill lives in `<workspace>/skills/<name>/SKILL.md` and declares its
//! requirements in YAML frontmatter:
//!
//! ```yaml
//! ---
//! name: apple-notes
//! description: Manage Apple Notes via the memo CLI
//! os: [macos]
//! requires:
//!   bins: [memo]
//!   anyBins: [rg, grep]
//! ---
//! ```
//!
//! `os` is accepted both at the top level and under `requires`.  `macos` is
//! normalized to `darwin`, the platform string nodes report.

use std::path::{Path, PathBuf};

use nb_bridge::{SkillCatalog, SkillRequirements};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    os: Vec<String>,
    #[serde(default)]
    requires: Requires,
}

#[derive(Debug, Default, Deserialize)]
struct Requires {
    #[serde(default)]
    bins: Vec<String>,
    #[serde(default, alias = "anyBins")]
    any_bins: Vec<String>,
    #[serde(default)]
    os: Vec<String>,
}

/// Reads skills from disk on every call so edits are picked up by the next
/// probe without a restart.
#[derive(Debug, Clone)]
pub struct WorkspaceSkillCatalog {
    workspaces: Vec<PathBuf>,
}

impl WorkspaceSkillCatalog {
    pub fn new(workspaces: Vec<PathBuf>) -> Self {
        Self { workspaces }
    }
}

impl SkillCatalog for WorkspaceSkillCatalog {
    fn load_skills(&self) -> Vec<SkillRequirements> {
        let mut out = Vec::new();
        for workspace in &self.workspaces {
            out.extend(scan_workspace(workspace));
        }
        out
    }
}

fn scan_workspace(workspace: &Path) -> Vec<SkillRequirements> {
    let root = workspace.join("skills");
    let read_dir = match std::fs::read_dir(&root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %root.display(), error = %e, "cannot read skills directory");
            return Vec::new();
        }
    };

    let mut dirs: Vec<PathBuf> = read_dir
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    let mut skills = Vec::new();
    for dir in dirs {
        let doc = dir.join("SKILL.md");
        let content = match std::fs::read_to_string(&doc) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let fallback = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(skill) = parse_skill(&content, &fallback) {
            skills.push(skill);
        }
    }
    skills
}

/// Requirements declared by one `SKILL.md`.  `None` when the file has no
/// frontmatter or it does not parse.
pub fn parse_skill(content: &str, fallback_name: &str) -> Option<SkillRequirements> {
    let yaml = frontmatter_block(content)?;
    let fm: Frontmatter = match serde_yaml::from_str(yaml) {
        Ok(fm) => fm,
        Err(e) => {
            tracing::warn!(skill = %fallback_name, error = %e, "failed to parse SKILL.md frontmatter");
            return None;
        }
    };

    let mut os: Vec<String> = fm
        .os
        .iter()
        .chain(fm.requires.os.iter())
        .map(|o| normalize_platform(o))
        .collect();
    os.sort();
    os.dedup();

    Some(SkillRequirements {
        name: fm
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| fallback_name.to_string()),
        bins: fm.requires.bins,
        any_bins: fm.requires.any_bins,
        os,
    })
}

fn frontmatter_block(content: &str) -> Option<&str> {
    let trimmed = content.trim_start();
    let after_open = trimmed.strip_prefix("---")?;
    let close = after_open.find("\n---")?;
    Some(&after_open[..close])
}

fn normalize_platform(os: &str) -> String {
    match os.trim().to_ascii_lowercase().as_str() {
        "macos" | "mac" | "osx" => "darwin".to_string(),
        other => other.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
