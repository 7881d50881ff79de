//! Skill requirement source consumed by the capability cache.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// What one skill needs from the machine it runs on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillRequirements {
    pub name: String,
    /// Every one of these must be installed.
    #[serde(default)]
    pub bins: Vec<String>,
    /// At least one of these must be installed.
    #[serde(default)]
    pub any_bins: Vec<String>,
    /// Platforms the skill supports (`darwin`, `linux`, ...).  Empty = all.
    #[serde(default)]
    pub os: Vec<String>,
}

/// A source of skill requirements, e.g. the `SKILL.md` files of the
/// configured agent workspaces.
pub trait SkillCatalog: Send + Sync {
    fn load_skills(&self) -> Vec<SkillRequirements>;
}

/// Fixed in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticSkillCatalog {
    skills: Vec<SkillRequirements>,
}

impl StaticSkillCatalog {
    pub fn new(skills: Vec<SkillRequirements>) -> Self {
        Self { skills }
    }
}

impl SkillCatalog for StaticSkillCatalog {
    fn load_skills(&self) -> Vec<SkillRequirements> {
        self.skills.clone()
    }
}

/// Union of `bins` and `any_bins` over every skill that supports
/// `target_platform`, in first-seen order.
pub fn collect_required_bins(skills: &[SkillRequirements], target_platform: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for skill in skills {
        if !skill.os.is_empty() && !skill.os.iter().any(|os| os == target_platform) {
            continue;
        }
        for bin in skill.bins.iter().chain(skill.any_bins.iter()) {
            let bin = bin.trim();
            if !bin.is_empty() && seen.insert(bin.to_string()) {
                out.push(bin.to_string());
            }
        }
    }
    out
}
