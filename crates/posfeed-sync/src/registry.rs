use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use posfeed_combine::Cohort;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BranchRegistry {
    #[serde(default)]
    pub branches: Vec<BranchConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BranchConfig {
    pub branch_id: String,
    #[serde(default)]
    pub cohort: Cohort,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl BranchRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// A missing registry is an empty one.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn enabled_branches(&self) -> Vec<String> {
        self.branches
            .iter()
            .filter(|b| b.enabled)
            .map(|b| b.branch_id.clone())
            .collect()
    }

    /// Branches exporting the newer item-catalog layout.
    pub fn new_branches(&self) -> HashSet<String> {
        self.branches
            .iter()
            .filter(|b| b.cohort == Cohort::New)
            .map(|b| b.branch_id.clone())
            .collect()
    }
}
