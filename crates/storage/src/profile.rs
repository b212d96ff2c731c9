use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use taskflow_core::{Error, Result};
use tracing::{debug, info};

/// Named preset: which planner and replier to use and which capabilities the
/// conversation may see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default = "default_planner")]
    pub planner: String,
    #[serde(default = "default_replier")]
    pub replier: String,
    /// Glob patterns; empty means everything.
    #[serde(default, alias = "thoughts")]
    pub capabilities: Vec<String>,
}

fn default_planner() -> String {
    "planner".to_string()
}

fn default_replier() -> String {
    "reply".to_string()
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            planner: default_planner(),
            replier: default_replier(),
            capabilities: vec!["*".to_string()],
        }
    }
}

impl ProfileConfig {
    pub fn patterns(&self) -> Vec<String> {
        if self.capabilities.is_empty() {
            vec!["*".to_string()]
        } else {
            self.capabilities.clone()
        }
    }

    fn with_patterns(patterns: &[&str]) -> Self {
        Self {
            capabilities: patterns.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Built-in presets written by `ProfileStore::ensure_defaults`.
    pub fn defaults() -> Vec<(&'static str, ProfileConfig)> {
        vec![
            (
                "general",
                Self::with_patterns(&["reply", "result_to_reply", "capability_list", "wait"]),
            ),
            (
                "code_dev",
                Self::with_patterns(&["reply", "result_to_reply", "capability_list", "code_*"]),
            ),
            ("capability_dev", Self::with_patterns(&["*"])),
        ]
    }
}

pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }

    pub fn load(&self, name: &str) -> Result<ProfileConfig> {
        if !Self::is_valid_name(name) {
            return Err(Error::ProfileNotFound(name.to_string()));
        }
        let path = self.file(name);
        if !path.exists() {
            return Err(Error::ProfileNotFound(name.to_string()));
        }
        let content = std::fs::read_to_string(&path)?;
        let profile: ProfileConfig = serde_json::from_str(&content)?;
        debug!(profile = %name, planner = %profile.planner, "Loaded profile");
        Ok(profile)
    }

    pub fn save(&self, name: &str, profile: &ProfileConfig) -> Result<()> {
        if !Self::is_valid_name(name) {
            return Err(Error::Storage(format!("invalid profile name '{}'", name)));
        }
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.file(name), serde_json::to_string_pretty(profile)?)?;
        Ok(())
    }

    /// Profile names found on disk, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Writes the built-in presets that are not on disk yet. Returns the names written.
    pub fn ensure_defaults(&self) -> Result<Vec<String>> {
        let mut written = Vec::new();
        for (name, profile) in ProfileConfig::defaults() {
            if self.file(name).exists() {
                continue;
            }
            self.save(name, &profile)?;
            written.push(name.to_string());
        }
        if !written.is_empty() {
            info!(profiles = ?written, "Wrote default profiles");
        }
        Ok(written)
    }
}
