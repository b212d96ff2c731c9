use std::path::{Path, PathBuf};
use std::time::SystemTime;
use taskflow_core::Result;
use tracing::debug;

use crate::capability::CapabilityMeta;

pub const DESCRIPTOR_FILES: &[&str] = &["capability.json", "capability.yaml", "capability.yml"];
pub const BODY_FILES: &[&str] = &["run.rhai", "run", "run.sh", "run.py"];
pub const PROMPT_FILE: &str = "prompt.txt";

/// A capability directory on disk: descriptor, optional body, optional prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub dir: PathBuf,
    pub descriptor: PathBuf,
    pub body: Option<PathBuf>,
    pub prompt: Option<PathBuf>,
}

/// Change detector for a bundle: newest mtime and total size of its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleStamp {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

impl Bundle {
    /// Inspects `dir`; `None` if it holds no descriptor.
    pub fn at(dir: &Path) -> Option<Self> {
        let descriptor = DESCRIPTOR_FILES
            .iter()
            .map(|f| dir.join(f))
            .find(|p| p.is_file())?;
        let body = BODY_FILES.iter().map(|f| dir.join(f)).find(|p| p.is_file());
        let prompt = Some(dir.join(PROMPT_FILE)).filter(|p| p.is_file());
        Some(Self {
            dir: dir.to_path_buf(),
            descriptor,
            body,
            prompt,
        })
    }

    pub fn read_meta(&self) -> Result<CapabilityMeta> {
        let content = std::fs::read_to_string(&self.descriptor)?;
        let is_yaml = self
            .descriptor
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        let meta = if is_yaml {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(meta)
    }

    pub fn read_prompt(&self) -> Result<Option<String>> {
        match &self.prompt {
            Some(path) => Ok(Some(std::fs::read_to_string(path)?)),
            None => Ok(None),
        }
    }

    pub fn body_file_name(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|b| b.file_name())
            .and_then(|n| n.to_str())
    }

    pub fn stamp(&self) -> BundleStamp {
        let mut stamp = BundleStamp {
            modified: None,
            len: 0,
        };
        let files = std::iter::once(&self.descriptor)
            .chain(self.body.iter())
            .chain(self.prompt.iter());
        for file in files {
            if let Ok(meta) = std::fs::metadata(file) {
                stamp.len += meta.len();
                if let Ok(modified) = meta.modified() {
                    stamp.modified = stamp.modified.max(Some(modified));
                }
            }
        }
        stamp
    }
}

/// Every bundle below `root`, at any depth, in path order.
pub fn discover(root: &Path) -> Vec<Bundle> {
    let mut bundles = Vec::new();
    walk(root, &mut bundles);
    bundles.sort_by(|a, b| a.dir.cmp(&b.dir));
    bundles
}

fn walk(dir: &Path, out: &mut Vec<Bundle>) {
    if !dir.is_dir() {
        return;
    }
    if let Some(bundle) = Bundle::at(dir) {
        out.push(bundle);
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Cannot read capability directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out);
        }
    }
}
