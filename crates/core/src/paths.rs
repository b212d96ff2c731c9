use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".taskflow"))
            .unwrap_or_else(|| PathBuf::from(".taskflow"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn capabilities_dir(&self) -> PathBuf {
        self.base.join("capabilities")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.base.join("profiles")
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.base.join("conversations")
    }

    pub fn conversation_file(&self, conversation_id: &str) -> PathBuf {
        self.conversations_dir()
            .join(format!("{}.jsonl", safe_file_stem(conversation_id)))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.capabilities_dir())?;
        std::fs::create_dir_all(self.profiles_dir())?;
        std::fs::create_dir_all(self.conversations_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

fn safe_file_stem(key: &str) -> String {
    key.replace([':', '/', '\\', '.'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_file_is_sanitized() {
        let paths = Paths::with_base(PathBuf::from("/tmp/tf"));
        let file = paths.conversation_file("cli:../evil");
        assert_eq!(file, PathBuf::from("/tmp/tf/conversations/cli____evil.jsonl"));
    }
}
