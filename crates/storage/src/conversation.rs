use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use taskflow_core::{Paths, Result};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub sender: String,
    pub text: String,
    pub ts: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "_type")]
enum ConversationLine {
    #[serde(rename = "metadata")]
    Metadata {
        conversation_id: String,
        created_at: String,
    },
    #[serde(untagged)]
    Entry(ConversationEntry),
}

/// Append-only message log of one conversation, mirrored to a JSONL file.
#[derive(Debug)]
pub struct Conversation {
    id: String,
    path: PathBuf,
    entries: Vec<ConversationEntry>,
}

impl Conversation {
    pub fn load(id: &str, path: PathBuf) -> Result<Self> {
        let mut entries = Vec::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ConversationLine>(&line) {
                    Ok(ConversationLine::Entry(entry)) => entries.push(entry),
                    Ok(ConversationLine::Metadata { .. }) => {}
                    Err(e) => {
                        debug!(error = %e, conversation = %id, "Failed to parse conversation line, skipping");
                    }
                }
            }
        }

        Ok(Self {
            id: id.to_string(),
            path,
            entries,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Appends an entry in memory and on disk.
    pub fn add(&mut self, sender: &str, text: &str) -> Result<ConversationEntry> {
        let entry = ConversationEntry {
            sender: sender.to_string(),
            text: text.to_string(),
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if !self.path.exists() {
            let mut file = File::create(&self.path)?;
            let metadata = ConversationLine::Metadata {
                conversation_id: self.id.clone(),
                created_at: entry.ts.clone(),
            };
            writeln!(file, "{}", serde_json::to_string(&metadata)?)?;
        }

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;

        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn history(&self) -> &[ConversationEntry] {
        &self.entries
    }

    /// Whole history as `sender: text` lines.
    pub fn render_history(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}: {}", e.sender, e.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub type SharedConversation = Arc<tokio::sync::Mutex<Conversation>>;

/// Opens conversations lazily and keeps them cached for the process lifetime.
pub struct ConversationStore {
    paths: Paths,
    open: Mutex<HashMap<String, SharedConversation>>,
}

impl ConversationStore {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(&self, conversation_id: &str) -> Result<SharedConversation> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conv) = open.get(conversation_id) {
            return Ok(conv.clone());
        }
        let path = self.paths.conversation_file(conversation_id);
        let conv = Arc::new(tokio::sync::Mutex::new(Conversation::load(
            conversation_id,
            path,
        )?));
        open.insert(conversation_id.to_string(), conv.clone());
        Ok(conv)
    }
}
