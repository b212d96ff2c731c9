use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Profile '{0}' not found")]
    ProfileNotFound(String),

    #[error("Capability '{0}' not found")]
    CapabilityNotFound(String),

    #[error("Capability '{name}' failed: {message}")]
    CapabilityExecution { name: String, message: String },

    #[error("Plan parse error: {0}")]
    PlanParse(String),

    #[error("Malformed flow: {0}")]
    MalformedFlow(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn execution(name: &str, message: impl std::fmt::Display) -> Self {
        Error::CapabilityExecution {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
