pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod paths;
pub mod state;

pub use config::{Config, EngineConfig, ModelConfig};
pub use error::{Error, Result};
pub use event::{topic, Event};
pub use flow::{FlowGraph, NodeSpec};
pub use paths::Paths;
pub use state::{DevContext, SessionState, ValueMap};
