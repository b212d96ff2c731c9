pub mod builtin;
pub mod bundle;
pub mod capability;
pub mod convert;
pub mod engine;
pub mod glob;
pub mod intent;
pub mod provider;
pub mod registry;

pub use capability::{
    Capability, CapabilityContext, CapabilityHandler, CapabilityMeta, CapabilitySource,
};
pub use engine::ScriptLimits;
pub use intent::{Intent, IntentClassifier};
pub use provider::{CapabilityProvider, ProcessProvider, RhaiProvider};
pub use registry::{CapabilityRegistry, CapabilitySummary, LoadReport};
