pub mod controller;
pub mod executor;
pub mod hub;
pub mod plan;
pub mod runtime;

pub use controller::{SessionController, TASK_STARTED};
pub use executor::FlowExecutor;
pub use hub::{EventHub, EventQueue};
pub use plan::{normalize, NormalizedPlan};
pub use runtime::Engine;
