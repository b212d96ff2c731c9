use rhai::{Dynamic, Engine, EvalAltResult};
use std::time::{Duration, Instant};
use tracing::warn;

/// Sandbox limits for script capability bodies.
#[derive(Debug, Clone)]
pub struct ScriptLimits {
    pub max_operations: u64,
    /// Wall-clock budget including time spent waiting on the language model.
    pub timeout: Duration,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_levels: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            timeout: Duration::from_secs(300),
            max_string_size: 1_000_000,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_call_levels: 64,
        }
    }
}

impl ScriptLimits {
    /// Engine with size limits only; bodies are compiled with this one.
    pub fn compiler(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_string_size(self.max_string_size);
        engine.set_max_array_size(self.max_array_size);
        engine.set_max_map_size(self.max_map_size);
        engine.set_max_call_levels(self.max_call_levels);
        engine.set_max_expr_depths(64, 64);
        engine
    }

    /// Engine for one invocation. The operation and time budgets start
    /// counting now.
    pub fn runner(&self) -> Engine {
        let mut engine = self.compiler();
        let max_operations = self.max_operations;
        let timeout = self.timeout;
        let started = Instant::now();

        engine.on_progress(move |ops| {
            if ops > max_operations {
                Some(Dynamic::from(format!("operation budget of {} spent", max_operations)))
            } else if started.elapsed() > timeout {
                Some(Dynamic::from(format!("ran longer than {}s", timeout.as_secs())))
            } else {
                None
            }
        });
        engine
    }
}

/// Human-readable form of a script failure.
pub fn describe_error(err: &EvalAltResult) -> String {
    match err {
        EvalAltResult::ErrorTerminated(reason, _) => {
            warn!(reason = %reason, "Script terminated");
            format!("Script terminated: {}", reason)
        }
        other => format!("Runtime error: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_budget_stops_endless_loop() {
        let limits = ScriptLimits {
            max_operations: 1_000,
            ..Default::default()
        };
        let err = limits.runner().run("let x = 0; loop { x += 1; }").unwrap_err();
        assert!(describe_error(&err).contains("operation budget of 1000 spent"));
    }

    #[test]
    fn test_compiler_rejects_broken_body() {
        let engine = ScriptLimits::default().compiler();
        assert!(engine.compile("fn run(state, params) { #{} }").is_ok());
        assert!(engine.compile("fn run(state, params) {").is_err());
    }
}
