use std::sync::Arc;
use std::time::Duration;
use taskflow_capabilities::builtin::register_builtins;
use taskflow_capabilities::CapabilityRegistry;
use taskflow_core::{Config, Paths, Result};
use taskflow_providers::LanguageModel;
use taskflow_storage::{ConversationStore, ProfileStore};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::controller::SessionController;
use crate::hub::EventHub;

/// A wired engine: registry with built-ins and bundles, stores, hub,
/// controller, and the bundle watcher.
pub struct Engine {
    pub controller: Arc<SessionController>,
    pub registry: Arc<CapabilityRegistry>,
    pub hub: Arc<EventHub>,
    pub profiles: Arc<ProfileStore>,
    shutdown_tx: broadcast::Sender<()>,
    watcher: Option<JoinHandle<()>>,
}

impl Engine {
    pub async fn start(config: Config, paths: Paths, model: Arc<dyn LanguageModel>) -> Result<Self> {
        paths.ensure_dirs()?;

        let profiles = Arc::new(ProfileStore::new(config.profiles_dir(&paths)));
        let written = profiles.ensure_defaults()?;
        if !written.is_empty() {
            info!(profiles = ?written, "Wrote default profiles");
        }

        let registry = Arc::new(CapabilityRegistry::new(model));
        register_builtins(&registry);
        let capabilities_dir = config.capabilities_dir(&paths);
        std::fs::create_dir_all(&capabilities_dir)?;
        let report = registry.load(&capabilities_dir);
        for (dir, error) in &report.failed {
            warn!(bundle = %dir.display(), error = %error, "Capability bundle not loaded");
        }

        let hub = Arc::new(EventHub::new());
        let conversations = Arc::new(ConversationStore::new(paths.clone()));
        let controller = Arc::new(SessionController::new(
            config.engine.clone(),
            registry.clone(),
            hub.clone(),
            conversations,
            profiles.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let interval = Duration::from_millis(config.engine.watch_interval_ms.max(50));
        let watcher = tokio::spawn(registry.clone().watch(interval, shutdown_tx.subscribe()));

        info!(
            capabilities = registry.len(),
            profile = %config.engine.default_profile,
            "Engine started"
        );

        Ok(Self {
            controller,
            registry,
            hub,
            profiles,
            shutdown_tx,
            watcher: Some(watcher),
        })
    }

    pub async fn handle(&self, conversation_id: &str, text: &str) -> String {
        self.controller.handle(conversation_id, text).await
    }

    /// Cancels running flows, stops the watcher, drops pending events.
    pub async fn shutdown(&mut self) {
        self.controller.shutdown().await;
        let _ = self.shutdown_tx.send(());
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.await {
                warn!(error = %e, "Capability watcher ended abnormally");
            }
        }
        self.hub.shutdown();
        info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use taskflow_core::topic;

    #[tokio::test]
    async fn test_start_loads_bundles_and_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let bundle = paths.capabilities_dir().join("code_file_count");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(
            bundle.join("capability.json"),
            r#"{"name": "code_file_count", "description": "Counts files"}"#,
        )
        .unwrap();
        std::fs::write(bundle.join("run.rhai"), "fn run(state, params) { #{ reply: \"3 files\" } }")
            .unwrap();

        let mut engine = Engine::start(Config::default(), paths, ScriptedModel::new(vec![]))
            .await
            .unwrap();

        assert!(engine.registry.contains("code_file_count"));
        assert!(engine.registry.contains("planner"));
        assert_eq!(
            engine.profiles.list().unwrap(),
            vec!["capability_dev", "code_dev", "general"]
        );
        assert_eq!(engine.handle("cli", "/profile").await, "Current profile: general");

        engine.shutdown().await;
        assert!(engine.hub.queue("cli").drain().is_empty());
    }

    #[tokio::test]
    async fn test_bundle_flow_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let bundle = paths.capabilities_dir().join("code_file_count");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("capability.json"), r#"{"name": "code_file_count"}"#).unwrap();
        std::fs::write(
            bundle.join("run.rhai"),
            "fn run(state, params) { #{ reply: `counted for ${state.goal}` } }",
        )
        .unwrap();

        let mut engine = Engine::start(
            Config::default(),
            paths,
            ScriptedModel::new(vec![r#"{"ok": true, "flow": "code_file_count"}"#]),
        )
        .await
        .unwrap();

        assert_eq!(engine.handle("cli", "count the files").await, "task started");
        engine.controller.wait_for_flow("cli").await;

        let events = engine.hub.queue("cli").drain();
        let reply = events.iter().find(|e| e.topic == topic::ASSISTANT).unwrap();
        assert_eq!(reply.text(), Some("counted for count the files"));
        engine.shutdown().await;
    }
}
