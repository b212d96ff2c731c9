use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use taskflow_capabilities::{CapabilityRegistry, CapabilitySummary, Intent};
use taskflow_core::state::DevContext;
use taskflow_core::{topic, EngineConfig, Error, FlowGraph, Result, SessionState, ValueMap};
use taskflow_storage::{ConversationStore, ProfileConfig, ProfileStore, SharedConversation};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::executor::FlowExecutor;
use crate::hub::EventHub;
use crate::plan::{normalize, NormalizedPlan};

/// Returned by `handle` when a flow was launched; results arrive on the hub.
pub const TASK_STARTED: &str = "task started";

pub const GENERAL: &str = "general";
pub const CODE_DEV: &str = "code_dev";
pub const CAPABILITY_DEV: &str = "capability_dev";

/// Slash commands handled before any capability runs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    ProfileQuery,
    ProfileSwitch(String),
    DevOn,
    DevOff,
}

/// Case-insensitive; profile names are matched lowercased.
fn parse_command(text: &str) -> Option<Command> {
    let normalized = text.trim().to_lowercase();
    if !normalized.starts_with('/') {
        return None;
    }
    let mut parts = normalized.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("/profile"), None, _) => Some(Command::ProfileQuery),
        (Some("/profile"), Some(name), None) => Some(Command::ProfileSwitch(name.to_string())),
        (Some("/dev"), Some("on"), None) => Some(Command::DevOn),
        (Some("/dev"), Some("off"), None) => Some(Command::DevOff),
        _ => None,
    }
}

/// What a turn ended with.
enum Outcome {
    /// Text for the user; recorded in the conversation.
    Reply(String),
    /// A flow is running; its replies are recorded by the executor.
    Started,
}

struct Session {
    profile_name: String,
    profile: ProfileConfig,
    dev_flag: bool,
    dev: DevContext,
    last_task: Option<JoinHandle<()>>,
    flow_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Per-conversation turn handling: profile commands, intent toggles,
/// planning, normalization and flow launch.
pub struct SessionController {
    config: EngineConfig,
    registry: Arc<CapabilityRegistry>,
    hub: Arc<EventHub>,
    conversations: Arc<ConversationStore>,
    profiles: Arc<ProfileStore>,
    executor: Arc<FlowExecutor>,
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Session>>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl SessionController {
    pub fn new(
        config: EngineConfig,
        registry: Arc<CapabilityRegistry>,
        hub: Arc<EventHub>,
        conversations: Arc<ConversationStore>,
        profiles: Arc<ProfileStore>,
    ) -> Self {
        let executor = Arc::new(FlowExecutor::new(registry.clone(), hub.clone(), &config));
        Self {
            config,
            registry,
            hub,
            conversations,
            profiles,
            executor,
            sessions: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Handles one user message. Never fails: errors come back as text.
    pub async fn handle(&self, conversation_id: &str, text: &str) -> String {
        let outcome = match self.handle_turn(conversation_id, text).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(conversation = %conversation_id, error = %e, "Turn failed");
                Outcome::Reply(format!("Sorry, something went wrong: {}", e))
            }
        };
        match outcome {
            Outcome::Reply(reply) => {
                self.record(conversation_id, "assistant", &reply).await;
                reply
            }
            Outcome::Started => TASK_STARTED.to_string(),
        }
    }

    /// Name of the conversation's active profile.
    pub async fn active_profile(&self, conversation_id: &str) -> String {
        let session = self.session(conversation_id);
        let session = session.lock().await;
        session.profile_name.clone()
    }

    /// Capabilities the conversation's active profile lets it see.
    pub async fn visible_capabilities(
        &self,
        conversation_id: &str,
        group: Option<&str>,
    ) -> Vec<CapabilitySummary> {
        let session = self.session(conversation_id);
        let session = session.lock().await;
        self.registry
            .set_visibility(conversation_id, &session.profile.patterns());
        self.registry.describe(Some(conversation_id), group)
    }

    /// Waits for the most recently launched flow of a conversation.
    pub async fn wait_for_flow(&self, conversation_id: &str) {
        let handle = {
            let session = self.session(conversation_id);
            let mut session = session.lock().await;
            session.last_task.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(conversation = %conversation_id, error = %e, "Flow task aborted");
            }
        }
    }

    /// Cancels running flows and waits for their tasks to wind down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Session controller stopped");
    }

    // ---------------------------------------------------------------- sessions

    fn session(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<Session>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(self.new_session())))
            .clone()
    }

    fn new_session(&self) -> Session {
        let name = self.config.default_profile.clone();
        let profile = match self.profiles.load(&name) {
            Ok(profile) => profile,
            Err(e) => {
                warn!(profile = %name, error = %e, "Default profile unavailable, showing every capability");
                ProfileConfig::default()
            }
        };
        Session {
            dev_flag: self.config.is_dev_profile(&name),
            profile_name: name,
            profile,
            dev: taskflow_core::state::new_dev_context(),
            last_task: None,
            flow_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Switches the session to `name` and re-applies its visibility.
    fn apply_profile(&self, session: &mut Session, conversation_id: &str, name: &str) -> Result<()> {
        let profile = self.profiles.load(name)?;
        self.registry.set_visibility(conversation_id, &profile.patterns());
        session.dev_flag = self.config.is_dev_profile(name);
        session.profile_name = name.to_string();
        session.profile = profile;
        info!(conversation = %conversation_id, profile = %name, "Profile applied");
        Ok(())
    }

    async fn record(&self, conversation_id: &str, sender: &str, text: &str) {
        match self.conversations.open(conversation_id) {
            Ok(conversation) => {
                if let Err(e) = conversation.lock().await.add(sender, text) {
                    error!(conversation = %conversation_id, error = %e, "Failed to persist message");
                }
            }
            Err(e) => {
                error!(conversation = %conversation_id, error = %e, "Failed to open conversation");
            }
        }
    }

    // ---------------------------------------------------------------- turn

    async fn handle_turn(&self, cid: &str, text: &str) -> Result<Outcome> {
        let session = self.session(cid);
        let mut session = session.lock().await;
        self.registry.set_visibility(cid, &session.profile.patterns());

        let conversation = self.conversations.open(cid)?;
        self.record(cid, "user", text).await;
        self.hub.publish(cid, topic::USER, json!({ "text": text }));

        if let Some(command) = parse_command(text) {
            debug!(conversation = %cid, command = ?command, "Profile command");
            return self.run_command(&mut session, cid, command).map(Outcome::Reply);
        }

        let history = conversation.lock().await.render_history();
        let intent = self.classify(cid, &session, &history, text).await;
        if let Some(reply) = self.apply_intent(&mut session, cid, intent)? {
            return Ok(Outcome::Reply(reply));
        }

        let catalogue = self.planner_catalogue(cid, session.dev_flag);
        let mut state = SessionState::new(cid)
            .with_history(history)
            .with_dev(session.dev.clone())
            .with_capabilities_md(CapabilitySummary::render_markdown(&catalogue));

        let mut params = ValueMap::new();
        params.insert("goal".to_string(), json!(text));
        params.insert("catalogue".to_string(), serde_json::to_value(&catalogue)?);
        params.insert("intent".to_string(), json!(intent.as_str()));
        let planner = session.profile.planner.clone();
        let output = self.registry.run(&planner, &mut state, params).await?;
        let raw_plan = output.get("plan").cloned().unwrap_or(Value::Null);
        self.hub
            .publish(cid, topic::DEBUG, json!({ "stage": "plan", "plan": raw_plan }));

        let plan = normalize(raw_plan, &session.profile.replier, text);
        if !plan.ok {
            return Ok(Outcome::Reply(self.not_runnable(&plan)));
        }
        let graph = match plan.graph() {
            Some(graph) => graph,
            None => return Ok(Outcome::Reply(invalid_flow(&plan))),
        };
        if let Some(absent) = graph
            .capabilities()
            .into_iter()
            .find(|name| !self.registry.contains(name))
        {
            return Ok(Outcome::Reply(Error::CapabilityNotFound(absent).to_string()));
        }

        state.insert("goal", json!(text));
        let task_id = format!("flow_{}", uuid::Uuid::new_v4());
        self.hub.publish(
            cid,
            topic::DEBUG,
            json!({ "stage": "execute", "task": task_id, "flow": graph.to_value() }),
        );
        self.launch(&mut session, task_id, graph, state, conversation);
        Ok(Outcome::Started)
    }

    fn run_command(&self, session: &mut Session, cid: &str, command: Command) -> Result<String> {
        match command {
            Command::ProfileQuery => Ok(format!("Current profile: {}", session.profile_name)),
            Command::ProfileSwitch(name) => match self.apply_profile(session, cid, &name) {
                Ok(()) => Ok(format!("switched to profile **{}**.", name)),
                Err(Error::ProfileNotFound(_)) => Ok(format!("unknown profile '{}'.", name)),
                Err(e) => Err(e),
            },
            Command::DevOn => {
                self.apply_profile(session, cid, CAPABILITY_DEV)?;
                Ok("capability-dev profile enabled.".to_string())
            }
            Command::DevOff => {
                self.apply_profile(session, cid, GENERAL)?;
                Ok("Back to general profile.".to_string())
            }
        }
    }

    async fn classify(&self, cid: &str, session: &Session, history: &str, text: &str) -> Intent {
        let mut state = SessionState::new(cid)
            .with_history(history.to_string())
            .with_dev(session.dev.clone());
        let mut params = ValueMap::new();
        params.insert("history".to_string(), json!(history));
        params.insert("text".to_string(), json!(text));

        match self
            .registry
            .run(&self.config.intent_capability, &mut state, params)
            .await
        {
            Ok(out) => out
                .get("intent")
                .and_then(|i| i.as_str())
                .map(Intent::parse)
                .unwrap_or(Intent::Generic),
            Err(e) => {
                warn!(conversation = %cid, error = %e, "Intent classification failed, planning anyway");
                Intent::Generic
            }
        }
    }

    /// Profile toggles. `None` means the message is not a toggle.
    fn apply_intent(&self, session: &mut Session, cid: &str, intent: Intent) -> Result<Option<String>> {
        let current = session.profile_name.clone();
        let (target, reply) = match intent {
            Intent::DevOn if current == CAPABILITY_DEV => {
                (None, "capability-dev profile is already enabled.")
            }
            Intent::DevOn => (Some(CAPABILITY_DEV), "capability-dev profile enabled."),
            Intent::DevOff if current != CAPABILITY_DEV => {
                (None, "capability-dev profile is already disabled.")
            }
            Intent::DevOff => (Some(CODE_DEV), "Switched to code-dev profile."),
            Intent::CodeOn if current == CODE_DEV => (None, "Code-dev profile is already enabled."),
            Intent::CodeOn => (Some(CODE_DEV), "Code-dev profile enabled."),
            Intent::CodeOff if current == GENERAL => (None, "General profile is already enabled."),
            Intent::CodeOff => (Some(GENERAL), "Back to general profile."),
            Intent::GeneralOn if current == GENERAL => {
                (None, "General profile is already enabled.")
            }
            Intent::GeneralOn => (Some(GENERAL), "General profile enabled."),
            Intent::GeneralOff if current == CODE_DEV => {
                (None, "Code-dev profile is already disabled.")
            }
            Intent::GeneralOff => (Some(CODE_DEV), "Switched to code-dev profile."),
            Intent::Greeting | Intent::Generic => return Ok(None),
        };
        if let Some(target) = target {
            self.apply_profile(session, cid, target)?;
        }
        Ok(Some(reply.to_string()))
    }

    /// Visible capabilities, minus the `dev_*` group unless the profile is a
    /// developer one.
    fn planner_catalogue(&self, cid: &str, dev_flag: bool) -> Vec<CapabilitySummary> {
        let mut catalogue = self.registry.describe(Some(cid), None);
        if !dev_flag {
            catalogue.retain(|c| !c.name.starts_with("dev_"));
        }
        catalogue
    }

    fn not_runnable(&self, plan: &NormalizedPlan) -> String {
        if let Some(question) = &plan.question {
            return question.clone();
        }
        let missing: Vec<&str> = plan
            .missing
            .iter()
            .map(String::as_str)
            .filter(|name| !self.registry.contains(name))
            .collect();
        if !missing.is_empty() {
            return format!("missing capability(s): {}.", missing.join(", "));
        }
        invalid_flow(plan)
    }

    /// Spawns the executor. Flows of one conversation run one at a time, in
    /// launch order.
    fn launch(
        &self,
        session: &mut Session,
        task_id: String,
        graph: FlowGraph,
        mut state: SessionState,
        conversation: SharedConversation,
    ) {
        let executor = self.executor.clone();
        let hub = self.hub.clone();
        let lock = session.flow_lock.clone();
        let cancel = self.cancel.child_token();
        let cid = state.conversation_id().to_string();

        let handle = self.tasks.spawn(async move {
            let _guard = lock.lock().await;
            debug!(conversation = %cid, task_id = %task_id, "Flow started");
            // An earlier flow may have added replies while this one queued.
            state.set_history(conversation.lock().await.render_history());

            match executor
                .execute(&graph, &mut state, Some(&conversation), Some(&cancel))
                .await
            {
                Ok(()) => {}
                Err(Error::Cancelled(reason)) => {
                    info!(conversation = %cid, task_id = %task_id, reason = %reason, "Flow cancelled");
                }
                Err(e) => {
                    error!(conversation = %cid, task_id = %task_id, error = %e, "Flow failed");
                    let text = format!("Task failed: {}", e);
                    if let Err(err) = conversation.lock().await.add("assistant", &text) {
                        error!(conversation = %cid, error = %err, "Failed to persist failure message");
                    }
                    hub.publish(&cid, topic::ASSISTANT, json!({ "text": text }));
                }
            }
        });
        session.last_task = Some(handle);
    }
}

fn invalid_flow(plan: &NormalizedPlan) -> String {
    let dump = serde_json::to_string_pretty(&plan.to_value()).unwrap_or_default();
    format!("Planner produced an invalid flow:\n{}", dump)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use taskflow_capabilities::builtin::register_builtins;
    use taskflow_capabilities::Capability;
    use taskflow_core::{Event, Paths};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        model: Arc<ScriptedModel>,
        controller: SessionController,
        conversations: Arc<ConversationStore>,
        profiles: Arc<ProfileStore>,
    }

    fn fixture(answers: Vec<&str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let profiles = Arc::new(ProfileStore::new(paths.profiles_dir()));
        profiles.ensure_defaults().unwrap();
        let model = ScriptedModel::new(answers);
        let registry = Arc::new(CapabilityRegistry::new(model.clone()));
        register_builtins(&registry);
        let conversations = Arc::new(ConversationStore::new(paths));
        let controller = SessionController::new(
            EngineConfig::default(),
            registry,
            Arc::new(EventHub::new()),
            conversations.clone(),
            profiles.clone(),
        );
        Fixture {
            _dir: dir,
            model,
            controller,
            conversations,
            profiles,
        }
    }

    fn events(f: &Fixture, cid: &str) -> Vec<Event> {
        f.controller.hub().queue(cid).drain()
    }

    fn count(events: &[Event], topic: &str) -> usize {
        events.iter().filter(|e| e.topic == topic).count()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("/profile"), Some(Command::ProfileQuery));
        assert_eq!(
            parse_command(" /profile code_dev "),
            Some(Command::ProfileSwitch("code_dev".to_string()))
        );
        assert_eq!(parse_command("/dev on"), Some(Command::DevOn));
        assert_eq!(parse_command("/dev off"), Some(Command::DevOff));
        assert_eq!(parse_command("/dev maybe"), None);
        assert_eq!(parse_command("profile"), None);
    }

    #[test]
    fn test_parse_command_ignores_case() {
        assert_eq!(
            parse_command("/Profile Code_Dev"),
            Some(Command::ProfileSwitch("code_dev".to_string()))
        );
        assert_eq!(parse_command("/PROFILE"), Some(Command::ProfileQuery));
        assert_eq!(parse_command("/dev ON"), Some(Command::DevOn));
        assert_eq!(parse_command("/Dev Off"), Some(Command::DevOff));
    }

    #[tokio::test]
    async fn test_mixed_case_command_skips_planner() {
        let f = fixture(vec![]);
        assert_eq!(
            f.controller.handle("c1", "/Profile CODE_DEV").await,
            "switched to profile **code_dev**."
        );
        assert_eq!(f.controller.active_profile("c1").await, CODE_DEV);
        assert!(f.model.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_greeting_runs_replier_once() {
        let f = fixture(vec!["Hello! How can I help?"]);
        let reply = f.controller.handle("c1", "hi").await;
        assert_eq!(reply, TASK_STARTED);
        f.controller.wait_for_flow("c1").await;

        let events = events(&f, "c1");
        assert_eq!(count(&events, topic::ASSISTANT), 1);
        assert_eq!(events.last().unwrap().topic, topic::TASK_DONE);
        let assistant = events.iter().position(|e| e.topic == topic::ASSISTANT).unwrap();
        assert_eq!(events[assistant].text(), Some("Hello! How can I help?"));

        let start = events.iter().find(|e| e.topic == topic::NODE_START).unwrap();
        assert_eq!(start.payload["capability"], "reply");

        // The replier saw the user text.
        assert!(f.model.prompts()[0].contains("user: hi"));
    }

    #[tokio::test]
    async fn test_clarification_question_ends_turn() {
        let f = fixture(vec![r#"{"ok": false, "question": "Which file?"}"#]);
        let reply = f.controller.handle("c1", "open the file").await;
        assert_eq!(reply, "Which file?");

        let conversation = f.conversations.open("c1").unwrap();
        let conversation = conversation.lock().await;
        let last = conversation.history().last().unwrap();
        assert_eq!(last.sender, "assistant");
        assert_eq!(last.text, "Which file?");

        let events = events(&f, "c1");
        assert!(events.iter().all(|e| !e.is_node_event()));
        assert_eq!(count(&events, topic::TASK_DONE), 0);
    }

    #[tokio::test]
    async fn test_acknowledging_question_goes_to_planner() {
        let f = fixture(vec![
            r#"{"ok": false, "question": "Should I read lib.rs?"}"#,
            r#"{"ok": false, "question": "Anything else?"}"#,
        ]);
        assert_eq!(f.controller.handle("c1", "look at the crate").await, "Should I read lib.rs?");
        assert_eq!(f.controller.handle("c1", "ok").await, "Anything else?");

        let prompts = f.model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("Should I read lib.rs?"));
    }

    #[tokio::test]
    async fn test_chained_nodes_share_state() {
        let f = fixture(vec![
            r#"{"ok": true, "flow": [{"name": "locate", "params": {"pattern": "lib"}}, {"name": "open"}]}"#,
        ]);
        f.controller
            .registry()
            .register(Capability::from_fn("locate", "finds a file", |_state, params| {
                let mut out = ValueMap::new();
                let pattern = params.get("pattern").and_then(|p| p.as_str()).unwrap_or("");
                out.insert("path".to_string(), json!(format!("src/{}.rs", pattern)));
                Ok(out)
            }));
        f.controller
            .registry()
            .register(Capability::from_fn("open", "opens a file", |state, _params| {
                let mut out = ValueMap::new();
                let path = state.get_str("path").unwrap_or("nothing");
                out.insert("reply".to_string(), json!(format!("opened {}", path)));
                Ok(out)
            }));

        assert_eq!(f.controller.handle("c1", "open the lib file").await, TASK_STARTED);
        f.controller.wait_for_flow("c1").await;

        let events = events(&f, "c1");
        let replies: Vec<&str> = events
            .iter()
            .filter(|e| e.topic == topic::ASSISTANT)
            .filter_map(|e| e.text())
            .collect();
        assert_eq!(replies, vec!["opened src/lib.rs"]);
        let done = events.iter().find(|e| e.topic == topic::TASK_DONE).unwrap();
        assert_eq!(done.payload["finalState"]["goal"], "open the lib file");
    }

    #[tokio::test]
    async fn test_missing_capabilities_are_named() {
        let f = fixture(vec![
            r#"{"ok": false, "flow": null, "missing": ["camera", "reply", "tts"]}"#,
        ]);
        let reply = f.controller.handle("c1", "take a picture and read it aloud").await;
        assert_eq!(reply, "missing capability(s): camera, tts.");
    }

    #[tokio::test]
    async fn test_unknown_capability_in_flow_is_reported() {
        let f = fixture(vec![r#"{"ok": true, "flow": "teleport"}"#]);
        let reply = f.controller.handle("c1", "beam me up").await;
        assert_eq!(reply, "Capability 'teleport' not found");
        assert!(events(&f, "c1").iter().all(|e| !e.is_node_event()));
    }

    #[tokio::test]
    async fn test_unrunnable_plan_is_dumped() {
        let f = fixture(vec![r#"{"ok": true, "flow": {"steps": 3}}"#]);
        let reply = f.controller.handle("c1", "do something").await;
        assert!(reply.starts_with("Planner produced an invalid flow:\n"));
        assert!(reply.contains("\"steps\": 3"));
    }

    #[tokio::test]
    async fn test_profile_commands() {
        let f = fixture(vec![]);
        assert_eq!(f.controller.handle("c1", "/profile").await, "Current profile: general");
        assert_eq!(
            f.controller.handle("c1", "/profile code_dev").await,
            "switched to profile **code_dev**."
        );
        assert_eq!(f.controller.active_profile("c1").await, CODE_DEV);
        assert_eq!(
            f.controller.registry().visibility("c1").unwrap(),
            vec!["reply", "result_to_reply", "capability_list", "code_*"]
        );
        assert_eq!(
            f.controller.handle("c1", "/profile nope").await,
            "unknown profile 'nope'."
        );
        assert_eq!(
            f.controller.handle("c1", "/dev on").await,
            "capability-dev profile enabled."
        );
        assert_eq!(f.controller.handle("c1", "/dev off").await, "Back to general profile.");
        assert!(f.model.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_visible_capabilities_follow_profile() {
        let f = fixture(vec![]);
        let names = |items: Vec<CapabilitySummary>| -> Vec<String> {
            items.into_iter().map(|s| s.name).collect()
        };

        let general = names(f.controller.visible_capabilities("c1", None).await);
        assert!(general.contains(&"wait".to_string()));
        assert!(!general.contains(&"planner".to_string()));

        f.controller.handle("c1", "/dev on").await;
        let dev = names(f.controller.visible_capabilities("c1", None).await);
        assert!(dev.contains(&"planner".to_string()));
    }

    #[tokio::test]
    async fn test_toggle_intents_are_idempotent() {
        let f = fixture(vec![]);
        assert_eq!(
            f.controller.handle("c1", "enable dev mode").await,
            "capability-dev profile enabled."
        );
        assert_eq!(
            f.controller.handle("c1", "enable dev mode").await,
            "capability-dev profile is already enabled."
        );
        assert_eq!(
            f.controller.handle("c1", "disable dev mode").await,
            "Switched to code-dev profile."
        );
        assert_eq!(
            f.controller.handle("c1", "disable dev mode").await,
            "capability-dev profile is already disabled."
        );
        assert_eq!(
            f.controller.handle("c1", "back to general").await,
            "General profile enabled."
        );
        assert_eq!(
            f.controller.handle("c1", "exit code mode").await,
            "General profile is already enabled."
        );
        assert_eq!(f.controller.active_profile("c1").await, GENERAL);

        // Commands and confirmations are part of the record.
        let conversation = f.conversations.open("c1").unwrap();
        assert_eq!(conversation.lock().await.history().len(), 12);
    }

    #[tokio::test]
    async fn test_dev_capabilities_hidden_outside_dev_profiles() {
        let f = fixture(vec![r#"{"ok": false, "question": "?"}"#, r#"{"ok": false, "question": "?"}"#]);
        f.profiles
            .save(
                "open",
                &ProfileConfig {
                    capabilities: vec!["*".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();
        f.controller
            .registry()
            .register(Capability::from_fn("dev_diff", "shows a diff", |_s, _p| Ok(ValueMap::new())));

        f.controller.handle("c1", "/profile open").await;
        f.controller.handle("c1", "what can you do").await;
        let sent: Value = serde_json::from_str(&f.model.prompts()[0]).unwrap();
        let names: Vec<&str> = sent["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"wait"));
        assert!(!names.contains(&"dev_diff"));

        f.controller.handle("c1", "/dev on").await;
        f.controller.handle("c1", "what can you do").await;
        let sent: Value = serde_json::from_str(&f.model.prompts()[1]).unwrap();
        assert!(sent["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c["name"] == "dev_diff"));
    }

    #[tokio::test]
    async fn test_failed_flow_reports_error() {
        let f = fixture(vec![r#"{"ok": true, "flow": "explode"}"#]);
        f.controller
            .registry()
            .register(Capability::from_fn("explode", "always fails", |_s, _p| {
                Err(Error::execution("explode", "boom"))
            }));

        assert_eq!(f.controller.handle("c1", "blow up").await, TASK_STARTED);
        f.controller.wait_for_flow("c1").await;

        let events = events(&f, "c1");
        let failure = events.iter().find(|e| e.topic == topic::ASSISTANT).unwrap();
        assert_eq!(failure.text(), Some("Task failed: Capability 'explode' failed: boom"));
        assert_eq!(count(&events, topic::TASK_DONE), 0);

        let conversation = f.conversations.open("c1").unwrap();
        let conversation = conversation.lock().await;
        assert_eq!(conversation.history().last().unwrap().text, failure.text().unwrap());
    }

    #[tokio::test]
    async fn test_flows_of_one_conversation_run_in_order() {
        let f = fixture(vec![
            r#"{"ok": true, "flow": {"name": "wait", "params": {"seconds": 0}}}"#,
            r#"{"ok": true, "flow": {"name": "wait", "params": {"seconds": 0}}}"#,
        ]);
        assert_eq!(f.controller.handle("c1", "pause once").await, TASK_STARTED);
        assert_eq!(f.controller.handle("c1", "pause twice").await, TASK_STARTED);
        f.controller.wait_for_flow("c1").await;
        f.controller.shutdown().await;

        let topics: Vec<String> = events(&f, "c1")
            .into_iter()
            .filter(|e| e.is_node_event() || e.topic == topic::TASK_DONE)
            .map(|e| e.topic)
            .collect();
        assert_eq!(
            topics,
            vec![
                "node.start", "node.done", "task.done",
                "node.start", "node.done", "task.done"
            ]
        );
    }
}
