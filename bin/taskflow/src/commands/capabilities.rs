use serde_json::Value;
use taskflow_core::{SessionState, ValueMap};

use super::provider::start_engine;

/// List registered capabilities, optionally through a conversation's profile.
pub async fn list(conversation: Option<String>, group: Option<String>) -> anyhow::Result<()> {
    let mut engine = start_engine().await?;

    let items = match conversation.as_deref() {
        Some(cid) => {
            engine
                .controller
                .visible_capabilities(cid, group.as_deref())
                .await
        }
        None => engine.registry.describe(None, group.as_deref()),
    };

    println!();
    println!("Capabilities ({} total)", items.len());
    println!();
    for item in &items {
        let short: String = item.description.chars().take(60).collect();
        let ellipsis = if item.description.chars().count() > 60 { "..." } else { "" };
        println!("  {:<24} {}{}", item.name, short, ellipsis);
    }
    println!();

    engine.shutdown().await;
    Ok(())
}

/// Run one capability against a fresh state and print its output.
pub async fn run(name: &str, params: Option<String>) -> anyhow::Result<()> {
    let params: ValueMap = match params.as_deref() {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            other => anyhow::bail!("--params must be a JSON object, got: {}", other),
        },
        None => ValueMap::new(),
    };

    let mut engine = start_engine().await?;
    let mut state = SessionState::new("cli:run");
    let result = engine.registry.run(name, &mut state, params).await;
    engine.shutdown().await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&Value::Object(output))?);
    Ok(())
}
