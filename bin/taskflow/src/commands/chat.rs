use std::io::Write;
use taskflow_core::{topic, Event};
use taskflow_engine::{Engine, EventQueue, TASK_STARTED};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use super::provider::start_engine;

fn print_event(event: &Event) {
    match event.topic.as_str() {
        topic::ASSISTANT => {
            if let Some(text) = event.text() {
                println!("\n{}\n", text);
            }
        }
        topic::NODE_LOG => {
            if let Some(logs) = event.payload.get("logs").and_then(|v| v.as_str()) {
                for line in logs.lines() {
                    println!("  | {}", line);
                }
            }
        }
        topic::NODE_START => {
            if let Some(name) = event.payload.get("capability").and_then(|v| v.as_str()) {
                println!("  > {}", name);
            }
        }
        _ => debug!(topic = %event.topic, payload = %event.payload, "Event"),
    }
}

/// Handles one message. For a launched flow, streams its events until the
/// flow task ends.
async fn exchange(engine: &Engine, conversation: &str, queue: &EventQueue, input: &str) {
    let reply = engine.handle(conversation, input).await;
    if reply != TASK_STARTED {
        queue.drain();
        println!("\n{}\n", reply);
        return;
    }

    let finished = engine.controller.wait_for_flow(conversation);
    tokio::pin!(finished);
    loop {
        tokio::select! {
            Some(event) = queue.recv() => print_event(&event),
            _ = &mut finished => {
                for event in queue.drain() {
                    print_event(&event);
                }
                break;
            }
        }
    }
}

/// Interactive loop on stdin. `/quit` or EOF ends it.
pub async fn run(conversation: String) -> anyhow::Result<()> {
    let mut engine = start_engine().await?;
    let queue = engine.hub.queue(&conversation);

    println!("taskflow chat ({}). Type /quit to exit.", conversation);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/quit" || input == "/exit" {
            break;
        }
        exchange(&engine, &conversation, &queue, input).await;
    }

    engine.shutdown().await;
    Ok(())
}

/// One-shot message.
pub async fn send(message: String, conversation: String) -> anyhow::Result<()> {
    let mut engine = start_engine().await?;
    let queue = engine.hub.queue(&conversation);
    exchange(&engine, &conversation, &queue, &message).await;
    engine.shutdown().await;
    Ok(())
}
