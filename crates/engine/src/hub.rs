use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use taskflow_core::Event;
use tokio::sync::mpsc;
use tracing::debug;

/// Handle on one conversation's event channel. Clones share the sender and
/// the single receiver, so only one consumer drains at a time.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Event>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>>,
}

impl EventQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Next event, waiting if none is queued. `None` only if the channel closed.
    pub async fn recv(&self) -> Option<Event> {
        self.rx.lock().await.recv().await
    }

    /// Next event if one is queued right now.
    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Everything queued right now, in order.
    pub fn drain(&self) -> Vec<Event> {
        let mut events = Vec::new();
        if let Ok(mut rx) = self.rx.try_lock() {
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
        }
        events
    }
}

/// Per-conversation FIFO event queues, created on first use.
#[derive(Default)]
pub struct EventHub {
    queues: Mutex<HashMap<String, EventQueue>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, conversation_id: &str) -> EventQueue {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.to_string())
            .or_insert_with(EventQueue::new)
            .clone()
    }

    /// Enqueues without waiting; the queue is unbounded.
    pub fn publish(&self, conversation_id: &str, topic: &str, payload: Value) {
        let queue = self.queue(conversation_id);
        if queue.tx.send(Event::new(topic, payload)).is_err() {
            debug!(conversation = %conversation_id, topic, "Event queue closed, dropping event");
        }
    }

    pub fn conversations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Discards every pending event. Queues stay usable afterwards.
    pub fn shutdown(&self) {
        let queues: Vec<(String, EventQueue)> = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, q)| (id.clone(), q.clone()))
            .collect();
        for (id, queue) in queues {
            let dropped = queue.drain().len();
            if dropped > 0 {
                debug!(conversation = %id, dropped, "Discarded pending events");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskflow_core::topic;

    #[tokio::test]
    async fn test_fifo_per_conversation() {
        let hub = EventHub::new();
        hub.publish("a", topic::USER, json!({"text": "1"}));
        hub.publish("b", topic::USER, json!({"text": "x"}));
        hub.publish("a", topic::ASSISTANT, json!({"text": "2"}));

        let queue = hub.queue("a");
        assert_eq!(queue.recv().await.unwrap().text(), Some("1"));
        let second = queue.recv().await.unwrap();
        assert_eq!(second.topic, topic::ASSISTANT);
        assert!(queue.try_recv().is_none());

        assert_eq!(hub.queue("b").try_recv().unwrap().text(), Some("x"));
        assert_eq!(hub.conversations(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_handles_share_one_receiver() {
        let hub = EventHub::new();
        let first = hub.queue("c");
        let second = hub.queue("c");
        hub.publish("c", topic::DEBUG, json!({"stage": "plan"}));
        assert!(second.try_recv().is_some());
        assert!(first.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_waits_for_publish() {
        let hub = Arc::new(EventHub::new());
        let queue = hub.queue("c");
        let publisher = {
            let hub = hub.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                hub.publish("c", topic::TASK_DONE, json!({}));
            })
        };
        let event = queue.recv().await.unwrap();
        assert_eq!(event.topic, topic::TASK_DONE);
        publisher.await.unwrap();
    }

    #[test]
    fn test_shutdown_discards_pending() {
        let hub = EventHub::new();
        for i in 0..3 {
            hub.publish("c", topic::USER, json!({"text": i.to_string()}));
        }
        hub.shutdown();
        assert!(hub.queue("c").drain().is_empty());
        hub.publish("c", topic::USER, json!({"text": "after"}));
        assert_eq!(hub.queue("c").drain().len(), 1);
    }
}
