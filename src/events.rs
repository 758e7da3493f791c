//! UI event fan-out.
//!
//! The resolver and workers emit typed events; the HTTP layer (or any other
//! subscriber) drains them over a broadcast channel. Emission never blocks
//! and never fails; an event with no listener is simply dropped.

use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    /// A mapping landed in the ambiguous band and needs a human eye.
    LowConfidence {
        user_id: String,
        email_id: String,
        project_id: String,
        score: f64,
    },
    /// Extraction found several independent projects in one message.
    MultiProjectDetected {
        user_id: String,
        email_id: String,
        project_ids: Vec<String>,
    },
    /// The resolver created a project rather than matching one.
    NewProject {
        user_id: String,
        project_id: String,
        name: String,
        confidence: f64,
    },
    /// A message split away from its thread's consensus project.
    SplitFromThread {
        user_id: String,
        email_id: String,
        thread_id: String,
        project_id: String,
    },
    /// Credentials are dead; the user must re-consent.
    AuthExpired { user_id: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UiEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventBus { tx }
    }

    pub fn emit(&self, event: UiEvent) {
        log::debug!("Event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(UiEvent::AuthExpired {
            user_id: "u1".into(),
        });
        match rx.recv().await.unwrap() {
            UiEvent::AuthExpired { user_id } => assert_eq!(user_id, "u1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(UiEvent::NewProject {
            user_id: "u1".into(),
            project_id: "p1".into(),
            name: "Baker".into(),
            confidence: 0.9,
        });
    }

    #[test]
    fn test_event_serialization_tag() {
        let json = serde_json::to_string(&UiEvent::MultiProjectDetected {
            user_id: "u1".into(),
            email_id: "m1".into(),
            project_ids: vec!["p1".into(), "p2".into()],
        })
        .unwrap();
        assert!(json.contains("\"type\":\"multi_project_detected\""));
    }
}
