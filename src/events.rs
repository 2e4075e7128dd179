use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::IncidentSeverity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentEventKind {
    Opened,
    Resolved,
}

/// In-process incident lifecycle event. An external notifier may subscribe;
/// the detector is not responsible for delivery or retry.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentEvent {
    pub kind: IncidentEventKind,
    pub monitor_id: i64,
    pub incident_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<IncidentSeverity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Fan-out broadcaster for incident events. Subscribers receive all events.
pub struct EventBroadcaster {
    sender: broadcast::Sender<IncidentEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBroadcaster { sender }
    }

    pub fn send(&self, event: IncidentEvent) {
        // No subscribers is fine; the event is simply dropped.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IncidentEvent> {
        self.sender.subscribe()
    }
}
