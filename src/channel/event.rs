use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelEventKind {
    Opening,
    Redirect,
    Services,
    Open,
    Close,
}

/// A notification about a channel's lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelEvent {
    pub kind: ChannelEventKind,
    pub channel_id: String,
    pub message: String,
    /// Human readable name of the log this event belongs to.
    pub log_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChannelEvent {
    pub fn new(kind: ChannelEventKind, channel_id: &str, message: impl Into<String>, log_name: Option<String>) -> Self {
        Self {
            kind,
            channel_id: channel_id.to_string(),
            message: message.into(),
            log_name,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcasts channel events to every subscriber and mirrors them into the
/// `channel_event` log target.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChannelEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.tx.subscribe()
    }

    pub fn fire(&self, event: ChannelEvent) {
        info!(
            target: "channel_event",
            kind = ?event.kind,
            channel = %event.channel_id,
            log_name = event.log_name.as_deref().unwrap_or(""),
            "{}",
            event.message
        );
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Drain whatever is buffered in `rx` without waiting.
pub fn drain(rx: &mut broadcast::Receiver<ChannelEvent>) -> Vec<ChannelEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.fire(ChannelEvent::new(ChannelEventKind::Opening, "c1", "to p1", None));
        bus.fire(ChannelEvent::new(ChannelEventKind::Open, "c1", "Shared", Some("p1".into())));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ChannelEventKind::Opening);
        assert_eq!(events[1].log_name.as_deref(), Some("p1"));
    }

    #[test]
    fn firing_without_subscribers_is_harmless() {
        EventBus::new(1).fire(ChannelEvent::new(ChannelEventKind::Close, "c", "closed", None));
    }
}
