//! Mount table change events and bus.

use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Mount table change events.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MountEvent {
    /// Filesystem mounted.
    Mounted {
        source: Option<String>,
        target: String,
        timestamp: i64,
    },
    /// Filesystem unmounted.
    Unmounted { target: String, timestamp: i64 },
    /// Mount options changed.
    Remounted { target: String, timestamp: i64 },
    /// Mount moved to another mountpoint.
    Moved {
        from: String,
        target: String,
        timestamp: i64,
    },
}

impl MountEvent {
    /// Mountpoint the event is about.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Mounted { target, .. }
            | Self::Unmounted { target, .. }
            | Self::Remounted { target, .. }
            | Self::Moved { target, .. } => target,
        }
    }
}

/// Current time as a Unix timestamp.
#[must_use]
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Event bus for mount table changes.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<MountEvent>>>>,
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> Receiver<MountEvent> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Publish an event; dropped subscribers are forgotten.
    pub fn publish(&self, event: &MountEvent) {
        tracing::debug!(?event, "Publishing mount event");
        self.subscribers
            .lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

/// Touch the utab event file so that pollers notice the change.
pub fn touch_event_file(path: &Path) {
    let result = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(std::time::SystemTime::now()));
    if let Err(err) = result {
        tracing::warn!(path = %path.display(), %err, "Failed to touch event file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_events() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        let event = MountEvent::Unmounted {
            target: "/data".into(),
            timestamp: now(),
        };
        bus.publish(&event);
        assert_eq!(first.try_recv().unwrap(), event);
        assert_eq!(second.try_recv().unwrap().target(), "/data");
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        drop(bus.subscribe());
        let alive = bus.subscribe();
        bus.publish(&MountEvent::Remounted {
            target: "/".into(),
            timestamp: 0,
        });
        assert_eq!(bus.subscribers.lock().len(), 1);
        assert!(alive.try_recv().is_ok());
    }

    #[test]
    fn event_serialization() {
        let event = MountEvent::Mounted {
            source: Some("/dev/sdb1".into()),
            target: "/data".into(),
            timestamp: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"mounted\""));
        let back: MountEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn touch_creates_event_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("utab.event");
        touch_event_file(&path);
        assert!(path.exists());
    }
}
