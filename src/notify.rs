use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-resource domain events. Reads stay pull-based;
/// anything that wants push visibility of booking/blackout/quota changes
/// subscribes here (LISTEN at the wire layer rides on this).
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource: &str) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(resource.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event to a resource channel. No-op if nobody is listening.
    pub fn send(&self, resource: &str, event: &Event) {
        if let Some(sender) = self.channels.get(resource) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel.
    #[allow(dead_code)]
    pub fn remove(&self, resource: &str) {
        self.channels.remove(resource);
    }
}

// ── External notification dispatch ───────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    BookingCreated,
    BookingRescheduled,
    BookingCancelled,
    ApprovalDecided,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::BookingCreated => "booking_created",
            NotificationKind::BookingRescheduled => "booking_rescheduled",
            NotificationKind::BookingCancelled => "booking_cancelled",
            NotificationKind::ApprovalDecided => "approval_decided",
        }
    }
}

/// One outbound notification, handed to the external email/push collaborator
/// after a commit succeeds.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub booking_id: Ulid,
    pub resource: String,
    pub recipient: String,
    /// Booking summary for the delivery backend to render (email subject,
    /// push body). Everything the backend needs without a read-back.
    pub payload: serde_json::Value,
}

/// Fire-and-forget delivery boundary. Implementations must not block: a
/// dispatch failure is the implementation's problem to log, never the
/// scheduler's to propagate, since the booking has already committed.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, notification: Notification);
}

/// Default dispatcher: records the notification in the log. Stands in until
/// a real email/push backend is wired up at deployment.
pub struct LogDispatcher;

impl NotificationDispatcher for LogDispatcher {
    fn dispatch(&self, n: Notification) {
        tracing::info!(
            kind = n.kind.as_str(),
            booking = %n.booking_id,
            resource = %n.resource,
            recipient = %n.recipient,
            payload = %n.payload,
            "notification dispatched"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("t@school.edu");

        let event = Event::BlackoutAdded {
            id: Ulid::new(),
            span: Span::new(0, 1000),
        };
        hub.send("t@school.edu", &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber — should not panic
        hub.send(
            "lab-1",
            &Event::BlackoutRemoved { id: Ulid::new() },
        );
    }

    #[tokio::test]
    async fn channels_are_per_resource() {
        let hub = NotifyHub::new();
        let mut rx_a = hub.subscribe("lab-1");
        let _rx_b = hub.subscribe("lab-2");

        hub.send(
            "lab-2",
            &Event::BlackoutRemoved { id: Ulid::new() },
        );
        assert!(rx_a.try_recv().is_err());
    }
}
