//! Admin event broadcasting for real-time updates.

use axum::response::sse::{Event, KeepAlive};
use axum::response::Sse;
use futures::Stream;
use selene_types::AdminEvent;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

/// Event broadcaster for SSE (Server-Sent Events) towards admin clients.
#[derive(Clone)]
pub struct AdminBroadcaster {
    /// Broadcast channel for events
    sender: Arc<broadcast::Sender<AdminEvent>>,
}

impl AdminBroadcaster {
    /// Create a new event broadcaster with a buffer size.
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Broadcast an event to all connected admin clients.
    pub fn broadcast(&self, event: AdminEvent) {
        debug!("Broadcasting admin event: {}", event.description());
        // send returns the receiver count; nobody listening is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events and get a SSE stream.
    pub fn subscribe(&self) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        let rx = self.sender.subscribe();
        let stream = BroadcastStream::new(rx);

        let event_stream = stream.filter_map(|result| match result {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => Some(Ok(Event::default().data(json))),
                Err(e) => {
                    tracing::error!("Failed to serialize admin event: {}", e);
                    None
                }
            },
            Err(e) => {
                // BroadcastStream returns RecvError when lagging
                tracing::warn!("Admin client lagging, skipping events: {}", e);
                None
            }
        });

        Sse::new(event_stream).keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for AdminBroadcaster {
    fn default() -> Self {
        Self::new(100) // Default buffer of 100 events
    }
}
