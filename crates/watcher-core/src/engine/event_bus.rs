//! Broadcast channel for watcher events.

use tokio::sync::broadcast;
use watcher_types::WatcherEvent;

/// Fan-out bus for [`WatcherEvent`]s.
///
/// Publishing never blocks. Subscribers that fall more than `capacity` events
/// behind miss the oldest ones.
#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<WatcherEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<WatcherEvent> {
		self.sender.subscribe()
	}

	/// Publishes an event; having no subscribers is not an error.
	pub fn publish(&self, event: WatcherEvent) {
		if self.sender.send(event).is_err() {
			tracing::trace!("No event subscribers");
		}
	}
}
