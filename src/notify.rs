use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Channel that receives every claim on the canvas.
pub const ALL_SPOTS_CHANNEL: &str = "spots";

/// Channel for claims touching one index chunk, e.g. `chunk_3_7`.
pub fn chunk_channel(cx: u32, cy: u32) -> String {
    format!("chunk_{cx}_{cy}")
}

/// Broadcast hub for live canvas updates, keyed by channel name.
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

    /// Subscribe to a channel, creating it on first use.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Event> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to a channel. No-op if nobody ever subscribed.
    pub fn send(&self, channel: &str, event: &Event) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose receivers are all gone.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }
}
