/// Message bus — the pub/sub seam every instance fans chat events through.
///
/// Sessions never write broadcasts to each other. They hand events to the
/// [`Publisher`], which pushes them to the bus; the subscriber loop on every
/// instance (including this one) brings them back and delivers them locally.
use std::sync::LazyLock;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A live subscription. Ending or yielding `Err` means the subscription is gone.
pub type Subscription = BoxStream<'static, Result<String, BusError>>;

/// Bus failures. All of them are recoverable from the server's point of view.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus unreachable: {0}")]
    Connect(#[source] std::io::Error),
    #[error("bus protocol error: {0}")]
    Protocol(String),
    #[error("bus connection closed")]
    Closed,
    #[error("bus is unavailable")]
    Unavailable,
    #[error(transparent)]
    Resp(#[from] super::resp::RespError),
}

/// A publish/subscribe broker.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Publish one payload on `channel`. No delivery guarantee.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Open a subscription on `channel`. Only payloads published after this
    /// returns are delivered.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;
}

/// Host name used in instance ids.
pub static HOST_NAME: LazyLock<String> = LazyLock::new(|| {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "cove".into())
});

/// A fresh instance id: `<hostname>/<pid>/<random>`.
///
/// Each running server takes one, so two servers in the same process are
/// still distinct instances on the bus.
pub fn instance_id() -> String {
    format!("{}/{}/{:08x}", *HOST_NAME, std::process::id(), rand::random::<u32>())
}

/// A chat line plus where it came from. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Instance that published the event.
    pub origin: String,
    /// The line to deliver, without a trailing newline.
    pub text: String,
    /// Local identity on `origin` that must not receive this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<String>,
}

impl ChatEvent {
    pub fn new(origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            text: text.into(),
            skip: None,
        }
    }

    /// Keep this event away from `identity` on the origin instance.
    pub fn skipping(mut self, identity: impl Into<String>) -> Self {
        self.skip = Some(identity.into());
        self
    }

    pub fn to_payload(&self) -> String {
        // A struct of strings always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| self.text.clone())
    }

    /// Decode a bus payload. Anything that isn't one of our envelopes is
    /// treated as a bare line from a foreign publisher.
    pub fn from_payload(payload: &str) -> Self {
        serde_json::from_str(payload).unwrap_or_else(|_| ChatEvent {
            origin: String::new(),
            text: payload.strip_suffix('\n').unwrap_or(payload).to_owned(),
            skip: None,
        })
    }

    /// The identity to skip when delivering on instance `local`, if any.
    pub fn skip_for(&self, local: &str) -> Option<&str> {
        self.skip.as_deref().filter(|_| self.origin == local)
    }
}

/// Fire-and-forget handle to the publishing task.
///
/// Events are published one at a time in the order they were handed over,
/// so each session's broadcasts reach the bus in the order it produced them.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl Publisher {
    /// Spawn the publishing task for `channel`. It stops once every
    /// [`Publisher`] clone is dropped and the queue is drained.
    pub fn spawn<B: Bus + ?Sized>(
        bus: std::sync::Arc<B>,
        channel: String,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChatEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = bus.publish(&channel, &event.to_payload()).await {
                    // Dropped for good; never retried or reported to the sender.
                    debug!(channel, text = %event.text, "publish failed: {e}");
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Queue an event. Never waits, never fails visibly.
    pub fn publish(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }
}
