/// In-process bus — every clone shares the same channels.
///
/// Lets several [`ChatServer`](super::server::ChatServer)s in one process
/// behave like separate instances on a shared broker. The bus can be taken
/// down with [`MemoryBus::set_reachable`] to exercise the reconnect loop.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::bus::{Bus, BusError, Subscription};

/// Events buffered per subscriber before it starts missing them.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Inner {
    reachable: bool,
    channels: HashMap<String, broadcast::Sender<String>>,
}

#[derive(Debug, Clone)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                reachable: true,
                channels: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the bus down or bring it back.
    ///
    /// Going down ends every live subscription and loses whatever is
    /// published until it comes back.
    pub fn set_reachable(&self, reachable: bool) {
        let mut inner = self.lock();
        inner.reachable = reachable;
        if !reachable {
            // Dropping the senders closes every receiver.
            inner.channels.clear();
        }
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .channels
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let inner = self.lock();
        if !inner.reachable {
            return Err(BusError::Unavailable);
        }
        if let Some(tx) = inner.channels.get(channel) {
            // No subscribers is not an error on a pub/sub bus.
            let _ = tx.send(payload.to_owned());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let mut inner = self.lock();
        if !inner.reachable {
            return Err(BusError::Unavailable);
        }
        let rx = inner
            .channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let stream = BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(payload) => Some(Ok(payload)),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    debug!(missed, "memory bus subscriber lagged, events skipped");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
