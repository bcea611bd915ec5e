/// Bus subscriber — the only path that writes into the local broadcast registry.
///
/// One per server. Subscribes to the chat channel, delivers every event it
/// receives to the local sessions, and when the subscription fails or drops,
/// waits a fixed delay and starts over. It never gives up; it stops only when
/// the server shuts down.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bus::{Bus, ChatEvent};
use super::server::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Active,
    FailedAwaitingRetry,
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::FailedAwaitingRetry => "failed, awaiting retry",
        })
    }
}

pub struct Subscriber {
    bus: Arc<dyn Bus>,
    channel: String,
    retry_delay: Duration,
    /// Instance id, for honouring an event's `skip`.
    instance: String,
    state: SharedState,
    status: watch::Sender<SubscriberState>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("channel", &self.channel)
            .field("retry_delay", &self.retry_delay)
            .field("instance", &self.instance)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    pub fn new(
        bus: Arc<dyn Bus>,
        channel: impl Into<String>,
        retry_delay: Duration,
        instance: impl Into<String>,
        state: SharedState,
    ) -> Self {
        let (status, _) = watch::channel(SubscriberState::Connecting);
        Self {
            bus,
            channel: channel.into(),
            retry_delay,
            instance: instance.into(),
            state,
            status,
        }
    }

    /// Observe state transitions.
    pub fn watch(&self) -> watch::Receiver<SubscriberState> {
        self.status.subscribe()
    }

    /// Run the loop on its own task until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    fn set(&self, next: SubscriberState) {
        let prev = self.status.send_replace(next);
        if prev != next {
            debug!(channel = %self.channel, "subscriber {prev} -> {next}");
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            self.set(SubscriberState::Connecting);

            let subscribed = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = self.bus.subscribe(&self.channel) => result,
            };

            match subscribed {
                Ok(mut events) => {
                    self.set(SubscriberState::Active);
                    info!(channel = %self.channel, "bus subscription active");

                    loop {
                        let next = tokio::select! {
                            _ = shutdown.cancelled() => return,
                            next = events.next() => next,
                        };
                        match next {
                            Some(Ok(payload)) => self.deliver(&payload).await,
                            Some(Err(e)) => {
                                warn!(channel = %self.channel, "bus subscription failed: {e}");
                                break;
                            }
                            None => {
                                warn!(channel = %self.channel, "bus subscription closed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(channel = %self.channel, "bus subscribe failed: {e}");
                }
            }

            self.set(SubscriberState::FailedAwaitingRetry);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    async fn deliver(&self, payload: &str) {
        let event = ChatEvent::from_payload(payload);
        let st = self.state.read().await;
        st.clients
            .deliver_except(&event.text, event.skip_for(&self.instance));
    }
}
