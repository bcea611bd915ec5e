/// Chat server core — shared state, lifecycle, accept loop.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use super::bus::{self, Bus, Publisher};
use super::config::Config;
use super::registry::{BroadcastRegistry, NickRegistry};
use super::session;
use super::subscriber::{Subscriber, SubscriberState};

/// How long `stop` waits for queued broadcasts to reach the bus.
const PUBLISH_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-instance state. Both registries sit behind the same lock so a
/// session's join and leave bookkeeping is one critical section.
#[derive(Debug, Default)]
pub struct ServerState {
    pub nicks: NickRegistry,
    pub clients: BroadcastRegistry,
}

impl ServerState {
    /// Nickname if set, else the identity itself.
    pub fn display_name(&self, identity: &str) -> String {
        self.nicks.get(identity).unwrap_or(identity).to_owned()
    }

    /// Forget a session in both registries. Returns the display name it had
    /// right before removal.
    pub fn end_session(&mut self, identity: &str) -> String {
        let display = self.display_name(identity);
        self.clients.unregister(identity);
        self.nicks.remove(identity);
        display
    }
}

/// Shared, thread-safe server state.
pub type SharedState = Arc<RwLock<ServerState>>;

/// Everything a session task needs from its server.
#[derive(Debug, Clone)]
pub struct Context {
    pub state: SharedState,
    pub publisher: Publisher,
    /// This server's id on the bus.
    pub instance: Arc<str>,
    pub shutdown: CancellationToken,
}

/// A running server instance.
#[derive(Debug)]
pub struct ChatServer {
    local_addr: SocketAddr,
    ctx: Context,
    status: watch::Receiver<SubscriberState>,
    sessions: TaskTracker,
    accept_task: JoinHandle<()>,
    subscriber_task: JoinHandle<()>,
    publisher_task: JoinHandle<()>,
}

impl ChatServer {
    /// Bind the listener and start the subscriber, publisher and accept loop.
    ///
    /// A bind failure is returned; a bus that is down is not an error, the
    /// subscriber keeps retrying in the background.
    pub async fn start(config: &Config, bus: Arc<dyn Bus>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, channel = %config.channel, "listening");

        let state: SharedState = Arc::new(RwLock::new(ServerState::default()));
        let instance: Arc<str> = bus::instance_id().into();
        let shutdown = CancellationToken::new();

        let (publisher, publisher_task) =
            Publisher::spawn(Arc::clone(&bus), config.channel.clone());

        let subscriber = Subscriber::new(
            bus,
            config.channel.clone(),
            config.retry_delay,
            instance.to_string(),
            Arc::clone(&state),
        );
        let status = subscriber.watch();
        let subscriber_task = subscriber.spawn(shutdown.clone());

        let ctx = Context {
            state,
            publisher,
            instance,
            shutdown,
        };
        let sessions = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(listener, ctx.clone(), sessions.clone()));

        Ok(Self {
            local_addr,
            ctx,
            status,
            sessions,
            accept_task,
            subscriber_task,
            publisher_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &SharedState {
        &self.ctx.state
    }

    pub fn instance(&self) -> &str {
        &self.ctx.instance
    }

    /// Current state of the bus subscription.
    pub fn subscriber_state(&self) -> SubscriberState {
        *self.status.borrow()
    }

    /// Watch the bus subscription change state.
    pub fn watch_subscriber(&self) -> watch::Receiver<SubscriberState> {
        self.status.clone()
    }

    /// Stop accepting, close every session and stop the subscriber.
    pub async fn stop(self) {
        let Self {
            ctx,
            sessions,
            accept_task,
            subscriber_task,
            publisher_task,
            ..
        } = self;

        ctx.shutdown.cancel();
        let _ = accept_task.await;
        let _ = subscriber_task.await;

        sessions.close();
        sessions.wait().await;

        // Sessions are gone; once our handle drops, the publisher drains and exits.
        drop(ctx);
        let abort = publisher_task.abort_handle();
        if tokio::time::timeout(PUBLISH_DRAIN_TIMEOUT, publisher_task)
            .await
            .is_err()
        {
            abort.abort();
        }
        info!("server stopped");
    }
}

/// Accept loop for the listener. Every connection gets its own session task.
async fn accept_loop(listener: TcpListener, ctx: Context, sessions: TaskTracker) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (socket, addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                // Usually transient (e.g. out of file descriptors).
                warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        info!(%addr, "accepted new client");
        let ctx = ctx.clone();
        sessions.spawn(async move {
            if let Err(e) = session::run(socket, addr.to_string(), ctx).await {
                warn!(%addr, "client error: {e}");
            }
            info!(%addr, "client disconnected");
        });
    }
}
