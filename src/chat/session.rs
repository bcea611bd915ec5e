/// Session handling — one task per connection, from join notice to leave notice.
///
/// A session reads lines from its client, resolves each against the command
/// table and applies the effects in order. Broadcasts it produces go to the
/// bus publisher; lines other sessions broadcast reach it through its
/// [`ClientHandle`] queue once the subscriber brings them back.
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::bus::ChatEvent;
use super::codec::{CodecError, LineCodec};
use super::command::{self, Effect, Line, Speaker};
use super::registry::ClientHandle;
use super::server::Context;

enum Flow {
    Continue,
    Close,
}

/// Drive one client connection until it closes, errors, sends `/exit` or the
/// server shuts down. `identity` is the peer address, unique among live
/// sessions on this instance.
///
/// The leave notice is published whatever the reason the session ended. A
/// read error is returned after that cleanup.
pub async fn run<S>(stream: S, identity: String, ctx: Context) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LineCodec::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Register and announce under one write lock. Nothing is delivered until
    // it is released, and `skip` keeps the echo away from the joiner.
    {
        let mut st = ctx.state.write().await;
        if !st.clients.register(&identity, ClientHandle::new(tx)) {
            warn!(%identity, "identity already has a live session, refusing");
            return Ok(());
        }
        ctx.publisher.publish(
            ChatEvent::new(&*ctx.instance, format!("{identity} joined the chat."))
                .skipping(identity.as_str()),
        );
    }

    let outcome = loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break Ok(()),

            frame = framed.next() => {
                let line = match frame {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                };

                if let Flow::Close = handle_line(&mut framed, &identity, &line, &ctx).await {
                    if let Err(e) = framed.close().await {
                        debug!(%identity, "close failed: {e}");
                    }
                    break Ok(());
                }
            }

            // Broadcasts delivered by the subscriber.
            Some(text) = rx.recv() => {
                if let Err(e) = framed.send(text).await {
                    debug!(%identity, "delivery failed: {e}");
                }
            }
        }
    };

    let display = ctx.state.write().await.end_session(&identity);
    ctx.publisher
        .publish(ChatEvent::new(&*ctx.instance, format!("{display} left the chat.")));

    outcome
}

async fn handle_line<S>(
    framed: &mut Framed<S, LineCodec>,
    identity: &str,
    line: &str,
    ctx: &Context,
) -> Flow
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let effects = {
        let st = ctx.state.read().await;
        let speaker = Speaker {
            identity,
            nick: st.nicks.get(identity),
        };
        command::resolve(&Line::parse(line), speaker)
    };

    for effect in effects {
        match effect {
            Effect::Reply(text) => {
                if let Err(e) = framed.send(text).await {
                    debug!(identity, "reply failed: {e}");
                }
            }
            Effect::Broadcast(text) => {
                ctx.publisher.publish(ChatEvent::new(&*ctx.instance, text));
            }
            Effect::SetNick(nick) => {
                if !ctx.state.write().await.nicks.set(identity, &nick) {
                    warn!(identity, nick, "nickname refused by registry");
                }
            }
            Effect::Close => return Flow::Close,
        }
    }
    Flow::Continue
}
