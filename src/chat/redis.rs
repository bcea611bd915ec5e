/// Redis-protocol bus — PUBLISH on a shared connection, SUBSCRIBE on its own.
///
/// A connection in subscribe mode can't issue PUBLISH, so every subscription
/// gets a fresh TCP connection while publishes reuse one lazily-opened
/// connection that is thrown away on the first error.
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use super::bus::{Bus, BusError, Subscription};
use super::resp::{Frame, RespCodec};

type Connection = Framed<TcpStream, RespCodec>;

#[derive(Debug)]
pub struct RedisBus {
    /// `host:port` of the broker.
    addr: String,
    publisher: Mutex<Option<Connection>>,
}

impl RedisBus {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            publisher: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Connection, BusError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(BusError::Connect)?;
        Ok(Framed::new(stream, RespCodec))
    }
}

/// Read the next frame, treating a closed socket as an error.
async fn next_frame(conn: &mut Connection) -> Result<Frame, BusError> {
    match conn.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(e.into()),
        None => Err(BusError::Closed),
    }
}

/// Payload of a pushed `message` frame; `None` for every other push.
fn pushed_message(frame: &Frame) -> Option<String> {
    match frame.as_array()? {
        [kind, _channel, payload] if kind.as_text().as_deref() == Some("message") => {
            payload.as_text()
        }
        _ => None,
    }
}

/// Whether `frame` confirms our SUBSCRIBE to `channel`.
fn is_subscribe_ack(frame: &Frame, channel: &str) -> bool {
    matches!(
        frame.as_array(),
        Some([kind, ch, Frame::Integer(_)])
            if kind.as_text().as_deref() == Some("subscribe")
                && ch.as_text().as_deref() == Some(channel)
    )
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut slot = self.publisher.lock().await;
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(BusError::Closed);
        };

        let result = match conn.send(Frame::command(["PUBLISH", channel, payload])).await {
            Ok(()) => next_frame(conn).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(Frame::Integer(receivers)) => {
                debug!(channel, receivers, "published");
                Ok(())
            }
            Ok(Frame::Error(e)) => Err(BusError::Protocol(e)),
            Ok(other) => {
                *slot = None;
                Err(BusError::Protocol(format!("unexpected PUBLISH reply: {other:?}")))
            }
            Err(e) => {
                // Reconnect on the next publish.
                *slot = None;
                Err(e)
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let mut conn = self.connect().await?;
        conn.send(Frame::command(["SUBSCRIBE", channel])).await?;

        loop {
            let frame = next_frame(&mut conn).await?;
            if let Frame::Error(e) = frame {
                return Err(BusError::Protocol(e));
            }
            if is_subscribe_ack(&frame, channel) {
                break;
            }
        }
        info!(addr = %self.addr, channel, "subscribed");

        let stream = conn.filter_map(|item| async move {
            match item {
                Ok(frame) => pushed_message(&frame).map(Ok),
                Err(e) => Some(Err(BusError::from(e))),
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use crate::chat::resp::RespError;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn bulk(s: &str) -> Frame {
        Frame::Bulk(Some(Bytes::copy_from_slice(s.as_bytes())))
    }

    #[test]
    fn recognises_message_push() {
        let frame = Frame::Array(Some(vec![bulk("message"), bulk("chat"), bulk("hi")]));
        assert_eq!(pushed_message(&frame).as_deref(), Some("hi"));
    }

    #[test]
    fn ignores_other_pushes() {
        let frame = Frame::Array(Some(vec![bulk("subscribe"), bulk("chat"), Frame::Integer(1)]));
        assert_eq!(pushed_message(&frame), None);
        assert_eq!(pushed_message(&Frame::Simple("PONG".into())), None);
    }

    #[test]
    fn subscribe_ack_must_name_our_channel() {
        let ack = Frame::Array(Some(vec![bulk("subscribe"), bulk("chat"), Frame::Integer(1)]));
        assert!(is_subscribe_ack(&ack, "chat"));
        assert!(!is_subscribe_ack(&ack, "other"));
    }

    /// A one-connection fake broker that scripts its replies.
    async fn fake_broker<F, Fut>(script: F) -> String
    where
        F: FnOnce(Connection) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            script(Framed::new(socket, RespCodec)).await;
        });
        addr
    }

    #[tokio::test]
    async fn publish_sends_command_and_reads_count() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let addr = fake_broker(|mut conn| async move {
            let cmd = conn.next().await.unwrap().unwrap();
            conn.send(Frame::Integer(2)).await.unwrap();
            let _ = seen_tx.send(cmd);
        })
        .await;

        let bus = RedisBus::new(addr);
        bus.publish("chat", "bob says: hi").await.unwrap();
        assert_eq!(
            seen_rx.await.unwrap(),
            Frame::command(["PUBLISH", "chat", "bob says: hi"])
        );
    }

    #[tokio::test]
    async fn publish_error_reply_is_reported() {
        let addr = fake_broker(|mut conn| async move {
            let _ = conn.next().await;
            conn.send(Frame::Error("ERR wrong".into())).await.unwrap();
        })
        .await;

        let bus = RedisBus::new(addr);
        assert!(matches!(
            bus.publish("chat", "x").await,
            Err(BusError::Protocol(e)) if e == "ERR wrong"
        ));
    }

    #[tokio::test]
    async fn publish_to_unreachable_broker_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let bus = RedisBus::new(addr);
        assert!(matches!(bus.publish("chat", "x").await, Err(BusError::Connect(_))));
    }

    #[tokio::test]
    async fn subscribe_yields_messages_then_ends_on_close() {
        let addr = fake_broker(|mut conn| async move {
            let cmd = conn.next().await.unwrap().unwrap();
            assert_eq!(cmd, Frame::command(["SUBSCRIBE", "chat"]));
            conn.send(Frame::Array(Some(vec![
                bulk("subscribe"),
                bulk("chat"),
                Frame::Integer(1),
            ])))
            .await
            .unwrap();
            for text in ["one", "two"] {
                conn.send(Frame::Array(Some(vec![bulk("message"), bulk("chat"), bulk(text)])))
                    .await
                    .unwrap();
            }
            // Dropping the connection ends the subscription.
        })
        .await;

        let bus = RedisBus::new(addr);
        let mut sub = bus.subscribe("chat").await.unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap(), "one");
        assert_eq!(sub.next().await.unwrap().unwrap(), "two");
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn malformed_push_fails_the_subscription() {
        let addr = fake_broker(|mut conn| async move {
            let _ = conn.next().await;
            conn.send(Frame::Array(Some(vec![
                bulk("subscribe"),
                bulk("chat"),
                Frame::Integer(1),
            ])))
            .await
            .unwrap();
            conn.get_mut()
                .write_all("*1\r\n".repeat(1_000).as_bytes())
                .await
                .unwrap();
            // Hold the socket open until the client gives up on it.
            let _ = conn.next().await;
        })
        .await;

        let bus = RedisBus::new(addr);
        let mut sub = bus.subscribe("chat").await.unwrap();
        assert!(matches!(
            sub.next().await,
            Some(Err(BusError::Resp(RespError::TooDeep)))
        ));
    }

    #[tokio::test]
    async fn subscribe_rejected_by_broker() {
        let addr = fake_broker(|mut conn| async move {
            let _ = conn.next().await;
            conn.send(Frame::Error("NOAUTH Authentication required.".into()))
                .await
                .unwrap();
        })
        .await;

        let bus = RedisBus::new(addr);
        assert!(matches!(bus.subscribe("chat").await, Err(BusError::Protocol(_))));
    }
}
