//! Per-socket pumps.
//!
//! Each connection runs an inbound pump (socket -> session) and an outbound
//! pump (outbox -> socket). When either pump ends the other is cancelled
//! and the connection is detached from its session.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::session::{ConnectionId, Participant, Session};
use crate::middleware::auth::Identity;

/// Time allowed to write one frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between two frames from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Keepalive ping period. Must be shorter than `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

pub const MAX_MESSAGE_SIZE: usize = 512;

pub const OUTBOX_CAPACITY: usize = 256;

/// A serialized message, shared between every outbox it was pushed to.
pub type Frame = Arc<str>;

/// Bounded, non-blocking send half of a connection's outgoing queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Frame>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// False if the queue is full or its pump is gone.
    pub fn try_push(&self, frame: Frame) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct PumpSettings {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
    pub outbox_capacity: usize,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            max_message_size: MAX_MESSAGE_SIZE,
            outbox_capacity: OUTBOX_CAPACITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum WriteError<E> {
    #[error("write timed out")]
    Timeout,
    #[error("{0}")]
    Socket(E),
}

pub struct ClientConnection {
    id: ConnectionId,
    identity: Identity,
    session: Arc<Session>,
    settings: PumpSettings,
}

impl ClientConnection {
    pub fn new(identity: Identity, session: Arc<Session>, settings: PumpSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            session,
            settings,
        }
    }

    /// Attaches to the session and pumps until the peer goes away, a socket
    /// error occurs, or the session stops. Always detaches before returning.
    pub async fn serve<S, E>(self, socket: S)
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (sink, stream) = socket.split();
        let (outbox, outbox_rx) = Outbox::channel(self.settings.outbox_capacity);
        let done = CancellationToken::new();

        let attached = self.session.add_client(
            self.id,
            Participant {
                user_id: self.identity.user_id.clone(),
                outbox,
            },
        );
        if !attached {
            tracing::info!(
                session_id = %self.session.id(),
                connection_id = %self.id,
                "session already closed, dropping connection"
            );
        }

        let writer = tokio::spawn(write_pump(
            sink,
            outbox_rx,
            self.session.shutdown_token(),
            done.clone(),
            self.settings.clone(),
            self.id,
        ));

        read_pump(stream, &self.session, &self.identity, &done, &self.settings, self.id).await;
        done.cancel();

        if let Err(e) = writer.await {
            tracing::error!(connection_id = %self.id, error = %e, "write pump panicked");
        }

        self.session.remove_client(self.id);
        tracing::info!(
            session_id = %self.session.id(),
            connection_id = %self.id,
            user_id = %self.identity.user_id,
            "client disconnected"
        );
    }
}

async fn read_pump<R, E>(
    mut stream: R,
    session: &Session,
    identity: &Identity,
    done: &CancellationToken,
    settings: &PumpSettings,
    connection_id: ConnectionId,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        // A fresh deadline per frame; pongs count as frames.
        let next = tokio::select! {
            _ = done.cancelled() => return,
            next = tokio::time::timeout(settings.pong_wait, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                tracing::debug!(%connection_id, "read deadline exceeded");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!(%connection_id, error = %e, "read failed");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if text.len() > settings.max_message_size {
                    tracing::warn!(%connection_id, size = text.len(), "inbound message too large");
                    return;
                }
                session.handle_frame(&identity.user_id, &text);
            }
            Message::Binary(data) => {
                if data.len() > settings.max_message_size {
                    tracing::warn!(%connection_id, size = data.len(), "inbound message too large");
                    return;
                }
                match std::str::from_utf8(&data) {
                    Ok(text) => session.handle_frame(&identity.user_id, text),
                    Err(_) => tracing::debug!(%connection_id, "dropping non-utf8 binary frame"),
                }
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return,
        }
    }
}

async fn write_pump<W, E>(
    mut sink: W,
    mut outbox: mpsc::Receiver<Frame>,
    session_closed: CancellationToken,
    done: CancellationToken,
    settings: PumpSettings,
    connection_id: ConnectionId,
) where
    W: Sink<Message, Error = E> + Unpin,
    E: std::error::Error + 'static,
{
    let mut ping = tokio::time::interval_at(Instant::now() + settings.ping_period, settings.ping_period);

    loop {
        let written = tokio::select! {
            _ = done.cancelled() => break,
            _ = session_closed.cancelled() => {
                let _ = write(&mut sink, Message::Close(None), settings.write_wait).await;
                break;
            }
            frame = outbox.recv() => match frame {
                Some(first) => {
                    let batch = coalesce(first, &mut outbox, settings.outbox_capacity);
                    write(&mut sink, Message::Text(batch), settings.write_wait).await
                }
                None => {
                    let _ = write(&mut sink, Message::Close(None), settings.write_wait).await;
                    break;
                }
            },
            _ = ping.tick() => write(&mut sink, Message::Ping(Vec::new()), settings.write_wait).await,
        };

        if let Err(e) = written {
            tracing::debug!(%connection_id, error = %e, "write failed");
            break;
        }
    }

    done.cancel();
}

/// Joins `first` with whatever is already queued, newline separated, so a
/// burst goes out as one frame. Takes at most `limit` extra frames.
fn coalesce(first: Frame, outbox: &mut mpsc::Receiver<Frame>, limit: usize) -> String {
    let mut batch = String::from(&*first);
    for _ in 0..limit {
        match outbox.try_recv() {
            Ok(next) => {
                batch.push('\n');
                batch.push_str(&next);
            }
            Err(_) => break,
        }
    }
    batch
}

async fn write<W, E>(sink: &mut W, message: Message, wait: Duration) -> Result<(), WriteError<E>>
where
    W: Sink<Message, Error = E> + Unpin,
{
    match tokio::time::timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Socket(e)),
        Err(_) => Err(WriteError::Timeout),
    }
}
