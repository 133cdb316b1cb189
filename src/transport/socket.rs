//! Message-passing view of a websocket.
//!
//! Connection logic never touches a websocket library directly. A
//! [`RawSocket`] is a pair of channels: commands go out through a
//! [`SocketSink`], events come in through a [`SocketStream`]. A pump task
//! per socket translates between the channels and the real frames, so
//! the same connection code runs over tokio-tungstenite (outbound), axum
//! (inbound), or an in-memory pipe in tests.

use crate::error::SyncError;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Text(String),
    Ping,
    Pong(Vec<u8>),
    /// Graceful close handshake.
    Close,
    /// Drop the transport immediately.
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    Ping(Vec<u8>),
    /// Terminal: nothing follows.
    Closed,
}

/// Cloneable write half.
#[derive(Debug, Clone)]
pub struct SocketSink {
    tx: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketSink {
    pub fn send_text(&self, text: String) -> Result<(), SyncError> {
        self.command(SocketCommand::Text(text))
    }

    pub fn ping(&self) -> Result<(), SyncError> {
        self.command(SocketCommand::Ping)
    }

    pub fn pong(&self, payload: Vec<u8>) {
        let _ = self.command(SocketCommand::Pong(payload));
    }

    pub fn close(&self) {
        let _ = self.command(SocketCommand::Close);
    }

    pub fn terminate(&self) {
        let _ = self.command(SocketCommand::Terminate);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn command(&self, cmd: SocketCommand) -> Result<(), SyncError> {
        self.tx.send(cmd).map_err(|_| SyncError::SocketClosed)
    }
}

/// Read half. Yields [`SocketEvent::Closed`] forever once the socket is gone.
#[derive(Debug)]
pub struct SocketStream {
    rx: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketStream {
    pub async fn next(&mut self) -> SocketEvent {
        self.rx.recv().await.unwrap_or(SocketEvent::Closed)
    }
}

#[derive(Debug)]
pub struct RawSocket {
    sink: SocketSink,
    stream: SocketStream,
}

/// The far side of a [`RawSocket::pipe`]: sees the commands, injects events.
#[derive(Debug)]
pub struct SocketPeer {
    pub commands: mpsc::UnboundedReceiver<SocketCommand>,
    pub events: mpsc::UnboundedSender<SocketEvent>,
}

impl SocketPeer {
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.events.send(SocketEvent::Text(text.into()));
    }

    pub fn close(&self) {
        let _ = self.events.send(SocketEvent::Closed);
    }

    /// Next command that is not a keep-alive pong.
    pub async fn next_command(&mut self) -> Option<SocketCommand> {
        loop {
            match self.commands.recv().await? {
                SocketCommand::Pong(_) => continue,
                cmd => return Some(cmd),
            }
        }
    }
}

impl RawSocket {
    pub fn split(self) -> (SocketSink, SocketStream) {
        (self.sink, self.stream)
    }

    /// A socket whose other end is driven by hand.
    pub fn pipe() -> (Self, SocketPeer) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        (
            Self {
                sink: SocketSink { tx: cmd_tx },
                stream: SocketStream { rx: evt_rx },
            },
            SocketPeer {
                commands: cmd_rx,
                events: evt_tx,
            },
        )
    }

    /// Two sockets connected to each other in memory.
    pub fn pair() -> (Self, Self) {
        let (a, peer_a) = Self::pipe();
        let (b, peer_b) = Self::pipe();
        tokio::spawn(relay(peer_a.commands, peer_b.events.clone(), peer_a.events.clone()));
        tokio::spawn(relay(peer_b.commands, peer_a.events, peer_b.events));
        (a, b)
    }

    pub fn from_tungstenite<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        use tokio_tungstenite::tungstenite::Message;

        let (write, read) = ws.split();
        spawn_pump(
            write,
            read,
            |cmd| match cmd {
                SocketCommand::Text(t) => Some(Message::Text(t.into())),
                SocketCommand::Ping => Some(Message::Ping(Vec::new().into())),
                SocketCommand::Pong(p) => Some(Message::Pong(p.into())),
                SocketCommand::Close => Some(Message::Close(None)),
                SocketCommand::Terminate => None,
            },
            |msg| match msg {
                Message::Text(t) => Inbound::Event(SocketEvent::Text(t.to_string())),
                Message::Binary(b) => match String::from_utf8(b.to_vec()) {
                    Ok(text) => Inbound::Event(SocketEvent::Text(text)),
                    Err(_) => Inbound::Skip,
                },
                Message::Ping(p) => Inbound::Event(SocketEvent::Ping(p.to_vec())),
                Message::Close(_) => Inbound::Closed,
                _ => Inbound::Skip,
            },
        )
    }

    pub fn from_axum(ws: axum::extract::ws::WebSocket) -> Self {
        use axum::extract::ws::Message;

        let (write, read) = ws.split();
        spawn_pump(
            write,
            read,
            |cmd| match cmd {
                SocketCommand::Text(t) => Some(Message::Text(t.into())),
                SocketCommand::Ping => Some(Message::Ping(Vec::new().into())),
                SocketCommand::Pong(p) => Some(Message::Pong(p.into())),
                SocketCommand::Close => Some(Message::Close(None)),
                SocketCommand::Terminate => None,
            },
            |msg| match msg {
                Message::Text(t) => Inbound::Event(SocketEvent::Text(t.to_string())),
                Message::Binary(b) => match String::from_utf8(b.to_vec()) {
                    Ok(text) => Inbound::Event(SocketEvent::Text(text)),
                    Err(_) => Inbound::Skip,
                },
                Message::Ping(p) => Inbound::Event(SocketEvent::Ping(p.to_vec())),
                Message::Close(_) => Inbound::Closed,
                Message::Pong(_) => Inbound::Skip,
            },
        )
    }
}

enum Inbound {
    Event(SocketEvent),
    Skip,
    Closed,
}

/// Drive a split websocket from the command channel until either side ends.
fn spawn_pump<W, R, M, E>(
    mut write: W,
    mut read: R,
    encode: fn(SocketCommand) -> Option<M>,
    decode: fn(M) -> Inbound,
) -> RawSocket
where
    W: Sink<M> + Unpin + Send + 'static,
    R: Stream<Item = Result<M, E>> + Unpin + Send + 'static,
    M: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<SocketCommand>();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(frame) = cmd.and_then(encode) else { break };
                    if write.send(frame).await.is_err() {
                        break;
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(msg)) => match decode(msg) {
                            Inbound::Event(event) => {
                                let _ = evt_tx.send(event);
                            }
                            Inbound::Skip => {}
                            Inbound::Closed => break,
                        },
                        Some(Err(e)) => {
                            tracing::debug!("Websocket error: {e}");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = evt_tx.send(SocketEvent::Closed);
    });

    RawSocket {
        sink: SocketSink { tx: cmd_tx },
        stream: SocketStream { rx: evt_rx },
    }
}

async fn relay(
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    remote: mpsc::UnboundedSender<SocketEvent>,
    local: mpsc::UnboundedSender<SocketEvent>,
) {
    while let Some(cmd) = commands.recv().await {
        let delivered = match cmd {
            SocketCommand::Text(t) => remote.send(SocketEvent::Text(t)).is_ok(),
            SocketCommand::Ping => remote.send(SocketEvent::Ping(Vec::new())).is_ok(),
            SocketCommand::Pong(_) => true,
            SocketCommand::Close | SocketCommand::Terminate => false,
        };
        if !delivered {
            break;
        }
    }
    let _ = remote.send(SocketEvent::Closed);
    let _ = local.send(SocketEvent::Closed);
}
