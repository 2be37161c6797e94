//! WebSocket transport
//!
//! Client side of the terminal's socket bridge. Establishment performs the
//! `PING` handshake under a hard deadline; the running connection drives a
//! heartbeat timer, forwards commands from the manager, and routes every
//! incoming frame through the normalizer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::StatusHandle;
use crate::normalize::{normalize_message, parse_feed_message, NormalizedRecord};
use crate::types::Command;

/// Why a running connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Caller-initiated shutdown; do not reconnect
    Graceful,
    /// Heartbeat went unanswered for a full period
    Degraded,
    /// Transport error or server-side close
    Error(String),
}

/// An established, handshaken connection to the terminal
pub struct SocketConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SocketConnection {
    /// Connect and complete the `PING` handshake within `timeout`.
    /// A connection that cannot produce any reply in time is abandoned.
    pub async fn establish(url: &str, timeout: Duration) -> Result<Self> {
        tokio::time::timeout(timeout, Self::handshake(url))
            .await
            .map_err(|_| anyhow!("connection establishment timed out after {:?}", timeout))?
    }

    async fn handshake(url: &str) -> Result<Self> {
        let (mut ws, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to open websocket to {}", url))?;

        let ping = serde_json::to_string(&Command::new("PING"))?;
        ws.send(Message::Text(ping))
            .await
            .context("failed to send handshake ping")?;

        // Any well-formed reply completes the handshake; the terminal may
        // push data frames before it answers the ping.
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(_))) => return Ok(Self { ws }),
                Some(Ok(Message::Ping(payload))) => {
                    ws.send(Message::Pong(payload))
                        .await
                        .context("failed to answer websocket ping")?;
                }
                Some(Ok(Message::Close(_))) => bail!("server closed during handshake"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e).context("websocket error during handshake"),
                None => bail!("socket closed during handshake"),
            }
        }
    }

    /// Drive the connection until it closes. Incoming frames go through
    /// the normalizer to the dispatcher; `commands` carries subscription
    /// and snapshot requests from the manager. Dropping the command sender
    /// is the graceful shutdown path.
    pub async fn run(
        self,
        status: Arc<StatusHandle>,
        mut commands: mpsc::Receiver<Command>,
        heartbeat: Duration,
    ) -> CloseReason {
        let (mut sink, mut stream) = self.ws.split();
        let mut timer = tokio::time::interval(heartbeat);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if awaiting_pong {
                        warn!("heartbeat went unanswered for a full period");
                        return CloseReason::Degraded;
                    }
                    match send_json(&mut sink, &Command::new("PING")).await {
                        Ok(()) => awaiting_pong = true,
                        Err(e) => return CloseReason::Error(format!("heartbeat send failed: {}", e)),
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(e) = send_json(&mut sink, &cmd).await {
                            return CloseReason::Error(format!("command send failed: {}", e));
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        return CloseReason::Graceful;
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if route_frame(&text, &status) {
                            awaiting_pong = false;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return CloseReason::Error("failed to answer websocket ping".into());
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        return CloseReason::Error("server closed the connection".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return CloseReason::Error(e.to_string()),
                    None => return CloseReason::Error("socket stream ended".into()),
                },
            }

            if !status.is_alive() {
                let _ = sink.close().await;
                return CloseReason::Graceful;
            }
        }
    }
}

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

async fn send_json(sink: &mut WsSink, command: &Command) -> Result<()> {
    let json = serde_json::to_string(command)?;
    sink.send(Message::Text(json))
        .await
        .with_context(|| format!("failed to send {}", command.command))?;
    Ok(())
}

/// Decode one text frame and hand it to the dispatcher. Returns true when
/// the frame was a heartbeat reply. Malformed frames are dropped.
fn route_frame(text: &str, status: &StatusHandle) -> bool {
    let Some(msg) = parse_feed_message(text) else {
        debug!("dropping unparseable socket frame");
        return false;
    };
    match normalize_message(msg) {
        Some(NormalizedRecord::Pong) => true,
        Some(record) => {
            status.publish_record(record);
            false
        }
        None => {
            debug!("dropping socket frame that failed validation");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::types::{Event, EventKind, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Minimal stand-in for the terminal: answers PING with PONG and
    /// pushes one tick after the handshake.
    async fn spawn_terminal_stub() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };
                    while let Some(Ok(frame)) = ws.next().await {
                        if let Message::Text(text) = frame {
                            if text.contains("PING") {
                                let _ = ws.send(Message::Text(r#"{"type":"PONG"}"#.into())).await;
                                let tick = r#"{"type":"TICK","data":{"symbol":"EURUSD","time":1700000000,"bid":1.08,"ask":1.081,"last":1.0805,"volume":5,"flags":0}}"#;
                                let _ = ws.send(Message::Text(tick.into())).await;
                            }
                        }
                    }
                });
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_establish_completes_handshake() {
        let url = spawn_terminal_stub().await;
        let conn = SocketConnection::establish(&url, Duration::from_secs(5)).await;
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_establish_times_out_without_server() {
        // TEST-NET address: nothing listens there.
        let result =
            SocketConnection::establish("ws://192.0.2.1:9", Duration::from_millis(200)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_routes_frames_and_closes_gracefully() {
        let url = spawn_terminal_stub().await;
        let dispatcher = Arc::new(Dispatcher::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        dispatcher.subscribe(EventKind::Tick, move |event| {
            if matches!(event, Event::Tick(_)) {
                ticks_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        let status = Arc::new(StatusHandle::new(dispatcher, TransportKind::Socket));

        let conn = SocketConnection::establish(&url, Duration::from_secs(5))
            .await
            .expect("stub reachable");
        let (tx, rx) = mpsc::channel(8);
        let run = tokio::spawn(conn.run(status, rx, Duration::from_secs(30)));

        // Ask for data, then hang up.
        tx.send(Command::new("PING")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(tx);

        let reason = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run loop ends")
            .expect("task not aborted");
        assert_eq!(reason, CloseReason::Graceful);
        assert!(ticks.load(Ordering::SeqCst) >= 1);
    }
}
