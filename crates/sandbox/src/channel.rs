//! Line-delimited JSON RPC channel between the relay and one agent.
//!
//! A channel wraps one of three transports: the stdio of a child process,
//! a bidirectional WebSocket, or an in-memory pair (mock provider, tests).
//! Each transport runs pump tasks feeding two bounded queues; `send` and
//! `receive` only ever touch the queues, so the calling code is identical
//! across transports.
//!
//! Sends are atomic with respect to each other (one writer pump per
//! channel) and apply backpressure by suspending when the outbound queue is
//! full. A line that fails JSON parsing is surfaced as `Inbound::ParseError`
//! and does not close the channel. `close` is idempotent; once the channel
//! is closed, `send` fails and `receive` drains then returns `None`.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use ar_domain::error::{Error, Result};

use crate::log_ring::LogRing;

const OUTBOUND_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;

/// One item received from the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Value),
    /// The raw line that failed to parse.
    ParseError { line: String },
}

/// Handle to the agent side of an in-memory channel pair.
pub struct AgentEnd {
    /// Commands the relay sent.
    pub commands: mpsc::Receiver<Value>,
    /// Events the agent emits.
    pub events: mpsc::Sender<Inbound>,
}

/// Bidirectional line-delimited JSON channel. Cheap to clone; clones share
/// the same underlying transport.
#[derive(Clone)]
pub struct SandboxChannel {
    outbound_tx: mpsc::Sender<Value>,
    inbound_rx: std::sync::Arc<Mutex<mpsc::Receiver<Inbound>>>,
    shutdown: CancellationToken,
}

impl SandboxChannel {
    /// Serialize `msg` as one newline-terminated JSON line and queue it for
    /// the writer pump. Suspends while the queue is full.
    pub async fn send(&self, msg: &Value) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ChannelClosed);
        }
        self.outbound_tx
            .send(msg.clone())
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Next inbound item. `None` means end of stream: the transport closed
    /// or `close` was called. Terminal.
    pub async fn receive(&self) -> Option<Inbound> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            item = rx.recv() => item,
            _ = self.shutdown.cancelled() => {
                // Drain what the pumps already queued, then report EOF.
                rx.try_recv().ok()
            }
        }
    }

    /// Initiate graceful shutdown of the transport. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ── Child process transport ──────────────────────────────────────

    /// Channel over a child's stdio. stdout carries the JSON lines; stderr
    /// is drained into the session's log ring.
    pub fn from_child(mut child: Child, ring: LogRing) -> Result<Self> {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Channel("child stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Channel("child stdout not piped".into()))?;
        let stderr = child.stderr.take();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(INBOUND_CAPACITY);
        let shutdown = CancellationToken::new();

        // Writer pump: single writer keeps lines atomic.
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    msg = outbound_rx.recv() => match msg {
                        Some(m) => m,
                        None => break,
                    },
                };
                let mut line = msg.to_string();
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            // Dropping stdin signals EOF to the agent.
        });

        // Reader pump: partial lines at close are discarded by next_line.
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(l)) => l,
                        Ok(None) | Err(_) => break,
                    },
                };
                if inbound_tx.send(parse_line(line)).await.is_err() {
                    break;
                }
            }
        });

        // Stderr pump into the log ring.
        if let Some(stderr) = stderr {
            let ring = ring.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "sandbox_stderr", "{line}");
                    ring.push(line);
                }
            });
        }

        // Supervisor: kill the child when the channel closes, reap it.
        let child_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = child_shutdown.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                status = child.wait() => {
                    tracing::debug!(status = ?status.ok(), "sandbox channel child exited");
                }
            }
        });

        Ok(Self {
            outbound_tx,
            inbound_rx: std::sync::Arc::new(Mutex::new(inbound_rx)),
            shutdown,
        })
    }

    // ── WebSocket transport ──────────────────────────────────────────

    /// Channel over an already-connected WebSocket (remote provider).
    pub fn from_websocket(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        let (mut sink, mut stream) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(INBOUND_CAPACITY);
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    msg = outbound_rx.recv() => match msg {
                        Some(m) => m,
                        None => break,
                    },
                };
                if sink.send(Message::Text(msg.to_string())).await.is_err() {
                    break;
                }
            }
        });

        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    msg = stream.next() => match msg {
                        Some(Ok(m)) => m,
                        Some(Err(_)) | None => break,
                    },
                };
                match msg {
                    Message::Text(text) => {
                        // One WS text frame may carry several lines.
                        for line in text.lines().filter(|l| !l.trim().is_empty()) {
                            if inbound_tx.send(parse_line(line.to_string())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        Self {
            outbound_tx,
            inbound_rx: std::sync::Arc::new(Mutex::new(inbound_rx)),
            shutdown,
        }
    }

    // ── In-memory transport ──────────────────────────────────────────

    /// In-memory queue pair for the mock provider and tests. The returned
    /// [`AgentEnd`] is the agent's side.
    pub fn pair() -> (Self, AgentEnd) {
        let (outbound_tx, commands) = mpsc::channel::<Value>(OUTBOUND_CAPACITY);
        let (events, inbound_rx) = mpsc::channel::<Inbound>(INBOUND_CAPACITY);
        let channel = Self {
            outbound_tx,
            inbound_rx: std::sync::Arc::new(Mutex::new(inbound_rx)),
            shutdown: CancellationToken::new(),
        };
        (channel, AgentEnd { commands, events })
    }
}

fn parse_line(line: String) -> Inbound {
    match serde_json::from_str::<Value>(&line) {
        Ok(value) if value.is_object() => Inbound::Message(value),
        _ => {
            tracing::warn!(line = %truncate(&line, 200), "unparseable agent line");
            Inbound::ParseError { line }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pair_round_trip() {
        let (channel, mut agent) = SandboxChannel::pair();

        channel.send(&json!({"type": "prompt", "message": "hi"})).await.unwrap();
        let cmd = agent.commands.recv().await.unwrap();
        assert_eq!(cmd["type"], "prompt");

        agent
            .events
            .send(Inbound::Message(json!({"type": "agent_end"})))
            .await
            .unwrap();
        match channel.receive().await.unwrap() {
            Inbound::Message(v) => assert_eq!(v["type"], "agent_end"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let (channel, _agent) = SandboxChannel::pair();
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert!(matches!(
            channel.send(&json!({"type": "x"})).await,
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn receive_none_after_agent_hangs_up() {
        let (channel, agent) = SandboxChannel::pair();
        drop(agent.events);
        assert!(channel.receive().await.is_none());
    }

    #[tokio::test]
    async fn child_transport_round_trip() {
        // `cat` echoes our lines back verbatim.
        let mut cmd = tokio::process::Command::new("cat");
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let child = cmd.spawn().unwrap();
        let channel = SandboxChannel::from_child(child, LogRing::new(10)).unwrap();

        channel.send(&json!({"type": "ping", "n": 1})).await.unwrap();
        match channel.receive().await.unwrap() {
            Inbound::Message(v) => {
                assert_eq!(v["type"], "ping");
                assert_eq!(v["n"], 1);
            }
            other => panic!("expected message, got {other:?}"),
        }
        channel.close();
    }

    #[tokio::test]
    async fn parse_error_does_not_close_channel() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg("echo 'not json'; echo '{\"type\":\"ok\"}'")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let child = cmd.spawn().unwrap();
        let channel = SandboxChannel::from_child(child, LogRing::new(10)).unwrap();

        assert!(matches!(
            channel.receive().await.unwrap(),
            Inbound::ParseError { .. }
        ));
        match channel.receive().await.unwrap() {
            Inbound::Message(v) => assert_eq!(v["type"], "ok"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stderr_lands_in_log_ring() {
        let ring = LogRing::new(10);
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg("echo 'boot noise' >&2")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let child = cmd.spawn().unwrap();
        let channel = SandboxChannel::from_child(child, ring.clone()).unwrap();

        // stdout EOF means the process (and its stderr pump) finished.
        assert!(channel.receive().await.is_none());
        // The stderr pump races stdout EOF by a hair; poll briefly.
        for _ in 0..50 {
            if !ring.snapshot().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(ring.snapshot(), vec!["boot noise".to_string()]);
    }
}
