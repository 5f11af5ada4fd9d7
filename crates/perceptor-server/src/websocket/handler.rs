//! Socket lifecycle: accept, configure, register, run the message loop, and
//! tear down exactly once.

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::connection::{Connection, Outbound, OutboundFrame, SendError};
use super::engine::ProtocolEngine;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::registry::ConnectionRegistry;
use crate::distributor::ConfigDistributor;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};

/// How long teardown waits for an in-flight write before abandoning the writer.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Keep-alive timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatTiming {
    /// Ping interval.
    pub interval: Duration,
    /// Silence tolerated before the connection is dropped.
    pub timeout: Duration,
}

/// Everything a connection needs from the server.
#[derive(Clone)]
pub struct SocketContext {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Session configuration sender.
    pub distributor: Arc<ConfigDistributor>,
    /// Where uploads land.
    pub upload_dir: PathBuf,
    /// `None` disables keep-alive.
    pub heartbeat: Option<HeartbeatTiming>,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Bound on a single socket write.
    pub write_timeout: Duration,
    /// Server-wide shutdown signal.
    pub shutdown: CancellationToken,
}

/// Drive one upgraded socket until it ends.
pub async fn handle_socket(socket: WebSocket, ctx: SocketContext) {
    let id = ctx.registry.fresh_id();
    let span = info_span!("connection", conn_id = %id);
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(ctx.send_queue_capacity.max(1));
    let connection = Arc::new(Connection::new(id, tx));

    async move {
        let mut writer = tokio::spawn(run_writer(sink, rx, ctx.write_timeout).in_current_span());

        if let Err(err) = ctx.distributor.send(&connection).await {
            warn!(error = %err, "failed to deliver session configuration, dropping connection");
            connection.close().await;
            return;
        }
        if let Err(err) = ctx.registry.put(Arc::clone(&connection)) {
            error!(error = %err, "dropping connection");
            connection.close().await;
            return;
        }
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        info!(live = ctx.registry.len(), "device connected");

        let teardown = Teardown {
            connection: Arc::clone(&connection),
            registry: Arc::clone(&ctx.registry),
            done: false,
        };
        let mut engine = ProtocolEngine::new(Arc::clone(&connection), ctx.upload_dir.clone());
        let reason = message_loop(stream, &connection, &mut engine, &mut writer, &ctx).await;
        info!(reason, "device disconnected");
        teardown.run(&mut engine, writer).await;
    }
    .instrument(span)
    .await;
}

async fn message_loop(
    mut stream: futures::stream::SplitStream<WebSocket>,
    connection: &Arc<Connection>,
    engine: &mut ProtocolEngine,
    writer: &mut JoinHandle<()>,
    ctx: &SocketContext,
) -> &'static str {
    let heartbeat_cancel = ctx.shutdown.child_token();
    let mut heartbeat = ctx.heartbeat.map(|timing| {
        tokio::spawn(
            run_heartbeat(
                Arc::clone(connection),
                timing.interval,
                timing.timeout,
                heartbeat_cancel.clone(),
            )
            .in_current_span(),
        )
    });

    let reason = loop {
        tokio::select! {
            frame = stream.next() => {
                let Some(frame) = frame else {
                    break "peer disconnected";
                };
                let message = match frame {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(error = %err, "transport error");
                        continue;
                    }
                };
                connection.mark_alive();

                let reply = match message {
                    Message::Text(text) => engine.handle_text(text.as_str()).await,
                    Message::Binary(payload) => Some(engine.handle_binary(&payload).await),
                    Message::Ping(_) | Message::Pong(_) => None,
                    Message::Close(_) => break "peer closed",
                };
                let Some(reply) = reply else {
                    continue;
                };
                tokio::select! {
                    sent = connection.send_json(&reply) => {
                        if let Err(err) = sent {
                            warn!(error = %err, "reply undeliverable");
                            break "reply undeliverable";
                        }
                    }
                    () = ctx.shutdown.cancelled() => break "server shutdown",
                }
            }
            _ = &mut *writer => break "socket write failed",
            result = heartbeat_outcome(&mut heartbeat) => {
                break match result {
                    HeartbeatResult::TimedOut => "keep-alive timeout",
                    HeartbeatResult::Disconnected => "peer disconnected",
                    HeartbeatResult::Cancelled => "server shutdown",
                };
            }
            () = ctx.shutdown.cancelled() => break "server shutdown",
        }
    };

    heartbeat_cancel.cancel();
    if let Some(handle) = heartbeat {
        handle.abort();
    }
    reason
}

async fn heartbeat_outcome(handle: &mut Option<JoinHandle<HeartbeatResult>>) -> HeartbeatResult {
    match handle {
        Some(handle) => handle.await.unwrap_or(HeartbeatResult::Cancelled),
        None => std::future::pending().await,
    }
}

/// The only task that touches the socket sink. Acknowledges every write and
/// stops at the first failure, at the first write that outlasts
/// `write_timeout`, or once the connection drops its sender.
async fn run_writer<S>(mut sink: S, mut rx: mpsc::Receiver<Outbound>, write_timeout: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(Outbound { frame, ack }) = rx.recv().await {
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text.into()),
            OutboundFrame::Ping => Message::Ping(Bytes::new()),
        };
        let result = match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SendError::Transport(err.to_string())),
            Err(_) => Err(SendError::Transport(format!(
                "write stalled for {write_timeout:?}"
            ))),
        };
        let failed = result.is_err();
        let _ = ack.send(result);
        if failed {
            debug!("socket write failed, writer exiting");
            return;
        }
    }
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

/// Disconnect cleanup. `run` is the normal path; `Drop` covers a cancelled
/// connection task so the registry never keeps a dead entry.
struct Teardown {
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    done: bool,
}

impl Teardown {
    async fn run(mut self, engine: &mut ProtocolEngine, writer: JoinHandle<()>) {
        engine.finish();
        if tokio::time::timeout(CLOSE_GRACE, self.connection.close()).await.is_err() {
            // Dropping the writer fails every pending write, releasing the lock.
            warn!("socket write still pending at disconnect, abandoning writer");
            writer.abort();
            self.connection.close().await;
        }
        self.unregister();
    }

    fn unregister(&mut self) {
        if std::mem::replace(&mut self.done, true) {
            return;
        }
        if self.registry.remove(&self.connection.id).is_some() {
            counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if !self.done {
            self.connection.close_now();
            self.unregister();
        }
    }
}
