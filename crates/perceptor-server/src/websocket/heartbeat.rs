//! Keep-alive ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::connection::Connection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The device stopped responding within the timeout window.
    TimedOut,
    /// The ping could not be written; the connection is going away.
    Disconnected,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Run keep-alive pings for a connection.
///
/// At each `interval` tick the alive flag is checked and reset, then a ping is
/// sent through the connection's write lock. A pong (or any inbound frame)
/// sets the flag again. Once `timeout / interval` consecutive ticks (at least
/// one) pass without activity, `HeartbeatResult::TimedOut` is returned.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = time::interval(interval);
    let mut missed_pongs: u32 = 0;
    let interval_ms = interval.as_millis().max(1);
    let max_missed = u32::try_from(timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .max(1);

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                if connection.check_alive() {
                    missed_pongs = 0;
                } else {
                    missed_pongs += 1;
                    if missed_pongs >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
                if connection.ping().await.is_err() {
                    return HeartbeatResult::Disconnected;
                }
                trace!(conn_id = %connection.id, "sent ping");
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
