//! Keepalive pings for one connection generation.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Queues a ping every `interval` so a quiet subscription keeps pushing the
/// read deadline back with the server's pongs.
///
/// Pings never wait behind queued frames: if the write queue is full the
/// tick is skipped. The pump ends on cancellation or once the writer is gone.
pub(crate) async fn ping_pump(
    generation: u64,
    interval: Duration,
    write_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticks.tick() => {}
        }

        match write_tx.try_send(Message::Ping(Vec::new().into())) {
            Ok(()) => trace!(generation, "keepalive ping queued"),
            Err(TrySendError::Full(_)) => trace!(generation, "write queue busy, ping skipped"),
            Err(TrySendError::Closed(_)) => {
                debug!(generation, "writer gone, keepalive stopped");
                return;
            }
        }
    }
}
