//! WebSocket write pump: serialises outbound messages.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Writes queued messages to the WebSocket.
///
/// Messages already queued are written before a cancellation is honoured,
/// so a `stop` frame followed by a close goes out in order. The pump ends
/// after writing a close frame.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            msg = write_rx.recv() => {
                match msg {
                    Some(m) => {
                        let closing = matches!(m, tungstenite::Message::Close(_));
                        if let Err(e) = write.send(m).await {
                            error!("WebSocket write error: {e}");
                            break;
                        }
                        if closing {
                            debug!("close frame written");
                            return;
                        }
                    }
                    None => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}
