//! WebSocket read pump: forwards inbound text frames to the driver.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use poolflow_protocol::constants::{WS_MAX_MESSAGE_SIZE, is_auth_close_code};

use crate::machine::Input;

/// Reads messages from the WebSocket until it closes, stays silent for
/// `read_timeout` or is cancelled.
///
/// Text frames are tagged with `generation` and queued for the driver. When
/// the socket ends on its own a single [`Input::Closed`] is sent; a cancelled
/// pump exits quietly since the driver already knows.
pub(crate) async fn read_pump<S>(
    mut read: S,
    generation: u64,
    read_timeout: Duration,
    inputs: mpsc::UnboundedSender<Input>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    // Any inbound message, pongs included, pushes the deadline back.
    let deadline = tokio::time::sleep(read_timeout);
    tokio::pin!(deadline);

    let mut unauthorized = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            () = &mut deadline => {
                warn!(generation, "no message within read timeout, connection dead");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + read_timeout);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                forward_text(&text, generation, &inputs);
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(frame) => {
                                if let Some(ref f) = frame {
                                    let code = u16::from(f.code);
                                    if is_auth_close_code(code) {
                                        debug!(code, "server closed the connection over credentials");
                                        unauthorized = true;
                                    }
                                }
                                debug!(generation, "received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!(generation, "WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!(generation, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    let _ = inputs.send(Input::Closed {
        generation,
        unauthorized,
    });
}

fn forward_text(text: &str, generation: u64, inputs: &mpsc::UnboundedSender<Input>) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }
    trace!(generation, len = text.len(), "received text frame");
    let _ = inputs.send(Input::Frame {
        generation,
        text: text.to_string(),
    });
}
