//! One WebSocket connection generation.
//!
//! Opening the socket spawns a read, a write and a ping pump. Inbound text
//! is forwarded to the driver tagged with the connection's generation.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use poolflow_protocol::OutboundFrame;
use poolflow_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::error::TransportError;
use crate::machine::Input;
use crate::types::KeepaliveConfig;

/// How long [`WsClient::close`] waits for queued frames to be written.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// An open WebSocket with its pumps.
///
/// Dropping the client aborts all pumps.
pub(crate) struct WsClient {
    generation: u64,
    write_tx: mpsc::Sender<tungstenite::Message>,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
    ping_handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl WsClient {
    /// Opens `url` with the given upgrade headers and starts the pumps.
    pub(crate) async fn connect(
        url: &str,
        headers: &BTreeMap<String, String>,
        subprotocol: Option<&str>,
        keepalive: &KeepaliveConfig,
        generation: u64,
        inputs: mpsc::UnboundedSender<Input>,
    ) -> Result<Self, TransportError> {
        let mut request = url.into_client_request()?;
        let request_headers = request.headers_mut();
        if let Some(protocol) = subprotocol {
            let value = HeaderValue::from_str(protocol)
                .map_err(|_| TransportError::InvalidHeader(SEC_WEBSOCKET_PROTOCOL.to_string()))?;
            request_headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
            request_headers.insert(header_name, header_value);
        }

        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false).await?;
        debug!(generation, url, "WebSocket opened");
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let cancel = CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::read::read_pump(
                read,
                generation,
                keepalive.read_timeout,
                inputs,
                write_tx,
                cancel,
            ))
        };

        let ping_handle = {
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::ping::ping_pump(
                generation,
                keepalive.ping_interval,
                write_tx,
                cancel,
            ))
        };

        Ok(Self {
            generation,
            write_tx,
            read_handle,
            write_handle,
            ping_handle,
            cancel,
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn read_task(&self) -> tokio::task::AbortHandle {
        self.read_handle.abort_handle()
    }

    /// Queues a protocol frame for writing.
    pub(crate) async fn send_frame(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let json = frame.encode()?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Flushes queued frames, sends a close frame and stops the pumps.
    ///
    /// The read pump has exited when this returns.
    pub(crate) async fn close(mut self) {
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
        if tokio::time::timeout(CLOSE_GRACE, &mut self.write_handle)
            .await
            .is_err()
        {
            warn!(generation = self.generation, "close frame not flushed in time");
        }
        self.cancel.cancel();
        let _ = (&mut self.read_handle).await;
        debug!(generation = self.generation, "WebSocket closed");
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.ping_handle.abort();
    }
}
