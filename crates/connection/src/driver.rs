//! Single-owner event loop that runs the state machine.
//!
//! Every input (owner calls, socket pumps, the reconnect timer) arrives on
//! one channel and is applied to the [`Machine`] in order, so no two
//! transitions ever race. The loop executes the resulting commands:
//! fetching tokens, opening and closing sockets, writing frames and
//! arming the reconnect timer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use poolflow_telemetry::TelemetryExtractor;

use crate::error::AuthError;
use crate::machine::{Command, Input, Machine};
use crate::token::TokenProvider;
use crate::types::{ConnectionEvent, ConnectionState, KeepaliveConfig};
use crate::ws_client::WsClient;

pub(crate) struct Driver {
    pub(crate) machine: Machine,
    pub(crate) url: String,
    pub(crate) subprotocol: Option<String>,
    pub(crate) keepalive: KeepaliveConfig,
    pub(crate) tokens: Arc<dyn TokenProvider>,
    pub(crate) extractor: Arc<TelemetryExtractor>,
    pub(crate) inputs_tx: mpsc::UnboundedSender<Input>,
    pub(crate) inputs_rx: mpsc::UnboundedReceiver<Input>,
    pub(crate) events_tx: mpsc::Sender<ConnectionEvent>,
    pub(crate) state_tx: Arc<watch::Sender<ConnectionState>>,
    pub(crate) auth_tx: Arc<watch::Sender<Option<AuthError>>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) client: Option<WsClient>,
    pub(crate) reconnect_cancel: Option<CancellationToken>,
}

impl Driver {
    /// Runs until the cancellation token fires, then stops the machine.
    pub(crate) async fn run(mut self) {
        self.dispatch(Input::Start).await;

        loop {
            let input = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                input = self.inputs_rx.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            self.dispatch(input).await;
        }

        self.shutdown().await;
    }

    /// Applies `input` and every follow-up input its commands produce.
    async fn dispatch(&mut self, input: Input) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                return;
            }
            for command in self.machine.handle(input) {
                if let Some(next) = self.execute(command).await {
                    queue.push_back(next);
                }
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Option<Input> {
        match command {
            Command::AcquireToken { refresh } => {
                if refresh {
                    debug!("invalidating rejected token");
                    self.tokens.invalidate();
                }
                let tokens = self.tokens.clone();
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    result = tokens.get_token() => Some(match result {
                        Ok(token) => Input::TokenReady(token),
                        Err(e) => Input::TokenFailed(e),
                    }),
                }
            }
            Command::Open {
                generation,
                headers,
            } => {
                if let Some(old) = self.client.take() {
                    old.close().await;
                }
                let connect = WsClient::connect(
                    &self.url,
                    &headers,
                    self.subprotocol.as_deref(),
                    &self.keepalive,
                    generation,
                    self.inputs_tx.clone(),
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    result = connect => match result {
                        Ok(client) => {
                            self.client = Some(client);
                            Some(Input::Opened { generation })
                        }
                        Err(e) => {
                            warn!(generation, error = %e, "failed to open WebSocket");
                            Some(Input::OpenFailed {
                                generation,
                                unauthorized: e.is_unauthorized(),
                            })
                        }
                    },
                }
            }
            Command::Send { generation, frame } => {
                let Some(client) = self.client.as_ref().filter(|c| c.generation() == generation)
                else {
                    debug!(generation, "no socket for frame, dropped");
                    return None;
                };
                match client.send_frame(&frame).await {
                    Ok(()) => {
                        trace!(generation, id = ?frame.subscription_id(), "frame queued");
                        None
                    }
                    Err(e) => {
                        warn!(generation, error = %e, "failed to send frame");
                        Some(Input::Closed {
                            generation,
                            unauthorized: false,
                        })
                    }
                }
            }
            Command::Deliver(frame) => {
                self.extractor.on_data_frame(&frame);
                None
            }
            Command::Close { generation } => {
                if self.client.as_ref().is_some_and(|c| c.generation() == generation)
                    && let Some(client) = self.client.take()
                {
                    client.close().await;
                }
                None
            }
            Command::ScheduleReconnect(delay) => {
                self.cancel_reconnect();
                let token = self.cancel.child_token();
                self.reconnect_cancel = Some(token.clone());
                tokio::spawn(reconnect_timer(delay, self.inputs_tx.clone(), token));
                None
            }
            Command::CancelReconnect => {
                self.cancel_reconnect();
                None
            }
            Command::Emit(event) => {
                self.emit(event);
                None
            }
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(token) = self.reconnect_cancel.take() {
            token.cancel();
        }
    }

    /// Publishes `event` to the owner.
    ///
    /// The event queue is best effort. State and auth failures are also
    /// mirrored into watch channels, which always hold the latest value.
    fn emit(&self, event: ConnectionEvent) {
        match &event {
            ConnectionEvent::StateChanged(state) => {
                if *state == ConnectionState::Ready {
                    self.auth_tx.send_if_modified(|last| last.take().is_some());
                }
                self.state_tx.send_replace(state.clone());
            }
            ConnectionEvent::AuthFailed(err) => {
                self.auth_tx.send_replace(Some(err.clone()));
            }
            _ => {}
        }
        if let Err(e) = self.events_tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(ConnectionEvent::AuthFailed(_)) => {
                    warn!("event queue full, auth failure only visible through watch_auth_error");
                }
                e => trace!("connection event not delivered: {e}"),
            }
        }
    }

    /// Stops the machine and releases the socket.
    ///
    /// Only the stop-path commands run here: the stop frame, the close and
    /// the final state change. Nothing that could reconnect is executed.
    async fn shutdown(&mut self) {
        for command in self.machine.handle(Input::Stop) {
            match command {
                Command::Send { generation, frame } => {
                    if let Some(client) = self.client.as_ref().filter(|c| c.generation() == generation)
                        && let Err(e) = client.send_frame(&frame).await
                    {
                        debug!(error = %e, "stop frame not sent");
                    }
                }
                Command::Close { .. } => {
                    if let Some(client) = self.client.take() {
                        client.close().await;
                    }
                }
                Command::CancelReconnect => self.cancel_reconnect(),
                Command::Emit(event) => self.emit(event),
                other => trace!(?other, "command skipped during shutdown"),
            }
        }

        // Covers stops that arrive before the machine ever opened a socket.
        self.cancel_reconnect();
        if let Some(client) = self.client.take() {
            client.close().await;
        }
        self.state_tx.send_replace(ConnectionState::Closing);
        debug!(state = ?self.machine.state(), "connection driver stopped");
    }
}

/// Waits `delay` and then asks the driver to reconnect, unless cancelled.
async fn reconnect_timer(
    delay: Duration,
    inputs: mpsc::UnboundedSender<Input>,
    cancel: CancellationToken,
) {
    debug!(delay_secs = delay.as_secs_f64(), "reconnect scheduled");
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("reconnect cancelled");
        }
        _ = tokio::time::sleep(delay) => {
            let _ = inputs.send(Input::ReconnectDue);
        }
    }
}
