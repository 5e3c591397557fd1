//! Pure connection state machine.
//!
//! Socket callbacks, timers and owner calls are turned into [`Input`]s; the
//! machine answers with [`Command`]s for the driver to execute. It never
//! touches a socket itself, so every transition is testable without I/O.
//!
//! Each opened socket gets a new generation number. Inputs tagged with an
//! older generation belong to a superseded connection and are dropped.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use poolflow_protocol::{InboundFrame, OutboundFrame, SubscriptionRequest};

use crate::error::AuthError;
use crate::subscription::{Routed, SubscriptionManager};
use crate::token::AuthToken;
use crate::types::{ClientIdentity, ConnectionEvent, ConnectionState, ReconnectConfig};

/// Something that happened.
#[derive(Debug)]
pub(crate) enum Input {
    Start,
    Stop,
    Register(SubscriptionRequest),
    TokenReady(AuthToken),
    TokenFailed(AuthError),
    Opened { generation: u64 },
    OpenFailed { generation: u64, unauthorized: bool },
    Frame { generation: u64, text: String },
    Closed { generation: u64, unauthorized: bool },
    ReconnectDue,
}

/// Something the driver must do.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    /// Fetch a token, invalidating the cached one first when `refresh`.
    AcquireToken { refresh: bool },
    Open {
        generation: u64,
        headers: BTreeMap<String, String>,
    },
    Send { generation: u64, frame: OutboundFrame },
    /// Hand a data frame to the telemetry extractor.
    Deliver(InboundFrame),
    Close { generation: u64 },
    ScheduleReconnect(Duration),
    CancelReconnect,
    Emit(ConnectionEvent),
}

pub(crate) struct Machine {
    state: ConnectionState,
    generation: u64,
    token: Option<AuthToken>,
    token_rejected: bool,
    awaiting_token: bool,
    reconnect_pending: bool,
    attempt: u32,
    identity: ClientIdentity,
    reconnect: ReconnectConfig,
    subscription: SubscriptionManager,
}

impl Machine {
    pub(crate) fn new(
        identity: ClientIdentity,
        reconnect: ReconnectConfig,
        subscription: SubscriptionManager,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            token: None,
            token_rejected: false,
            awaiting_token: false,
            reconnect_pending: false,
            attempt: 0,
            identity,
            reconnect,
            subscription,
        }
    }

    pub(crate) fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Applies one input and returns the resulting commands in order.
    pub(crate) fn handle(&mut self, input: Input) -> Vec<Command> {
        let mut cmds = Vec::new();
        if self.state == ConnectionState::Closing {
            trace!(?input, "closing, input ignored");
            return cmds;
        }

        match input {
            Input::Start => self.on_start(&mut cmds),
            Input::Stop => self.on_stop(&mut cmds),
            Input::Register(request) => self.on_register(request, &mut cmds),
            Input::TokenReady(token) => self.on_token(token, &mut cmds),
            Input::TokenFailed(err) => self.on_token_failed(err, &mut cmds),
            Input::Opened { generation } => self.on_opened(generation, &mut cmds),
            Input::OpenFailed {
                generation,
                unauthorized,
            } => {
                if self.is_current(generation) && self.state == ConnectionState::Connecting {
                    self.connection_lost(unauthorized, &mut cmds);
                }
            }
            Input::Frame { generation, text } => self.on_frame(generation, &text, &mut cmds),
            Input::Closed {
                generation,
                unauthorized,
            } => {
                let connected = matches!(
                    self.state,
                    ConnectionState::AwaitingAck | ConnectionState::Ready
                );
                if self.is_current(generation) && connected {
                    cmds.push(Command::Close { generation });
                    self.connection_lost(unauthorized, &mut cmds);
                } else {
                    trace!(generation, "close of superseded connection ignored");
                }
            }
            Input::ReconnectDue => self.on_reconnect_due(&mut cmds),
        }
        cmds
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    fn transition(&mut self, next: ConnectionState, cmds: &mut Vec<Command>) {
        if self.state == next {
            return;
        }
        info!(from = ?self.state, to = ?next, generation = self.generation, "connection state changed");
        self.state = next.clone();
        cmds.push(Command::Emit(ConnectionEvent::StateChanged(next)));
    }

    fn on_start(&mut self, cmds: &mut Vec<Command>) {
        if self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "start ignored, already running");
            return;
        }
        self.transition(ConnectionState::Connecting, cmds);
        self.awaiting_token = true;
        cmds.push(Command::AcquireToken { refresh: false });
    }

    fn on_stop(&mut self, cmds: &mut Vec<Command>) {
        cmds.push(Command::CancelReconnect);
        self.reconnect_pending = false;
        if self.state == ConnectionState::Ready
            && let Some(frame) = self.subscription.stop_frame()
        {
            cmds.push(Command::Send {
                generation: self.generation,
                frame,
            });
        }
        cmds.push(Command::Close {
            generation: self.generation,
        });
        self.subscription.on_connection_lost();
        self.transition(ConnectionState::Closing, cmds);
    }

    fn on_register(&mut self, request: SubscriptionRequest, cmds: &mut Vec<Command>) {
        if self.subscription.request() == Some(&request) && self.subscription.is_active() {
            debug!(id = %request.id, "subscription already active");
            return;
        }
        let stop = self.subscription.register(request);
        if self.state != ConnectionState::Ready {
            return;
        }
        if let Some(frame) = stop {
            cmds.push(Command::Send {
                generation: self.generation,
                frame,
            });
        }
        if let Some(frame) = self.subscription.on_ready(self.generation) {
            cmds.push(Command::Send {
                generation: self.generation,
                frame,
            });
        }
    }

    fn on_token(&mut self, token: AuthToken, cmds: &mut Vec<Command>) {
        if !self.awaiting_token || self.state != ConnectionState::Connecting {
            trace!("unexpected token ignored");
            return;
        }
        self.awaiting_token = false;
        if !token.is_present() {
            self.fail_auth(AuthError::EmptyToken, cmds);
            return;
        }
        self.token = Some(token);
        self.token_rejected = false;
        self.open(cmds);
    }

    fn on_token_failed(&mut self, err: AuthError, cmds: &mut Vec<Command>) {
        if !self.awaiting_token {
            return;
        }
        self.awaiting_token = false;
        self.fail_auth(err, cmds);
    }

    fn fail_auth(&mut self, err: AuthError, cmds: &mut Vec<Command>) {
        warn!(error = %err, "token acquisition failed, staying disconnected");
        self.attempt = 0;
        self.transition(ConnectionState::Disconnected, cmds);
        cmds.push(Command::Emit(ConnectionEvent::AuthFailed(err)));
    }

    fn open(&mut self, cmds: &mut Vec<Command>) {
        let Some(token) = &self.token else {
            return;
        };
        self.generation += 1;
        cmds.push(Command::Open {
            generation: self.generation,
            headers: self.identity.headers(token),
        });
    }

    fn on_opened(&mut self, generation: u64, cmds: &mut Vec<Command>) {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            debug!(generation, "superseded socket opened, closing it");
            cmds.push(Command::Close { generation });
            return;
        }
        let Some(token) = &self.token else {
            return;
        };
        let init = OutboundFrame::connection_init(self.identity.headers(token));
        self.transition(ConnectionState::AwaitingAck, cmds);
        cmds.push(Command::Send {
            generation,
            frame: init,
        });
    }

    fn on_frame(&mut self, generation: u64, text: &str, cmds: &mut Vec<Command>) {
        let connected = matches!(
            self.state,
            ConnectionState::AwaitingAck | ConnectionState::Ready
        );
        if !self.is_current(generation) || !connected {
            trace!(generation, "frame from superseded connection dropped");
            return;
        }

        let frame = InboundFrame::decode(text);
        match self.subscription.on_frame(&frame) {
            Routed::Ack => {
                if self.state != ConnectionState::AwaitingAck {
                    debug!("duplicate connection_ack ignored");
                    return;
                }
                self.attempt = 0;
                self.transition(ConnectionState::Ready, cmds);
                if let Some(start) = self.subscription.on_ready(generation) {
                    cmds.push(Command::Send {
                        generation,
                        frame: start,
                    });
                }
            }
            Routed::Data => cmds.push(Command::Deliver(frame)),
            Routed::Error { id, payload } => {
                warn!(id = ?id, %payload, "subscription error reported by server");
                cmds.push(Command::Emit(ConnectionEvent::SubscriptionError { id, payload }));
            }
            Routed::Completed { id } => {
                cmds.push(Command::Emit(ConnectionEvent::SubscriptionCompleted { id }));
            }
            Routed::Dropped => {}
        }
    }

    fn connection_lost(&mut self, unauthorized: bool, cmds: &mut Vec<Command>) {
        self.subscription.on_connection_lost();
        if unauthorized {
            warn!(generation = self.generation, "server rejected the token");
            self.token = None;
            self.token_rejected = true;
        }
        self.attempt = self.attempt.saturating_add(1);
        self.transition(
            ConnectionState::Reconnecting {
                attempt: self.attempt,
            },
            cmds,
        );
        if self.reconnect_pending {
            return;
        }
        self.reconnect_pending = true;
        cmds.push(Command::ScheduleReconnect(self.reconnect.delay));
        cmds.push(Command::Emit(ConnectionEvent::Reconnecting {
            attempt: self.attempt,
            next_retry_secs: self.reconnect.delay.as_secs_f64(),
        }));
    }

    fn on_reconnect_due(&mut self, cmds: &mut Vec<Command>) {
        if !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            return;
        }
        self.reconnect_pending = false;
        self.transition(ConnectionState::Connecting, cmds);
        if self.token.is_some() && !self.token_rejected {
            self.open(cmds);
        } else {
            self.awaiting_token = true;
            cmds.push(Command::AcquireToken {
                refresh: self.token_rejected,
            });
        }
    }
}
