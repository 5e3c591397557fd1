//! Public handle for the subscription client.
//!
//! [`ConnectionManager::start`] spawns the driver task that owns the
//! connection. Everything else is either a message to that task or a
//! snapshot read from a watch channel, so the handle can be shared freely.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use poolflow_protocol::SubscriptionRequest;
use poolflow_telemetry::{FlowStatus, TelemetryExtractor, TelemetrySample};

use crate::driver::Driver;
use crate::error::{AuthError, ManagerError};
use crate::machine::{Input, Machine};
use crate::subscription::SubscriptionManager;
use crate::token::TokenProvider;
use crate::types::{ClientConfig, ConnectionEvent, ConnectionState};

/// Owns one subscription client: socket lifecycle, handshake, routing and
/// reconnection.
pub struct ConnectionManager {
    tokens: Arc<dyn TokenProvider>,
    extractor: Arc<TelemetryExtractor>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    auth_tx: Arc<watch::Sender<Option<AuthError>>>,
    inputs_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Input>>>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ConnectionManager {
    /// Creates a stopped manager.
    pub fn new(tokens: Arc<dyn TokenProvider>, extractor: Arc<TelemetryExtractor>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (auth_tx, _) = watch::channel(None);
        Self {
            tokens,
            extractor,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state_tx: Arc::new(state_tx),
            auth_tx: Arc::new(auth_tx),
            inputs_tx: std::sync::Mutex::new(None),
            driver: Mutex::new(None),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Starts connecting with `config`. Must be called inside a tokio runtime.
    pub async fn start(&self, config: ClientConfig) -> Result<(), ManagerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ManagerError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        info!(url = %config.url, id = %config.subscription.id, "starting subscription client");
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let machine = Machine::new(
            config.identity,
            config.reconnect,
            SubscriptionManager::with_request(config.subscription),
        );
        let driver = Driver {
            machine,
            url: config.url,
            subprotocol: config.subprotocol,
            keepalive: config.keepalive,
            tokens: self.tokens.clone(),
            extractor: self.extractor.clone(),
            inputs_tx: inputs_tx.clone(),
            inputs_rx,
            events_tx: self.events_tx.clone(),
            state_tx: self.state_tx.clone(),
            auth_tx: self.auth_tx.clone(),
            cancel: self.cancel.clone(),
            client: None,
            reconnect_cancel: None,
        };

        if let Ok(mut guard) = self.inputs_tx.lock() {
            *guard = Some(inputs_tx);
        }
        *self.driver.lock().await = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Replaces the registered subscription.
    ///
    /// When the connection is ready the old subscription is stopped and the
    /// new one started right away; otherwise it starts on the next ack.
    pub fn register(&self, request: SubscriptionRequest) -> Result<(), ManagerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ManagerError::Stopped);
        }
        let guard = self.inputs_tx.lock().map_err(|_| ManagerError::Stopped)?;
        let tx = guard.as_ref().ok_or(ManagerError::NotStarted)?;
        tx.send(Input::Register(request))
            .map_err(|_| ManagerError::Stopped)
    }

    /// Stops the client for good.
    ///
    /// Sends `stop` for an active subscription, closes the socket and
    /// cancels any pending reconnect. Once this returns no further frames
    /// are sent and no reconnect is attempted. Safe to call in any state
    /// and more than once.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let Ok(mut guard) = self.inputs_tx.lock() {
            guard.take();
        }

        let handle = self.driver.lock().await.take();
        match handle {
            Some(handle) => {
                let _ = handle.await;
                debug!("subscription client stopped");
            }
            None => {
                self.state_tx.send_replace(ConnectionState::Closing);
            }
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Subscribes to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The last token acquisition failure, cleared once a connection
    /// reaches `Ready`.
    ///
    /// Unlike the event queue this never drops a failure, even when the
    /// owner does not consume events.
    pub fn last_auth_error(&self) -> Option<AuthError> {
        self.auth_tx.borrow().clone()
    }

    /// Subscribes to auth failures.
    pub fn watch_auth_error(&self) -> watch::Receiver<Option<AuthError>> {
        self.auth_tx.subscribe()
    }

    /// Latest derived flow status, `None` until the first valid reading.
    pub fn flow_status(&self) -> Option<FlowStatus> {
        self.extractor.flow_status()
    }

    /// Subscribes to flow status updates.
    pub fn watch_flow(&self) -> watch::Receiver<Option<FlowStatus>> {
        self.extractor.watch_flow()
    }

    /// Latest telemetry sample.
    pub fn latest_sample(&self) -> Option<TelemetrySample> {
        self.extractor.latest_sample()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    use poolflow_telemetry::{EventSink, FLOW_STATUS_TOPIC, MeasurementPath};

    use crate::token::{AuthToken, TokenFuture};
    use crate::types::ReconnectConfig;

    const QUERY: &str = "subscription UnitUpdates($unitId: String!) { unit(id: $unitId) { measurements { waterflow } } }";
    const WAIT: Duration = Duration::from_secs(5);

    struct Accepted {
        ws: WebSocketStream<TcpStream>,
        authorization: Option<String>,
    }

    /// Accepts WebSocket upgrades, echoing the requested subprotocol.
    /// The first `reject` upgrades are refused with HTTP 401.
    async fn server(reject: usize) -> (String, mpsc::UnboundedReceiver<Accepted>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let rejections = Arc::new(AtomicUsize::new(reject));

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let rejections = rejections.clone();
                tokio::spawn(async move {
                    let mut authorization = None;
                    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                        authorization = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned);
                        let reject = rejections
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                            .is_ok();
                        if reject {
                            return Err(http::Response::builder()
                                .status(http::StatusCode::UNAUTHORIZED)
                                .body(None)
                                .unwrap());
                        }
                        if let Some(protocol) = req.headers().get("sec-websocket-protocol") {
                            resp.headers_mut()
                                .insert("sec-websocket-protocol", protocol.clone());
                        }
                        Ok(resp)
                    };
                    let accepted = tokio_tungstenite::accept_hdr_async(stream, callback).await;
                    if let Ok(ws) = accepted {
                        let _ = tx.send(Accepted { ws, authorization });
                    }
                });
            }
        });

        (url, rx)
    }

    async fn next_conn(conns: &mut mpsc::UnboundedReceiver<Accepted>) -> Accepted {
        tokio::time::timeout(WAIT, conns.recv())
            .await
            .expect("no connection")
            .expect("server gone")
    }

    async fn recv_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            let msg = tokio::time::timeout(WAIT, ws.next()).await.expect("no frame");
            match msg {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    async fn send(ws: &mut WebSocketStream<TcpStream>, text: &str) {
        ws.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    /// Runs the handshake on the server side and returns the start frame.
    async fn handshake(conn: &mut Accepted) -> Value {
        let init = recv_json(&mut conn.ws).await;
        assert_eq!(init["type"], "connection_init");
        send(&mut conn.ws, r#"{"type":"connection_ack"}"#).await;
        recv_json(&mut conn.ws).await
    }

    async fn wait_for_event(
        events: &mut mpsc::Receiver<ConnectionEvent>,
        pred: impl Fn(&ConnectionEvent) -> bool,
    ) -> ConnectionEvent {
        loop {
            let event = tokio::time::timeout(WAIT, events.recv())
                .await
                .expect("no event")
                .expect("events closed");
            if pred(&event) {
                return event;
            }
        }
    }

    async fn wait_for_state(mgr: &ConnectionManager, state: ConnectionState) {
        let mut rx = mgr.watch_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    struct FixedToken(&'static str);

    impl TokenProvider for FixedToken {
        fn get_token(&self) -> TokenFuture<'_> {
            Box::pin(async move { Ok(AuthToken::new(self.0)) })
        }
    }

    #[derive(Default)]
    struct SequenceTokens {
        calls: AtomicUsize,
        invalidations: AtomicUsize,
    }

    impl TokenProvider for SequenceTokens {
        fn get_token(&self) -> TokenFuture<'_> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(AuthToken::new(format!("tok-{n}")))
            })
        }

        fn invalidate(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingTokens;

    impl TokenProvider for FailingTokens {
        fn get_token(&self) -> TokenFuture<'_> {
            Box::pin(async { Err(AuthError::Provider("login rejected".into())) })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: std::sync::Mutex<Vec<(String, Value)>>,
    }

    impl RecordingSink {
        fn topic_count(&self, topic: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == topic)
                .count()
        }
    }

    impl EventSink for RecordingSink {
        fn publish(&self, topic: &str, payload: Value) {
            self.events.lock().unwrap().push((topic.to_string(), payload));
        }
    }

    fn manager(tokens: Arc<dyn TokenProvider>) -> (Arc<RecordingSink>, ConnectionManager) {
        let sink = Arc::new(RecordingSink::default());
        let extractor = Arc::new(TelemetryExtractor::new(
            MeasurementPath::default(),
            sink.clone(),
        ));
        (sink, ConnectionManager::new(tokens, extractor))
    }

    fn config(url: &str) -> ClientConfig {
        let mut config = ClientConfig::new(
            url,
            SubscriptionRequest::new("1", QUERY).with_variable("unitId", "U1"),
        );
        config.reconnect = ReconnectConfig {
            delay: Duration::from_millis(50),
        };
        config
    }

    #[tokio::test]
    async fn end_to_end_handshake_and_flow() {
        let (url, mut conns) = server(0).await;
        let (sink, mgr) = manager(Arc::new(FixedToken("abc")));
        mgr.start(config(&url)).await.unwrap();

        let mut conn = next_conn(&mut conns).await;
        assert_eq!(conn.authorization.as_deref(), Some("Bearer abc"));

        let init = recv_json(&mut conn.ws).await;
        assert_eq!(
            init,
            json!({"type": "connection_init", "payload": {"headers": {"Authorization": "Bearer abc"}}})
        );
        send(&mut conn.ws, r#"{"type":"connection_ack"}"#).await;

        let start = recv_json(&mut conn.ws).await;
        assert_eq!(
            start,
            json!({"id": "1", "type": "start", "payload": {"query": QUERY, "variables": {"unitId": "U1"}}})
        );
        wait_for_state(&mgr, ConnectionState::Ready).await;

        send(
            &mut conn.ws,
            r#"{"id":"1","type":"data","payload":{"data":{"unit":{"measurements":{"waterflow":3.5}}}}}"#,
        )
        .await;

        let mut flow = mgr.watch_flow();
        tokio::time::timeout(WAIT, flow.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mgr.flow_status().map(|s| s.flowing), Some(true));
        tokio::time::timeout(WAIT, async {
            while sink.topic_count(FLOW_STATUS_TOPIC) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.topic_count(FLOW_STATUS_TOPIC), 1);
        assert_eq!(mgr.latest_sample().and_then(|s| s.get("waterflow")), Some(3.5));

        mgr.stop().await;
    }

    #[tokio::test]
    async fn unknown_frames_keep_connection_ready() {
        let (url, mut conns) = server(0).await;
        let (_sink, mgr) = manager(Arc::new(FixedToken("abc")));
        mgr.start(config(&url)).await.unwrap();

        let mut conn = next_conn(&mut conns).await;
        handshake(&mut conn).await;
        wait_for_state(&mgr, ConnectionState::Ready).await;

        send(&mut conn.ws, r#"{"type":"ka"}"#).await;
        send(&mut conn.ws, "not json").await;
        send(
            &mut conn.ws,
            r#"{"id":"1","type":"data","payload":{"data":{"unit":{"measurements":{"waterflow":0}}}}}"#,
        )
        .await;

        let mut flow = mgr.watch_flow();
        tokio::time::timeout(WAIT, flow.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mgr.flow_status().map(|s| s.flowing), Some(false));
        assert_eq!(mgr.state(), ConnectionState::Ready);

        mgr.stop().await;
    }

    #[tokio::test]
    async fn reconnect_reuses_subscription_id_and_token() {
        let (url, mut conns) = server(0).await;
        let tokens = Arc::new(SequenceTokens::default());
        let (_sink, mgr) = manager(tokens.clone());
        let mut events = mgr.take_events().await.unwrap();
        mgr.start(config(&url)).await.unwrap();

        let mut first = next_conn(&mut conns).await;
        assert_eq!(handshake(&mut first).await["id"], "1");
        first.ws.close(None).await.unwrap();

        let event = wait_for_event(&mut events, |e| {
            matches!(e, ConnectionEvent::Reconnecting { .. })
        })
        .await;
        assert!(matches!(
            event,
            ConnectionEvent::Reconnecting { attempt: 1, .. }
        ));

        let mut second = next_conn(&mut conns).await;
        assert_eq!(second.authorization.as_deref(), Some("Bearer tok-0"));
        let start = handshake(&mut second).await;
        assert_eq!(start["type"], "start");
        assert_eq!(start["id"], "1");
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 0);

        mgr.stop().await;
    }

    #[tokio::test]
    async fn stop_sends_stop_frame_and_never_reconnects() {
        let (url, mut conns) = server(0).await;
        let (_sink, mgr) = manager(Arc::new(FixedToken("abc")));
        mgr.start(config(&url)).await.unwrap();

        let mut conn = next_conn(&mut conns).await;
        handshake(&mut conn).await;
        wait_for_state(&mgr, ConnectionState::Ready).await;

        mgr.stop().await;
        assert_eq!(mgr.state(), ConnectionState::Closing);
        assert_eq!(recv_json(&mut conn.ws).await, json!({"id": "1", "type": "stop"}));

        let again = tokio::time::timeout(Duration::from_millis(300), conns.recv()).await;
        assert!(again.is_err(), "no reconnect after stop");
        assert!(matches!(
            mgr.start(config(&url)).await,
            Err(ManagerError::Stopped)
        ));
    }

    #[tokio::test]
    async fn auth_failure_is_reported_without_retry() {
        let (url, mut conns) = server(0).await;
        let (_sink, mgr) = manager(Arc::new(FailingTokens));
        let mut events = mgr.take_events().await.unwrap();
        mgr.start(config(&url)).await.unwrap();

        let event = wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::AuthFailed(_))).await;
        assert_eq!(
            event,
            ConnectionEvent::AuthFailed(AuthError::Provider("login rejected".into()))
        );
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        let attempt = tokio::time::timeout(Duration::from_millis(200), conns.recv()).await;
        assert!(attempt.is_err(), "no socket without a token");
        mgr.stop().await;
    }

    #[tokio::test]
    async fn auth_failure_survives_full_event_queue() {
        let (url, _conns) = server(0).await;
        let (_sink, mgr) = manager(Arc::new(FailingTokens));
        let filler = ConnectionEvent::SubscriptionCompleted { id: "x".into() };
        while mgr.events_tx.try_send(filler.clone()).is_ok() {}

        let mut auth = mgr.watch_auth_error();
        mgr.start(config(&url)).await.unwrap();

        tokio::time::timeout(WAIT, auth.wait_for(Option::is_some))
            .await
            .expect("auth failure not delivered")
            .unwrap();
        assert_eq!(
            mgr.last_auth_error(),
            Some(AuthError::Provider("login rejected".into()))
        );
        wait_for_state(&mgr, ConnectionState::Disconnected).await;
        mgr.stop().await;
    }

    #[tokio::test]
    async fn auth_close_code_refreshes_token() {
        let (url, mut conns) = server(0).await;
        let tokens = Arc::new(SequenceTokens::default());
        let (_sink, mgr) = manager(tokens.clone());
        mgr.start(config(&url)).await.unwrap();

        let mut first = next_conn(&mut conns).await;
        assert_eq!(first.authorization.as_deref(), Some("Bearer tok-0"));
        handshake(&mut first).await;
        first
            .ws
            .close(Some(CloseFrame {
                code: CloseCode::from(4401),
                reason: "".into(),
            }))
            .await
            .unwrap();

        let second = next_conn(&mut conns).await;
        assert_eq!(second.authorization.as_deref(), Some("Bearer tok-1"));
        assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);

        mgr.stop().await;
    }

    #[tokio::test]
    async fn rejected_upgrade_refreshes_token() {
        let (url, mut conns) = server(1).await;
        let tokens = Arc::new(SequenceTokens::default());
        let (_sink, mgr) = manager(tokens.clone());
        mgr.start(config(&url)).await.unwrap();

        let mut conn = next_conn(&mut conns).await;
        assert_eq!(conn.authorization.as_deref(), Some("Bearer tok-1"));
        assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(handshake(&mut conn).await["id"], "1");

        mgr.stop().await;
    }

    #[tokio::test]
    async fn subscription_error_is_surfaced() {
        let (url, mut conns) = server(0).await;
        let (_sink, mgr) = manager(Arc::new(FixedToken("abc")));
        let mut events = mgr.take_events().await.unwrap();
        mgr.start(config(&url)).await.unwrap();

        let mut conn = next_conn(&mut conns).await;
        handshake(&mut conn).await;
        send(&mut conn.ws, r#"{"id":"1","type":"error","payload":{"message":"bad unit"}}"#).await;

        let event = wait_for_event(&mut events, |e| {
            matches!(e, ConnectionEvent::SubscriptionError { .. })
        })
        .await;
        assert_eq!(
            event,
            ConnectionEvent::SubscriptionError {
                id: Some("1".into()),
                payload: json!({"message": "bad unit"}),
            }
        );
        assert_eq!(mgr.state(), ConnectionState::Ready);

        mgr.stop().await;
    }

    #[tokio::test]
    async fn register_restarts_subscription_when_ready() {
        let (url, mut conns) = server(0).await;
        let (_sink, mgr) = manager(Arc::new(FixedToken("abc")));
        mgr.start(config(&url)).await.unwrap();

        let mut conn = next_conn(&mut conns).await;
        handshake(&mut conn).await;
        wait_for_state(&mgr, ConnectionState::Ready).await;

        mgr.register(SubscriptionRequest::new("2", "subscription { other }"))
            .unwrap();
        assert_eq!(recv_json(&mut conn.ws).await, json!({"id": "1", "type": "stop"}));
        let start = recv_json(&mut conn.ws).await;
        assert_eq!(start["type"], "start");
        assert_eq!(start["id"], "2");

        mgr.stop().await;
    }

    #[tokio::test]
    async fn lifecycle_misuse() {
        let (_sink, mgr) = manager(Arc::new(FixedToken("abc")));
        assert_eq!(
            mgr.register(SubscriptionRequest::new("1", QUERY)),
            Err(ManagerError::NotStarted)
        );

        let (url, _conns) = server(0).await;
        mgr.start(config(&url)).await.unwrap();
        assert_eq!(
            mgr.start(config(&url)).await,
            Err(ManagerError::AlreadyStarted)
        );
        mgr.stop().await;
        mgr.stop().await;
        assert_eq!(mgr.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn stop_before_start_is_clean() {
        let (_sink, mgr) = manager(Arc::new(FixedToken("abc")));
        mgr.stop().await;
        assert_eq!(mgr.state(), ConnectionState::Closing);
        assert!(mgr.flow_status().is_none());
    }

    #[tokio::test]
    async fn take_events_once() {
        let (_sink, mgr) = manager(Arc::new(FixedToken("abc")));
        assert!(mgr.take_events().await.is_some());
        assert!(mgr.take_events().await.is_none());
    }
}
