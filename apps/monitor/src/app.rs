//! Wires the login client, telemetry extractor and connection manager.

use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::broadcast;

use poolflow_cloud_auth::LoginClient;
use poolflow_connection::{CachedTokenProvider, ConnectionEvent, ConnectionManager};
use poolflow_telemetry::{BroadcastSink, FLOW_STATUS_TOPIC, SinkEvent, TelemetryExtractor};

use crate::config::MonitorConfig;

/// Runs the monitor until ctrl-c or an unrecoverable auth failure.
pub async fn run(config: MonitorConfig) -> anyhow::Result<()> {
    // -- Auth --
    let login = LoginClient::new(
        config.auth.login_url.clone(),
        config.credentials(),
        &config.login_headers(),
    )
    .context("building login client")?;
    let tokens = Arc::new(CachedTokenProvider::new(login));

    // -- Telemetry --
    let sink = Arc::new(BroadcastSink::default());
    let sink_rx = sink.subscribe();
    let extractor = Arc::new(
        TelemetryExtractor::new(config.measurement_path(), sink.clone())
            .with_unit_id(config.subscription.unit_id.clone()),
    );

    // -- Connection --
    let manager = ConnectionManager::new(tokens, extractor);
    let mut events = manager
        .take_events()
        .await
        .context("connection events already taken")?;
    let mut auth_errors = manager.watch_auth_error();
    manager.start(config.client_config()).await?;
    tokio::spawn(log_sink(sink_rx));

    tracing::info!("monitor running");

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                break Ok(());
            }
            changed = auth_errors.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                if let Some(e) = auth_errors.borrow_and_update().clone() {
                    break Err(e);
                }
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break Ok(()),
            },
        }
    };

    manager.stop().await;
    if let Err(e) = outcome {
        bail!("authentication failed: {e}");
    }
    Ok(())
}

fn log_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::StateChanged(state) => tracing::info!(?state, "connection state"),
        ConnectionEvent::SubscriptionError { id, payload } => {
            tracing::warn!(?id, %payload, "subscription error");
        }
        ConnectionEvent::SubscriptionCompleted { id } => {
            tracing::warn!(id, "subscription completed by server");
        }
        ConnectionEvent::Reconnecting {
            attempt,
            next_retry_secs,
        } => tracing::info!(attempt, next_retry_secs, "reconnecting"),
        ConnectionEvent::AuthFailed(e) => tracing::error!(error = %e, "authentication failed"),
    }
}

async fn log_sink(mut rx: broadcast::Receiver<SinkEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) if event.topic == FLOW_STATUS_TOPIC => {
                tracing::info!(status = %event.payload, "flow status changed");
            }
            Ok(event) => tracing::debug!(topic = %event.topic, "unit data received"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "sink consumer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
