// =============================================================================
// Tick Stream — Deriv WebSocket subscription feeding the ingestion service
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::app_state::IngestionService;
use crate::error::IngestError;
use crate::types::RawTick;

// ---------------------------------------------------------------------------
// Message parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DerivEnvelope {
    #[serde(default)]
    msg_type: Option<String>,
    #[serde(default)]
    tick: Option<RawTick>,
    #[serde(default)]
    error: Option<DerivError>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DerivError {
    pub code: String,
    pub message: String,
}

/// One decoded frame from the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Tick(RawTick),
    Error(DerivError),
    /// Anything else (pings, subscription acks without a tick).
    Other(Option<String>),
}

/// Decode a text frame from the Deriv API.
///
/// Expected shape for ticks:
/// ```json
/// { "msg_type": "tick", "tick": { "epoch": 1700000000, "quote": 1234.56, "symbol": "R_150_1S", ... } }
/// ```
/// Errors arrive as `{ "error": { "code": "...", "message": "..." }, ... }`.
pub fn parse_feed_message(text: &str) -> Result<FeedMessage> {
    let env: DerivEnvelope =
        serde_json::from_str(text).context("failed to parse feed JSON")?;

    if let Some(err) = env.error {
        return Ok(FeedMessage::Error(err));
    }
    Ok(match env.tick {
        Some(tick) => FeedMessage::Tick(tick),
        None => FeedMessage::Other(env.msg_type),
    })
}

/// Subscription request sent right after connecting.
pub fn subscribe_request(symbol: &str) -> String {
    serde_json::json!({ "ticks": symbol, "subscribe": 1 }).to_string()
}

// ---------------------------------------------------------------------------
// Stream session
// ---------------------------------------------------------------------------

/// Connect, subscribe, and feed ticks into `service` until the connection
/// fails or shutdown is signalled.
///
/// Returns `Ok(())` only on shutdown. Every other exit is an error so the
/// supervisor can reconnect. Connect + subscribe is bounded by
/// `connect_timeout_secs`; a session silent for `idle_timeout_secs` counts
/// as dropped.
pub async fn run_tick_stream(
    service: &Arc<IngestionService>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let config = service.config();
    let url = config.feed_endpoint();
    let symbol = config.symbol.clone();
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
    info!(url = %url, symbol = %symbol, "connecting to tick WebSocket");

    let handshake = async {
        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to tick WebSocket")?;

        let (mut write, read) = ws_stream.split();
        write
            .send(Message::Text(subscribe_request(&symbol)))
            .await
            .context("failed to send tick subscription")?;
        Ok::<_, anyhow::Error>((write, read))
    };

    let (mut write, mut read) = tokio::select! {
        res = tokio::time::timeout(connect_timeout, handshake) => match res {
            Ok(session) => session?,
            Err(_) => {
                warn!(symbol = %symbol, timeout_secs = connect_timeout.as_secs(), "tick WebSocket connect timed out");
                return Err(IngestError::FeedDisconnect(format!(
                    "connect timed out after {}s",
                    connect_timeout.as_secs()
                ))
                .into());
            }
        },
        _ = shutdown.changed() => {
            info!(symbol = %symbol, "shutdown requested while connecting");
            return Ok(());
        }
    };
    info!(symbol = %symbol, "tick subscription sent");

    loop {
        tokio::select! {
            msg = tokio::time::timeout(idle_timeout, read.next()) => match msg {
                Err(_) => {
                    warn!(symbol = %symbol, idle_secs = idle_timeout.as_secs(), "no frames from tick WebSocket");
                    return Err(IngestError::FeedDisconnect(format!(
                        "no frames for {}s",
                        idle_timeout.as_secs()
                    ))
                    .into());
                }
                Ok(Some(Ok(Message::Text(text)))) => handle_text(service, &text).await?,
                Ok(Some(Ok(Message::Close(frame)))) => {
                    warn!(symbol = %symbol, frame = ?frame, "tick WebSocket closed by server");
                    return Err(IngestError::FeedDisconnect("closed by server".into()).into());
                }
                // tungstenite answers pings itself.
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    error!(symbol = %symbol, error = %e, "tick WebSocket read error");
                    return Err(IngestError::FeedDisconnect(e.to_string()).into());
                }
                Ok(None) => {
                    warn!(symbol = %symbol, "tick WebSocket stream ended");
                    return Err(IngestError::FeedDisconnect("stream ended".into()).into());
                }
            },
            _ = shutdown.changed() => {
                info!(symbol = %symbol, "shutdown requested, closing tick WebSocket");
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

async fn handle_text(service: &Arc<IngestionService>, text: &str) -> Result<()> {
    match parse_feed_message(text) {
        Ok(FeedMessage::Tick(raw)) => {
            if !service.is_connected() {
                service.set_connected(true);
            }
            if let Err(e) = service.ingest(raw).await {
                if !e.is_recoverable() {
                    return Err(e.into());
                }
            }
        }
        Ok(FeedMessage::Error(err)) => {
            error!(code = %err.code, message = %err.message, "feed returned an error");
            return Err(IngestError::FeedDisconnect(format!("{}: {}", err.code, err.message)).into());
        }
        Ok(FeedMessage::Other(msg_type)) => {
            debug!(msg_type = ?msg_type, "ignoring feed message");
        }
        Err(e) => {
            warn!(error = %e, "failed to parse feed message");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Keep the feed subscribed until shutdown, reconnecting after a fixed delay.
///
/// Feed errors of any kind are retried without limit. Only a fatal ingestion
/// error (a broken window invariant) ends the loop with `Err`.
pub async fn run_feed_supervisor(
    service: Arc<IngestionService>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let delay = Duration::from_secs(service.config().reconnect_delay_secs);
    let mut attempt: u64 = 0;

    while !shutdown_requested(&shutdown) {
        attempt += 1;
        if attempt > 1 {
            service.record_reconnect_attempt();
        }

        let result = run_tick_stream(&service, &mut shutdown).await;
        service.set_connected(false);

        let e = match result {
            Ok(()) => break,
            Err(e) => e,
        };

        if let Some(ingest) = e.downcast_ref::<IngestError>() {
            if !ingest.is_recoverable() {
                error!(error = %ingest, "fatal ingestion error, stopping feed");
                return Err(e);
            }
        }

        error!(
            attempt,
            error = %format!("{e:#}"),
            delay_secs = delay.as_secs(),
            "tick stream error, reconnecting"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    info!("feed supervisor stopped");
    Ok(())
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;
    use crate::store::MemoryStore;

    #[test]
    fn parse_tick_message() {
        let json = r#"{
            "echo_req": { "subscribe": 1, "ticks": "R_150_1S" },
            "msg_type": "tick",
            "subscription": { "id": "9f6c0e1b" },
            "tick": {
                "ask": 1234.57,
                "bid": 1234.55,
                "epoch": 1700000000,
                "id": "9f6c0e1b",
                "pip_size": 2,
                "quote": 1234.56,
                "symbol": "R_150_1S"
            }
        }"#;
        match parse_feed_message(json).unwrap() {
            FeedMessage::Tick(raw) => {
                assert_eq!(raw.epoch, 1_700_000_000);
                assert_eq!(raw.symbol, "R_150_1S");
            }
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_message() {
        let json = r#"{
            "echo_req": { "subscribe": 1, "ticks": "NOPE" },
            "error": { "code": "InvalidSymbol", "message": "Symbol NOPE is invalid." },
            "msg_type": "tick"
        }"#;
        assert_eq!(
            parse_feed_message(json).unwrap(),
            FeedMessage::Error(DerivError {
                code: "InvalidSymbol".into(),
                message: "Symbol NOPE is invalid.".into(),
            })
        );
    }

    #[test]
    fn parse_other_and_garbage() {
        assert_eq!(
            parse_feed_message(r#"{"msg_type":"ping","ping":"pong"}"#).unwrap(),
            FeedMessage::Other(Some("ping".into()))
        );
        assert!(parse_feed_message("not json").is_err());
    }

    #[test]
    fn subscribe_request_shape() {
        let v: serde_json::Value = serde_json::from_str(&subscribe_request("R_150_1S")).unwrap();
        assert_eq!(v["ticks"], "R_150_1S");
        assert_eq!(v["subscribe"], 1);
    }

    #[tokio::test]
    async fn tick_frames_reach_the_window() {
        let service = Arc::new(
            IngestionService::new(RuntimeConfig::default(), Arc::new(MemoryStore::new()))
                .unwrap(),
        );
        let frame = r#"{"msg_type":"tick","tick":{"epoch":100,"quote":10.5,"symbol":"R_150_1S"}}"#;
        handle_text(&service, frame).await.unwrap();

        assert!(service.is_connected());
        assert_eq!(service.tick_snapshot().len(), 1);

        // Invalid ticks are dropped without ending the session.
        let bad = r#"{"msg_type":"tick","tick":{"epoch":101,"quote":-1.0,"symbol":"R_150_1S"}}"#;
        handle_text(&service, bad).await.unwrap();
        assert_eq!(service.tick_snapshot().len(), 1);

        let err = r#"{"error":{"code":"MarketIsClosed","message":"closed"},"msg_type":"tick"}"#;
        assert!(handle_text(&service, err).await.is_err());
    }

    /// Listener that accepts TCP connections and never answers.
    async fn silent_listener() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (addr, handle)
    }

    fn service_for(feed_url: String, tweak: impl FnOnce(&mut RuntimeConfig)) -> Arc<IngestionService> {
        let mut config = RuntimeConfig::default();
        config.feed_url = feed_url;
        tweak(&mut config);
        Arc::new(IngestionService::new(config, Arc::new(MemoryStore::new())).unwrap())
    }

    #[tokio::test]
    async fn shutdown_interrupts_stalled_handshake() {
        let (addr, _server) = silent_listener().await;
        let service = service_for(format!("ws://{addr}/websockets/v3"), |c| {
            c.connect_timeout_secs = 60;
        });

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_feed_supervisor(service.clone(), rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let res = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor stuck in handshake")
            .unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        let (addr, _server) = silent_listener().await;
        let service = service_for(format!("ws://{addr}/websockets/v3"), |c| {
            c.connect_timeout_secs = 1;
        });

        let (_tx, mut rx) = watch::channel(false);
        let err = tokio::time::timeout(Duration::from_secs(5), run_tick_stream(&service, &mut rx))
            .await
            .expect("connect timeout not applied")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IngestError>(),
            Some(IngestError::FeedDisconnect(_))
        ));
    }

    #[tokio::test]
    async fn silent_session_is_treated_as_dropped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // Complete the handshake, then go quiet.
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(ws);
        });
        let service = service_for(format!("ws://{addr}/websockets/v3"), |c| {
            c.idle_timeout_secs = 1;
        });

        let (_tx, mut rx) = watch::channel(false);
        let err = tokio::time::timeout(Duration::from_secs(5), run_tick_stream(&service, &mut rx))
            .await
            .expect("idle timeout not applied")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IngestError>(),
            Some(IngestError::FeedDisconnect(_))
        ));
    }

    #[tokio::test]
    async fn failed_sessions_count_as_reconnect_attempts() {
        let service = service_for("ws://127.0.0.1:9/websockets/v3".into(), |c| {
            c.reconnect_delay_secs = 0;
        });

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_feed_supervisor(service.clone(), rx));
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let status = service.status_snapshot();
        assert!(status.reconnect_attempts >= 1);
        assert!(!status.is_connected);
    }

    #[tokio::test]
    async fn supervisor_exits_promptly_on_shutdown() {
        let mut config = RuntimeConfig::default();
        // Nothing listens here, so every attempt fails fast.
        config.feed_url = "ws://127.0.0.1:9/websockets/v3".into();
        config.reconnect_delay_secs = 60;
        let service = Arc::new(IngestionService::new(config, Arc::new(MemoryStore::new())).unwrap());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_feed_supervisor(service.clone(), rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let res = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        assert!(res.is_ok());
        assert!(!service.is_connected());
    }
}
