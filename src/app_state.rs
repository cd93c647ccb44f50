// =============================================================================
// Ingestion Service — owned state shared by the feed task and the status API
// =============================================================================
//
// One instance per process, handed out as `Arc<IngestionService>`. The feed
// task is the only writer of the tick window; the HTTP handlers only read.
//
// Thread safety:
//   - parking_lot::RwLock around the window and the publication state.
//   - Locks are held for a copy or a single `accept`, never across `.await`.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::market_data::candle_aggregator::{aggregate, retain_latest};
use crate::market_data::TickWindow;
use crate::publisher::{PublicationState, PublishOutcome, Publisher, TICKS_COLLECTION};
use crate::runtime_config::RuntimeConfig;
use crate::store::{entry_count, StoreAdapter};
use crate::types::{AcceptResult, Candle, RawTick, Tick};

// =============================================================================
// IngestionService
// =============================================================================

pub struct IngestionService {
    config: RuntimeConfig,
    window: RwLock<TickWindow>,
    state: RwLock<PublicationState>,
    publisher: Publisher,
    store: Arc<dyn StoreAdapter>,
    start_time: Instant,
}

impl IngestionService {
    /// Validate `config` and build an empty service around `store`.
    pub fn new(config: RuntimeConfig, store: Arc<dyn StoreAdapter>) -> Result<Self, IngestError> {
        config.validate()?;

        let window = TickWindow::new(config.symbol.clone(), config.max_ticks);
        let publisher = Publisher::new(
            store.clone(),
            config.candle_intervals.clone(),
            config.publish_window(),
        );

        Ok(Self {
            config,
            window: RwLock::new(window),
            state: RwLock::new(PublicationState::default()),
            publisher,
            store,
            start_time: Instant::now(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ── Ingestion ───────────────────────────────────────────────────────

    /// Apply one feed event to the window and publish if it changed.
    ///
    /// Invalid ticks are logged, counted, and returned as
    /// [`IngestError::InvalidTick`]; the window is left as it was.
    pub async fn ingest(&self, raw: RawTick) -> Result<AcceptResult, IngestError> {
        let tick = Tick::from(raw);
        let epoch = tick.epoch;
        let price = tick.price;

        let accepted = self.window.write().accept(tick);
        let result = match accepted {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "dropping invalid tick");
                self.state.write().rejected_ticks += 1;
                return Err(e);
            }
        };
        debug!(epoch, price, result = %result, "tick accepted");

        let outcome = self
            .publisher
            .on_tick_accepted(&self.window, &self.state, result.changed())
            .await?;
        if outcome == PublishOutcome::Published {
            info!(epoch, price, "stored tick");
        }

        Ok(result)
    }

    // ── Feed status ─────────────────────────────────────────────────────

    /// Record the feed connection state. Does not touch `last_update`.
    pub fn set_connected(&self, connected: bool) {
        let mut st = self.state.write();
        if st.is_connected != connected {
            if connected {
                info!(symbol = %self.config.symbol, "feed connected");
            } else {
                warn!(symbol = %self.config.symbol, "feed disconnected");
            }
        }
        st.is_connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Count a session attempt after the first. Counted before the outcome
    /// is known, so failed attempts are included.
    pub fn record_reconnect_attempt(&self) {
        self.state.write().reconnect_attempts += 1;
    }

    // ── Read side ───────────────────────────────────────────────────────

    /// Point-in-time copy of the window, ascending by epoch.
    pub fn tick_snapshot(&self) -> Vec<Tick> {
        self.window.read().snapshot()
    }

    pub fn publication_state(&self) -> PublicationState {
        self.state.read().clone()
    }

    /// Candles for a configured interval, computed from the current window
    /// and trimmed like a publish. `Ok(None)` for an unconfigured interval.
    pub fn candles(&self, interval_secs: i64) -> Result<Option<Vec<Candle>>, IngestError> {
        let Some(iv) = self
            .config
            .candle_intervals
            .iter()
            .find(|iv| iv.interval_secs == interval_secs)
        else {
            return Ok(None);
        };

        let snapshot = self.tick_snapshot();
        let mut candles = aggregate(&snapshot, iv.interval_secs)?;
        retain_latest(&mut candles, iv.retain);
        Ok(Some(candles))
    }

    /// Status as tracked locally by the relay.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let (tick_count, window_capacity, last_tick) = {
            let window = self.window.read();
            (window.len(), window.capacity(), window.last().cloned())
        };
        let st = self.publication_state();

        StatusSnapshot {
            symbol: self.config.symbol.clone(),
            is_connected: st.is_connected,
            tick_count,
            window_capacity,
            last_tick,
            last_update_time: st
                .last_update
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            candle_counts: st.candle_counts,
            publish_count: st.publish_count,
            publish_failures: st.publish_failures,
            rejected_ticks: st.rejected_ticks,
            reconnect_attempts: st.reconnect_attempts,
            last_publish_error: st.last_publish_error,
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: Utc::now().timestamp_millis(),
        }
    }

    /// Entry counts as stored, read back through the store adapter.
    pub async fn store_status(&self) -> Result<StoreStatus, IngestError> {
        let ticks = self.store.read(TICKS_COLLECTION).await?;
        let mut candle_counts = BTreeMap::new();
        for iv in self.publisher.intervals() {
            let doc = self.store.read(&iv.collection()).await?;
            candle_counts.insert(iv.interval_secs, doc.as_ref().map_or(0, entry_count));
        }

        Ok(StoreStatus {
            tick_count: ticks.as_ref().map_or(0, entry_count),
            candle_counts,
        })
    }
}

// =============================================================================
// Serialisable status types
// =============================================================================

/// Payload of `GET /api/v1/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub symbol: String,
    pub is_connected: bool,
    pub tick_count: usize,
    pub window_capacity: usize,
    pub last_tick: Option<Tick>,
    pub last_update_time: Option<String>,
    pub candle_counts: BTreeMap<i64, usize>,
    pub publish_count: u64,
    pub publish_failures: u64,
    pub rejected_ticks: u64,
    pub reconnect_attempts: u64,
    pub last_publish_error: Option<String>,
    pub uptime_secs: u64,
    pub server_time: i64,
}

/// Payload of `GET /api/v1/store`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub tick_count: usize,
    pub candle_counts: BTreeMap<i64, usize>,
}

// =============================================================================
// Tests
// =============================================================================
