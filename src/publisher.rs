// =============================================================================
// Publisher — snapshot, aggregate, and overwrite store collections
// =============================================================================
//
// Runs on the feed task after every accepted tick:
//   1. Skip when the window did not change.
//   2. Copy the window under a short read lock.
//   3. Rebuild candles for every configured interval from the copy.
//   4. Replace each collection in the store (ticks + one per interval).
//
// Store failures are logged and counted; the next accepted tick is the retry.
// Only an aggregation invariant violation escapes as an error.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::IngestError;
use crate::market_data::candle_aggregator::{aggregate, retain_latest};
use crate::market_data::TickWindow;
use crate::runtime_config::CandleIntervalConfig;
use crate::store::StoreAdapter;
use crate::types::{Candle, Tick};

/// Collection holding the raw tick window.
pub const TICKS_COLLECTION: &str = "ticks";

// =============================================================================
// PublicationState
// =============================================================================

/// Freshness and health of the relay as seen by the status page.
#[derive(Debug, Clone, Default)]
pub struct PublicationState {
    /// Feed subscription is live. Driven by feed callbacks only.
    pub is_connected: bool,
    /// Completion time of the last publish where every write succeeded.
    pub last_update: Option<DateTime<Utc>>,
    pub publish_count: u64,
    pub publish_failures: u64,
    pub rejected_ticks: u64,
    /// Sessions started after the first one, successful or not.
    pub reconnect_attempts: u64,
    pub last_publish_error: Option<String>,
    /// Candle counts written by the last successful publish, per interval.
    pub candle_counts: BTreeMap<i64, usize>,
}

/// What happened to a single publication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Window unchanged, nothing written.
    Skipped,
    /// Every collection was replaced.
    Published,
    /// At least one write failed; `failed` lists the collections.
    Failed { failed: Vec<String> },
}

// =============================================================================
// Publisher
// =============================================================================

pub struct Publisher {
    store: Arc<dyn StoreAdapter>,
    intervals: Vec<CandleIntervalConfig>,
    publish_ticks: usize,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        intervals: Vec<CandleIntervalConfig>,
        publish_ticks: usize,
    ) -> Self {
        Self {
            store,
            intervals,
            publish_ticks,
        }
    }

    pub fn intervals(&self) -> &[CandleIntervalConfig] {
        &self.intervals
    }

    /// Publish the current window if it changed.
    ///
    /// Returns `Err` only for [`IngestError::AggregationInput`]; store errors
    /// are recorded in `state` and reported through [`PublishOutcome`].
    pub async fn on_tick_accepted(
        &self,
        window: &RwLock<TickWindow>,
        state: &RwLock<PublicationState>,
        changed: bool,
    ) -> Result<PublishOutcome, IngestError> {
        if !changed {
            return Ok(PublishOutcome::Skipped);
        }

        let snapshot = window.read().snapshot();
        let series = self.build_candles(&snapshot)?;
        let documents = self.build_documents(&snapshot, &series)?;

        let store = &self.store;
        let writes = documents
            .into_iter()
            .map(move |(collection, doc)| async move {
                let res = store.replace(&collection, doc).await;
                (collection, res)
            });

        let mut failed = Vec::new();
        let mut last_error = None;
        for (collection, res) in join_all(writes).await {
            if let Err(e) = res {
                warn!(collection = %collection, error = %e, "store write failed");
                last_error = Some(e.to_string());
                failed.push(collection);
            }
        }

        let mut st = state.write();
        if failed.is_empty() {
            st.last_update = Some(Utc::now());
            st.publish_count += 1;
            st.candle_counts = series
                .iter()
                .map(|(iv, candles)| (iv.interval_secs, candles.len()))
                .collect();
            debug!(ticks = snapshot.len(), "window published");
            Ok(PublishOutcome::Published)
        } else {
            st.publish_failures += 1;
            st.last_publish_error = last_error;
            Ok(PublishOutcome::Failed { failed })
        }
    }

    /// Candles per configured interval, trimmed to each retained count.
    pub fn build_candles(
        &self,
        snapshot: &[Tick],
    ) -> Result<Vec<(CandleIntervalConfig, Vec<Candle>)>, IngestError> {
        self.intervals
            .iter()
            .map(|iv| {
                let mut candles = aggregate(snapshot, iv.interval_secs)?;
                retain_latest(&mut candles, iv.retain);
                Ok((*iv, candles))
            })
            .collect()
    }

    /// Whole-collection documents for one publish, ticks first.
    pub fn build_documents(
        &self,
        snapshot: &[Tick],
        series: &[(CandleIntervalConfig, Vec<Candle>)],
    ) -> Result<Vec<(String, Value)>, IngestError> {
        let mut docs = Vec::with_capacity(series.len() + 1);
        docs.push((
            TICKS_COLLECTION.to_string(),
            ticks_document(snapshot, self.publish_ticks)?,
        ));
        for (iv, candles) in series {
            let doc = serde_json::to_value(candles).map_err(|e| IngestError::StoreWrite {
                collection: iv.collection(),
                message: format!("failed to encode candles: {e}"),
            })?;
            docs.push((iv.collection(), doc));
        }
        Ok(docs)
    }
}

/// Newest `limit` ticks as an object keyed by epoch.
///
/// Equal-width epoch keys sort chronologically, which is how the status UI
/// reads the node.
pub fn ticks_document(snapshot: &[Tick], limit: usize) -> Result<Value, IngestError> {
    let skip = snapshot.len().saturating_sub(limit);
    let mut map = Map::new();
    for tick in &snapshot[skip..] {
        let value = serde_json::to_value(tick).map_err(|e| IngestError::StoreWrite {
            collection: TICKS_COLLECTION.to_string(),
            message: format!("failed to encode tick {}: {e}", tick.epoch),
        })?;
        map.insert(tick.epoch.to_string(), value);
    }
    Ok(Value::Object(map))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    const SYM: &str = "R_150_1S";

    struct FailingStore;

    #[async_trait]
    impl StoreAdapter for FailingStore {
        async fn replace(&self, collection: &str, _document: Value) -> Result<(), IngestError> {
            Err(IngestError::StoreWrite {
                collection: collection.to_string(),
                message: "timed out".into(),
            })
        }

        async fn read(&self, collection: &str) -> Result<Option<Value>, IngestError> {
            Err(IngestError::StoreRead {
                collection: collection.to_string(),
                message: "timed out".into(),
            })
        }
    }

    fn intervals() -> Vec<CandleIntervalConfig> {
        vec![
            CandleIntervalConfig {
                interval_secs: 60,
                retain: 2,
            },
            CandleIntervalConfig {
                interval_secs: 300,
                retain: 50,
            },
        ]
    }

    fn filled_window(epochs: &[i64]) -> RwLock<TickWindow> {
        let mut window = TickWindow::new(SYM, 950);
        for (i, e) in epochs.iter().enumerate() {
            window.accept(Tick::new(*e, 10.0 + i as f64, SYM)).unwrap();
        }
        RwLock::new(window)
    }

    #[tokio::test]
    async fn publishes_every_collection() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(store.clone(), intervals(), 950);
        let window = filled_window(&[100, 130, 161, 250, 400]);
        let state = RwLock::new(PublicationState::default());

        let outcome = publisher
            .on_tick_accepted(&window, &state, true)
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Published);

        let ticks = store.get("ticks").unwrap();
        assert_eq!(ticks.as_object().unwrap().len(), 5);
        assert_eq!(
            ticks["100"],
            json!({"epoch": 100, "quote": 10.0, "symbol": SYM})
        );

        // 60s buckets: 60, 120, 240, 360 -> trimmed to the last two.
        let c60 = store.get("candles_60").unwrap();
        let starts: Vec<i64> = c60
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["bucket_start"].as_i64().unwrap())
            .collect();
        assert_eq!(starts, vec![240, 360]);

        let c300 = store.get("candles_300").unwrap();
        assert_eq!(c300.as_array().unwrap().len(), 2);

        let st = state.read();
        assert!(st.last_update.is_some());
        assert_eq!(st.publish_count, 1);
        assert_eq!(st.candle_counts.get(&60), Some(&2));
        assert_eq!(st.candle_counts.get(&300), Some(&2));
    }

    #[tokio::test]
    async fn unchanged_window_is_not_published() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(store.clone(), intervals(), 950);
        let window = filled_window(&[100]);
        let state = RwLock::new(PublicationState::default());

        let outcome = publisher
            .on_tick_accepted(&window, &state, false)
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Skipped);
        assert!(store.get("ticks").is_none());
        assert!(state.read().last_update.is_none());
    }

    #[tokio::test]
    async fn store_failure_is_contained() {
        let publisher = Publisher::new(Arc::new(FailingStore), intervals(), 950);
        let window = filled_window(&[100, 200]);
        let state = RwLock::new(PublicationState::default());

        let outcome = publisher
            .on_tick_accepted(&window, &state, true)
            .await
            .unwrap();
        match outcome {
            PublishOutcome::Failed { failed } => assert_eq!(failed.len(), 3),
            other => panic!("expected failure, got {other:?}"),
        }

        let st = state.read();
        assert!(st.last_update.is_none());
        assert_eq!(st.publish_failures, 1);
        assert!(st.last_publish_error.as_deref().unwrap().contains("timed out"));
        // Window untouched by the failed publish.
        assert_eq!(window.read().len(), 2);
    }

    #[test]
    fn ticks_document_is_capped_to_newest() {
        let snapshot: Vec<Tick> = (1..=5).map(|e| Tick::new(e, 1.0, SYM)).collect();
        let doc = ticks_document(&snapshot, 3).unwrap();
        let keys: Vec<&String> = doc.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["3", "4", "5"]);
    }

    #[test]
    fn documents_follow_collection_names() {
        let publisher = Publisher::new(Arc::new(MemoryStore::new()), intervals(), 950);
        let snapshot = vec![Tick::new(100, 10.0, SYM)];
        let series = publisher.build_candles(&snapshot).unwrap();
        let docs = publisher.build_documents(&snapshot, &series).unwrap();
        let names: Vec<&str> = docs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["ticks", "candles_60", "candles_300"]);
    }
}
