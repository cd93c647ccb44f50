// =============================================================================
// Shared types used across the tick relay
// =============================================================================

use serde::{Deserialize, Serialize};

/// A validated price observation for the configured instrument.
///
/// `epoch` is the event time reported by the feed (seconds since the Unix
/// epoch), not the time the relay received it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub epoch: i64,
    #[serde(rename = "quote")]
    pub price: f64,
    pub symbol: String,
}

impl Tick {
    pub fn new(epoch: i64, price: f64, symbol: impl Into<String>) -> Self {
        Self {
            epoch,
            price,
            symbol: symbol.into(),
        }
    }
}

/// Tick event exactly as delivered by the feed, before validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawTick {
    pub epoch: i64,
    pub quote: f64,
    pub symbol: String,
}

impl From<RawTick> for Tick {
    fn from(raw: RawTick) -> Self {
        Self::new(raw.epoch, raw.quote, raw.symbol)
    }
}

/// A single OHLCV candle derived from ticks in one interval bucket.
///
/// `volume` is the number of ticks that fell into the bucket; the feed
/// carries no traded size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Outcome of offering a tick to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptResult {
    /// A new epoch was stored. `evicted` holds the epoch pushed out to stay
    /// within capacity, if any.
    Inserted { evicted: Option<i64> },
    /// An existing epoch received a different price or symbol.
    Replaced,
    /// Nothing visible changed: an identical duplicate, or a tick older than
    /// everything in a full window.
    Unchanged,
}

impl AcceptResult {
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

impl std::fmt::Display for AcceptResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inserted { evicted: Some(e) } => write!(f, "Inserted (evicted {e})"),
            Self::Inserted { evicted: None } => write!(f, "Inserted"),
            Self::Replaced => write!(f, "Replaced"),
            Self::Unchanged => write!(f, "Unchanged"),
        }
    }
}
