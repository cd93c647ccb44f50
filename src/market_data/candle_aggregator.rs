use crate::error::IngestError;
use crate::types::{Candle, Tick};

// ---------------------------------------------------------------------------
// Bucketing
// ---------------------------------------------------------------------------

/// Left-closed bucket boundary for `epoch` at the given interval.
pub fn bucket_start(epoch: i64, interval_secs: i64) -> i64 {
    epoch - epoch.rem_euclid(interval_secs)
}

// ---------------------------------------------------------------------------
// Full rebuild
// ---------------------------------------------------------------------------

/// Fold an ascending tick snapshot into candles of `interval_secs` length.
///
/// Output is ordered by `bucket_start` with one candle per non-empty bucket.
/// The result depends only on the input; no clock or map ordering is read.
///
/// A non-positive interval or a snapshot that is not strictly ascending by
/// epoch cannot come out of `TickWindow` and is reported as
/// [`IngestError::AggregationInput`].
pub fn aggregate(ticks: &[Tick], interval_secs: i64) -> Result<Vec<Candle>, IngestError> {
    if interval_secs <= 0 {
        return Err(IngestError::AggregationInput(format!(
            "interval must be positive, got {interval_secs}"
        )));
    }
    if let Some(pair) = ticks.windows(2).find(|w| w[0].epoch >= w[1].epoch) {
        return Err(IngestError::AggregationInput(format!(
            "epochs not strictly ascending: {} then {}",
            pair[0].epoch, pair[1].epoch
        )));
    }

    let mut out = Vec::new();
    let mut builder = CandleBuilder::new(interval_secs);
    for tick in ticks {
        if let Some(done) = builder.push(tick) {
            out.push(done);
        }
    }
    out.extend(builder.finish());
    Ok(out)
}

/// Keep only the most recent `count` candles. Applied after aggregation.
pub fn retain_latest(candles: &mut Vec<Candle>, count: usize) {
    let excess = candles.len().saturating_sub(count);
    candles.drain(..excess);
}

// ---------------------------------------------------------------------------
// CandleBuilder -- incremental, one open candle per interval
// ---------------------------------------------------------------------------

/// Streaming candle builder for a single interval.
///
/// Holds only the open candle; a tick that lands in a new bucket closes it
/// and hands it back.  Feeding an ascending sequence through `push` and then
/// `finish` yields exactly what [`aggregate`] returns for the same sequence.
#[derive(Debug, Clone)]
pub struct CandleBuilder {
    interval_secs: i64,
    current: Option<Candle>,
}

impl CandleBuilder {
    pub fn new(interval_secs: i64) -> Self {
        Self {
            interval_secs,
            current: None,
        }
    }

    /// Fold a tick in, returning the previous candle when its bucket closes.
    pub fn push(&mut self, tick: &Tick) -> Option<Candle> {
        let start = bucket_start(tick.epoch, self.interval_secs);

        match self.current.as_mut() {
            Some(candle) if candle.bucket_start == start => {
                candle.high = candle.high.max(tick.price);
                candle.low = candle.low.min(tick.price);
                candle.close = tick.price;
                candle.volume += 1;
                None
            }
            _ => self.current.replace(Candle {
                bucket_start: start,
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
                volume: 1,
            }),
        }
    }

    /// Flush the open candle.
    pub fn finish(self) -> Option<Candle> {
        self.current
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
