use std::collections::BTreeMap;

use crate::error::IngestError;
use crate::types::{AcceptResult, Tick};

// ---------------------------------------------------------------------------
// TickWindow -- bounded, epoch-keyed tick store
// ---------------------------------------------------------------------------

/// Fixed-capacity store of the most recent ticks for one instrument.
///
/// Ticks are keyed by `epoch`, so a redelivered tick overwrites the earlier
/// entry instead of taking a second slot.  Once the window is over capacity
/// the tick with the smallest epoch is dropped, regardless of when it arrived.
///
/// The window does no locking of its own; `IngestionService` wraps it.
#[derive(Debug, Clone)]
pub struct TickWindow {
    symbol: String,
    capacity: usize,
    ticks: BTreeMap<i64, Tick>,
}

impl TickWindow {
    pub fn new(symbol: impl Into<String>, capacity: usize) -> Self {
        Self {
            symbol: symbol.into(),
            capacity,
            ticks: BTreeMap::new(),
        }
    }

    /// Validate and upsert a tick, evicting the oldest epoch if needed.
    ///
    /// Rejected ticks leave the window untouched.
    pub fn accept(&mut self, tick: Tick) -> Result<AcceptResult, IngestError> {
        self.validate(&tick)?;

        let epoch = tick.epoch;
        if let Some(existing) = self.ticks.get_mut(&epoch) {
            // Same epoch already stored: last write wins.
            if existing.price == tick.price && existing.symbol == tick.symbol {
                return Ok(AcceptResult::Unchanged);
            }
            *existing = tick;
            return Ok(AcceptResult::Replaced);
        }

        self.ticks.insert(epoch, tick);

        let evicted = if self.ticks.len() > self.capacity {
            self.ticks.pop_first().map(|(e, _)| e)
        } else {
            None
        };

        if evicted == Some(epoch) {
            // Older than everything in a full window.
            return Ok(AcceptResult::Unchanged);
        }
        Ok(AcceptResult::Inserted { evicted })
    }

    fn validate(&self, tick: &Tick) -> Result<(), IngestError> {
        if !tick.price.is_finite() {
            return Err(IngestError::invalid_tick(tick.epoch, "price is not finite"));
        }
        if tick.price <= 0.0 {
            return Err(IngestError::invalid_tick(
                tick.epoch,
                format!("price must be positive, got {}", tick.price),
            ));
        }
        if tick.epoch < 0 {
            return Err(IngestError::invalid_tick(tick.epoch, "epoch is negative"));
        }
        if tick.symbol != self.symbol {
            return Err(IngestError::invalid_tick(
                tick.epoch,
                format!("symbol {} does not match {}", tick.symbol, self.symbol),
            ));
        }
        Ok(())
    }

    /// Copy of all resident ticks, ascending by epoch.
    pub fn snapshot(&self) -> Vec<Tick> {
        self.ticks.values().cloned().collect()
    }

    /// The newest tick, if any.
    pub fn last(&self) -> Option<&Tick> {
        self.ticks.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
