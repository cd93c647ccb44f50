pub mod candle_aggregator;
pub mod tick_stream;
pub mod tick_window;

// Re-export the window for convenient access (e.g. `use crate::market_data::TickWindow`).
pub use tick_window::TickWindow;
