//! Core business logic abstractions

pub mod cache;
pub mod currency;
pub mod log;
pub mod price;

// Re-export main types for cleaner imports
pub use cache::{CacheEntry, Clock, RateTable, SystemClock};
pub use currency::{Currency, CurrencyRateProvider, PairKey};
pub use price::{Asset, PriceProvider};
