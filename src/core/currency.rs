//! Currency conversion abstractions

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Display;

#[async_trait]
pub trait CurrencyRateProvider: Send + Sync {
    async fn get_rate(&self, from: &str, to: &str) -> Result<f64>;
}

/// A normalized currency identifier.
///
/// Anything starting with `0x` is treated as an on-chain contract address,
/// everything else is a ticker symbol (fiat or native asset).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Currency {
    Symbol(String),
    Address(String),
}

impl Currency {
    /// Trims and lower-cases `raw`. All-zero addresses collapse to `native_symbol`.
    ///
    /// Returns `None` for blank input.
    pub fn normalize(raw: &str, native_symbol: &str) -> Option<Self> {
        let value = raw.trim().to_lowercase();
        if value.is_empty() {
            return None;
        }
        if is_zero_address(&value) {
            return Some(Currency::Symbol(native_symbol.trim().to_lowercase()));
        }
        if value.starts_with("0x") {
            Some(Currency::Address(value))
        } else {
            Some(Currency::Symbol(value))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Currency::Symbol(s) | Currency::Address(s) => s,
        }
    }

    pub fn is_address(&self) -> bool {
        matches!(self, Currency::Address(_))
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_zero_address(value: &str) -> bool {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    !digits.is_empty() && digits.chars().all(|c| c == '0')
}

/// Ordered cache key: how many `quote` units one `base` unit buys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub base: Currency,
    pub quote: Currency,
}

impl PairKey {
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self { base, quote }
    }

    pub fn reversed(&self) -> Self {
        Self {
            base: self.quote.clone(),
            quote: self.base.clone(),
        }
    }
}

impl Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}
