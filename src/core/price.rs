//! Upstream price lookup abstractions

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Display;

/// The asset being priced upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Asset {
    /// The chain's native coin (e.g. ether).
    Native,
    /// An ERC-20 style token identified by its lower-case contract address.
    Token(String),
}

impl Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Asset::Native => f.write_str("native"),
            Asset::Token(address) => f.write_str(address),
        }
    }
}

/// Looks up how many `vs_currency` units one unit of `asset` is worth.
///
/// Implementations are expected to be slow and fallible. Callers do their own caching.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn fetch_rate(&self, asset: &Asset, vs_currency: &str) -> Result<f64>;
}
