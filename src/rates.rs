//! Exchange-rate lookups backed by a stale-while-revalidate cache.
//!
//! [`RateCache::get_rate`] answers "how many `quote` units buy one `base` unit" from
//! the cheapest mix of cached, derived and fetched data:
//!
//! | base    | quote   | strategy                                        |
//! |---------|---------|-------------------------------------------------|
//! | address | symbol  | fetch from the price provider                   |
//! | address | address | `base->native / quote->native`                  |
//! | symbol  | address | `1 / (quote->base)`                             |
//! | symbol  | symbol  | `base->anchor / quote->anchor`                  |
//!
//! Every chain ends in a provider fetch within three hops.

use anyhow::{anyhow, ensure};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, join_all};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{PairConfig, RatesConfig};
use crate::core::cache::{
    Claim, Clock, Lookup, PendingRate, RateTable, RefreshGuard, SystemClock,
};
use crate::core::currency::{Currency, CurrencyRateProvider, PairKey};
use crate::core::price::{Asset, PriceProvider};
use crate::error::RateError;

/// Returned when a reciprocal or ratio cannot be formed (zero or non-finite input).
/// It means "could not determine", never a genuine zero price.
pub const UNKNOWN_RATE: f64 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Direct,
    ViaNative,
    Invert,
    ViaAnchor,
}

impl Strategy {
    fn select(base: &Currency, quote: &Currency) -> Self {
        match (base.is_address(), quote.is_address()) {
            (true, false) => Strategy::Direct,
            (true, true) => Strategy::ViaNative,
            (false, true) => Strategy::Invert,
            (false, false) => Strategy::ViaAnchor,
        }
    }
}

fn reciprocal(rate: f64) -> f64 {
    if rate == 0.0 || !rate.is_finite() {
        UNKNOWN_RATE
    } else {
        1.0 / rate
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    let rate = numerator / denominator;
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        UNKNOWN_RATE
    }
}

pub struct RateCache {
    provider: Arc<dyn PriceProvider>,
    table: RateTable,
    freshness: Duration,
    fetch_timeout: Duration,
    native: Currency,
    anchor: Currency,
}

impl RateCache {
    pub fn new(
        provider: Arc<dyn PriceProvider>,
        config: &RatesConfig,
        fetch_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let native = Currency::normalize(&config.native_symbol, &config.native_symbol)
            .ok_or_else(|| anyhow!("native symbol must not be blank"))?;
        ensure!(
            !native.is_address(),
            "native symbol must be a ticker, got {native}"
        );
        let anchor = Currency::normalize(&config.anchor, native.as_str())
            .ok_or_else(|| anyhow!("anchor must not be blank"))?;
        ensure!(
            anchor.is_address(),
            "anchor must be a contract address, got {anchor}"
        );

        Ok(Self {
            provider,
            table: RateTable::new(config.freshness(), Arc::new(SystemClock)),
            freshness: config.freshness(),
            fetch_timeout,
            native,
            anchor,
        })
    }

    /// Replaces the time source. Drops anything cached so far.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.table = RateTable::new(self.freshness, clock);
        self
    }

    pub fn table(&self) -> &RateTable {
        &self.table
    }

    fn key(&self, base: &str, quote: &str) -> Result<PairKey, RateError> {
        let native = self.native.as_str();
        let base = Currency::normalize(base, native).ok_or(RateError::Validation("base"))?;
        let quote = Currency::normalize(quote, native).ok_or(RateError::Validation("quote"))?;
        Ok(PairKey::new(base, quote))
    }

    /// Units of `quote` per one unit of `base`.
    ///
    /// Returns [`UNKNOWN_RATE`] when a reciprocal or ratio of upstream rates cannot be formed.
    pub async fn get_rate(&self, base: &str, quote: &str) -> Result<f64, RateError> {
        let key = self.key(base, quote)?;
        debug!(%key, "Resolving rate");
        self.resolve(key).await
    }

    fn resolve(&self, key: PairKey) -> BoxFuture<'_, Result<f64, RateError>> {
        async move {
            if key.base == key.quote {
                return Ok(1.0);
            }

            let claimed = match self.table.lookup(&key) {
                Lookup::Fresh(rate) | Lookup::Refreshing(rate) => return Ok(rate),
                Lookup::Pending(pending) => return self.await_pending(&key, pending).await,
                Lookup::Claimed(guard) => Some(guard),
                Lookup::Empty => None,
            };

            if let Some(rate) = self.table.fresh(&key.reversed()) {
                debug!(%key, "Using reverse cached rate");
                return Ok(reciprocal(rate));
            }

            let pivot = match Strategy::select(&key.base, &key.quote) {
                Strategy::Invert => {
                    // Nothing is cached under the symbol-first key
                    drop(claimed);
                    let rate = self.resolve(key.reversed()).await?;
                    return Ok(reciprocal(rate));
                }
                Strategy::ViaNative => Some(self.native.clone()),
                Strategy::ViaAnchor => Some(self.anchor.clone()),
                Strategy::Direct => None,
            };

            let guard = match claimed {
                Some(guard) => guard,
                None => match self.table.claim(&key) {
                    Claim::Owner(guard) => guard,
                    Claim::Wait(pending) => return self.await_pending(&key, pending).await,
                    Claim::Cached(rate) => return Ok(rate),
                },
            };

            let result = match pivot {
                Some(pivot) => self.triangulate(&key, pivot).await,
                None => self.fetch(&key).await,
            };
            settle(guard, result)
        }
        .boxed()
    }

    async fn triangulate(&self, key: &PairKey, pivot: Currency) -> Result<f64, RateError> {
        debug!(%key, %pivot, "Triangulating rate");
        // A failed leg must not drop the other leg's claim
        let (base_leg, quote_leg) = futures::join!(
            self.resolve(PairKey::new(key.base.clone(), pivot.clone())),
            self.resolve(PairKey::new(key.quote.clone(), pivot)),
        );
        Ok(ratio(base_leg?, quote_leg?))
    }

    fn asset_for(&self, currency: &Currency) -> Option<Asset> {
        match currency {
            Currency::Address(address) => Some(Asset::Token(address.clone())),
            Currency::Symbol(_) if *currency == self.native => Some(Asset::Native),
            Currency::Symbol(_) => None,
        }
    }

    async fn fetch(&self, key: &PairKey) -> Result<f64, RateError> {
        let asset = self.asset_for(&key.base).ok_or_else(|| RateError::Provider {
            pair: key.to_string(),
            source: anyhow!("{} cannot be priced directly", key.base),
        })?;

        debug!(%key, "Fetching rate from provider");
        let fetch = self.provider.fetch_rate(&asset, key.quote.as_str());
        match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(Ok(rate)) => Ok(rate),
            Ok(Err(source)) => {
                error!(%key, error = %source, "Error fetching rate");
                Err(RateError::Provider {
                    pair: key.to_string(),
                    source,
                })
            }
            Err(_) => {
                error!(%key, "Timed out fetching rate");
                Err(RateError::Timeout {
                    pair: key.to_string(),
                    after: self.fetch_timeout,
                })
            }
        }
    }

    async fn await_pending(&self, key: &PairKey, pending: PendingRate) -> Result<f64, RateError> {
        debug!(%key, "Waiting for in-flight fetch");
        match pending.wait().await {
            Some(outcome) => outcome.map_err(|message| RateError::Provider {
                pair: key.to_string(),
                source: anyhow!(message),
            }),
            None => {
                debug!(%key, "In-flight fetch was dropped, retrying");
                self.resolve(key.clone()).await
            }
        }
    }

    /// Fetches `base` in `quote` straight from the provider unless a fresh value is cached.
    ///
    /// Pairs whose base is neither an address nor the native asset are derived as in
    /// [`RateCache::get_rate`].
    pub async fn prefetch(&self, base: &str, quote: &str) -> Result<f64, RateError> {
        let key = self.key(base, quote)?;
        if key.base == key.quote || self.asset_for(&key.base).is_none() {
            return self.resolve(key).await;
        }

        match self.table.claim(&key) {
            Claim::Cached(rate) => Ok(rate),
            Claim::Wait(pending) => self.await_pending(&key, pending).await,
            Claim::Owner(guard) => {
                let result = self.fetch(&key).await;
                settle(guard, result)
            }
        }
    }

    /// Prefetches `pairs` concurrently. Returns how many succeeded.
    pub async fn warm_up(&self, pairs: &[PairConfig]) -> usize {
        info!("Initializing cache...");
        let results = join_all(
            pairs
                .iter()
                .map(|pair| self.prefetch(&pair.base, &pair.quote)),
        )
        .await;

        let mut warmed = 0;
        for (pair, result) in pairs.iter().zip(results) {
            match result {
                Ok(_) => warmed += 1,
                Err(e) => error!(
                    base = %pair.base,
                    quote = %pair.quote,
                    error = %e,
                    "Failed to populate cache at startup"
                ),
            }
        }
        info!(warmed, total = pairs.len(), "Cache initialized.");
        warmed
    }
}

/// Writes a successful result through `guard`; errors and unknown rates leave the cache untouched.
fn settle(guard: RefreshGuard, result: Result<f64, RateError>) -> Result<f64, RateError> {
    match result {
        Ok(rate) if rate.is_finite() && rate > 0.0 => {
            debug!(key = %guard.key(), rate, "Refreshed cache");
            guard.commit(rate);
            Ok(rate)
        }
        Ok(rate) => {
            warn!(key = %guard.key(), rate, "Could not determine rate, not caching");
            guard.release_with(UNKNOWN_RATE);
            Ok(UNKNOWN_RATE)
        }
        Err(e) => {
            guard.fail(&e.to_string());
            Err(e)
        }
    }
}

#[async_trait]
impl CurrencyRateProvider for RateCache {
    async fn get_rate(&self, from: &str, to: &str) -> anyhow::Result<f64> {
        Ok(RateCache::get_rate(self, from, to).await?)
    }
}
