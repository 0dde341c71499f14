use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by [`crate::rates::RateCache::get_rate`].
#[derive(Debug, Error)]
pub enum RateError {
    /// Blank or missing currency. Client-side mistake.
    #[error("{0} currency must not be blank")]
    Validation(&'static str),

    /// Upstream unreachable, rejected the request, or had no data for the pair.
    #[error("price lookup failed for {pair}: {source}")]
    Provider {
        pair: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("price lookup for {pair} timed out after {after:?}")]
    Timeout { pair: String, after: Duration },
}

impl RateError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, RateError::Validation(_))
    }
}
