use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, instrument};

use super::util::with_retry;
use crate::config::CoinGeckoConfig;
use crate::core::price::{Asset, PriceProvider};

const API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// `{ "<id or contract>": { "<vs currency>": price } }`
type SimplePriceResponse = HashMap<String, HashMap<String, f64>>;

// CoinGeckoProvider implementation for PriceProvider
pub struct CoinGeckoProvider {
    base_url: String,
    api_key: Option<String>,
    platform: String,
    native_id: String,
    client: reqwest::Client,
}

impl CoinGeckoProvider {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::from_config(&CoinGeckoConfig {
            base_url: base_url.to_string(),
            ..CoinGeckoConfig::default()
        })
    }

    pub fn from_config(config: &CoinGeckoConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("xrate/1.0")
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(CoinGeckoProvider {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            platform: config.platform.clone(),
            native_id: config.native_id.clone(),
            client,
        })
    }

    fn url_for(&self, asset: &Asset, vs_currency: &str) -> String {
        match asset {
            Asset::Native => format!(
                "{}/api/v3/simple/price?ids={}&vs_currencies={}",
                self.base_url, self.native_id, vs_currency
            ),
            Asset::Token(address) => format!(
                "{}/api/v3/simple/token_price/{}?contract_addresses={}&vs_currencies={}",
                self.base_url, self.platform, address, vs_currency
            ),
        }
    }

    fn response_key<'a>(&'a self, asset: &'a Asset) -> &'a str {
        match asset {
            Asset::Native => &self.native_id,
            Asset::Token(address) => address,
        }
    }
}

#[async_trait]
impl PriceProvider for CoinGeckoProvider {
    #[instrument(
        name = "CoinGeckoRateFetch",
        skip(self),
        fields(asset = %asset, vs_currency = %vs_currency)
    )]
    async fn fetch_rate(&self, asset: &Asset, vs_currency: &str) -> Result<f64> {
        let vs_currency = vs_currency.trim().to_lowercase();
        let url = self.url_for(asset, &vs_currency);
        debug!("Requesting rate from {}", url);

        let response = with_retry(
            || {
                let mut request = self.client.get(&url);
                if let Some(key) = &self.api_key {
                    request = request.header(API_KEY_HEADER, key);
                }
                request.send()
            },
            3,
            500,
        )
        .await
        .map_err(|e| anyhow!("Request error: {} for {} in {}", e, asset, vs_currency))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "HTTP error: {} for {} in {}",
                response.status(),
                asset,
                vs_currency
            ));
        }

        let text = response.text().await?;
        debug!(response = %text, "Received CoinGecko response");

        let data: SimplePriceResponse = serde_json::from_str(&text)
            .map_err(|e| anyhow!("Failed to parse JSON response for {}: {}", asset, e))?;

        let wanted = self.response_key(asset);
        data.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(wanted))
            .and_then(|(_, prices)| prices.get(&vs_currency).copied())
            .ok_or_else(|| anyhow!("No data found for {} with currency {}", asset, vs_currency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const USDT: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";

    async fn create_token_mock_server(address: &str, vs: &str, body: &str) -> MockServer {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v3/simple/token_price/ethereum"))
            .and(query_param("contract_addresses", address))
            .and(query_param("vs_currencies", vs))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&mock_server)
            .await;

        mock_server
    }

    #[tokio::test]
    async fn test_successful_token_rate_fetch() {
        let mock_response = format!(r#"{{"{USDT}": {{"eth": 0.000312}}}}"#);
        let mock_server = create_token_mock_server(USDT, "eth", &mock_response).await;

        let provider = CoinGeckoProvider::new(&mock_server.uri()).unwrap();
        let rate = provider
            .fetch_rate(&Asset::Token(USDT.to_string()), "ETH")
            .await
            .expect("Failed to get rate");
        assert_eq!(rate, 0.000312);
    }

    #[tokio::test]
    async fn test_successful_native_rate_fetch() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/simple/price"))
            .and(query_param("ids", "ethereum"))
            .and(query_param("vs_currencies", "cny"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"ethereum": {"cny": 24000}}"#),
            )
            .mount(&mock_server)
            .await;

        let provider = CoinGeckoProvider::new(&mock_server.uri()).unwrap();
        let rate = provider.fetch_rate(&Asset::Native, "cny").await.unwrap();
        assert_eq!(rate, 24000.0);
    }

    #[tokio::test]
    async fn test_api_key_is_sent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/simple/price"))
            .and(header(API_KEY_HEADER, "secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"ethereum": {"usd": 3100.5}}"#),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = CoinGeckoProvider::from_config(&CoinGeckoConfig {
            base_url: mock_server.uri(),
            api_key: Some("secret".to_string()),
            ..CoinGeckoConfig::default()
        })
        .unwrap();
        let rate = provider.fetch_rate(&Asset::Native, "usd").await.unwrap();
        assert_eq!(rate, 3100.5);
    }

    #[tokio::test]
    async fn test_missing_token_data() {
        let mock_server = create_token_mock_server(USDT, "eth", "{}").await;

        let provider = CoinGeckoProvider::new(&mock_server.uri()).unwrap();
        let result = provider
            .fetch_rate(&Asset::Token(USDT.to_string()), "eth")
            .await;
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().to_string(),
            format!("No data found for {USDT} with currency eth")
        );
    }

    #[tokio::test]
    async fn test_missing_currency_field() {
        let mock_response = format!(r#"{{"{USDT}": {{"usd": 1.0}}}}"#);
        let mock_server = create_token_mock_server(USDT, "eth", &mock_response).await;

        let provider = CoinGeckoProvider::new(&mock_server.uri()).unwrap();
        let result = provider
            .fetch_rate(&Asset::Token(USDT.to_string()), "eth")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_api_error_response() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&mock_server)
            .await;

        let provider = CoinGeckoProvider::new(&mock_server.uri()).unwrap();
        let result = provider.fetch_rate(&Asset::Native, "usd").await;
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().to_string(),
            "HTTP error: 429 Too Many Requests for native in usd"
        );
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ethereum": "oops"}"#))
            .mount(&mock_server)
            .await;

        let provider = CoinGeckoProvider::new(&mock_server.uri()).unwrap();
        let result = provider.fetch_rate(&Asset::Native, "usd").await;
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse JSON response for native")
        );
    }
}
