use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::PathBuf};
use tracing::debug;

pub const USDT: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";
pub const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CoinGeckoConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Asset platform used for token lookups
    pub platform: String,
    /// Coin id of the chain's native asset
    pub native_id: String,
    pub timeout_secs: u64,
}

impl Default for CoinGeckoConfig {
    fn default() -> Self {
        CoinGeckoConfig {
            base_url: "https://api.coingecko.com".to_string(),
            api_key: None,
            platform: "ethereum".to_string(),
            native_id: "ethereum".to_string(),
            timeout_secs: 10,
        }
    }
}

impl CoinGeckoConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub coingecko: CoinGeckoConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PairConfig {
    pub base: String,
    pub quote: String,
}

impl PairConfig {
    fn new(base: &str, quote: &str) -> Self {
        PairConfig {
            base: base.to_string(),
            quote: quote.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RatesConfig {
    /// Seconds a fetched rate is served without refreshing
    pub freshness_secs: u64,
    pub native_symbol: String,
    /// Stablecoin used to triangulate between two symbols
    pub anchor: String,
    /// Pairs fetched at startup
    pub warmup: Vec<PairConfig>,
}

impl Default for RatesConfig {
    fn default() -> Self {
        RatesConfig {
            freshness_secs: 900,
            native_symbol: "eth".to_string(),
            anchor: USDC.to_string(),
            warmup: vec![
                PairConfig::new(USDT, "eth"),
                PairConfig::new(USDC, "eth"),
                PairConfig::new(USDT, "cny"),
                PairConfig::new(USDC, "cny"),
            ],
        }
    }
}

impl RatesConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub rates: RatesConfig,
}

impl AppConfig {
    /// Loads the default config file, falling back to built-in defaults when it does not exist.
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        if !config_path.exists() {
            debug!(
                "No config at {}, using defaults",
                config_path.display()
            );
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("io", "xrate", "xrate")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let yaml_str = r#"
server:
  port: 8080
providers:
  coingecko:
    base_url: "http://example.com/cg"
    api_key: "demo-key"
rates:
  freshness_secs: 60
  anchor: "0xDAC17F958D2ee523a2206206994597C13D831ec7"
  warmup:
    - base: "0xdac17f958d2ee523a2206206994597c13d831ec7"
      quote: "usd"
"#;

        let config: AppConfig = serde_yaml::from_str(yaml_str).expect("Failed to deserialize");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");

        let cg = &config.providers.coingecko;
        assert_eq!(cg.base_url, "http://example.com/cg");
        assert_eq!(cg.api_key.as_deref(), Some("demo-key"));
        assert_eq!(cg.platform, "ethereum");
        assert_eq!(cg.timeout(), Duration::from_secs(10));

        assert_eq!(config.rates.freshness(), Duration::from_secs(60));
        assert_eq!(config.rates.native_symbol, "eth");
        assert_eq!(config.rates.warmup, vec![PairConfig::new(USDT, "usd")]);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = serde_yaml::from_str("{}").expect("Failed to deserialize");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.providers.coingecko.base_url, "https://api.coingecko.com");
        assert_eq!(config.rates.freshness_secs, 900);
        assert_eq!(config.rates.anchor, USDC);
        assert_eq!(config.rates.warmup.len(), 4);
    }

    #[test]
    fn test_load_from_missing_path_fails() {
        let result = AppConfig::load_from_path("/definitely/not/here/config.yaml");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }
}
