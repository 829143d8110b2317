// =============================================================================
// Binance public REST client
// =============================================================================
//
// Only public market-data endpoints are used; nothing here signs requests.
// =============================================================================

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

#[derive(Clone)]
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PriceTicker {
    symbol: String,
    #[allow(dead_code)]
    price: String,
}

impl Default for RestClient {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// GET /api/v3/ticker/price — every actively trading symbol, lower-cased
    /// for use as stream topic prefixes.
    pub async fn price_ticker_symbols(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/ticker/price request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("GET /api/v3/ticker/price returned {status}");
        }

        let prices: Vec<PriceTicker> = resp
            .json()
            .await
            .context("failed to parse price ticker response")?;

        let symbols: Vec<String> = prices
            .into_iter()
            .map(|p| p.symbol.to_lowercase())
            .collect();

        debug!(count = symbols.len(), "fetched symbol list");
        Ok(symbols)
    }
}
