//! Off-chain price sources.
//!
//! Request and response shapes are treated as opaque JSON: the clients
//! navigate `serde_json::Value` rather than binding the providers'
//! schemas, so a provider-side field addition never breaks resolution.
//! A missing price is `Ok(None)`; transport and 5xx failures are
//! transient errors the oracle falls through.

use std::time::Duration;

use alloy::primitives::Address;

use crate::error::{LedgerError, LedgerResult};

/// An off-chain price API answering "USD price of token X at time T".
#[axum::async_trait]
pub trait RemotePriceSource: Send + Sync {
    /// Fetch a price; `Ok(None)` means the source has no coverage.
    ///
    /// # Errors
    ///
    /// Transport failures and provider errors, classified transient.
    async fn fetch(
        &self,
        chain_slug: &str,
        token: Address,
        at: Option<i64>,
    ) -> LedgerResult<Option<f64>>;
}

/// Map a chain id to the slug the price providers use.
#[must_use]
pub fn chain_slug(chain_id: u64) -> &'static str {
    match chain_id {
        53935 => "dfk",
        8217 => "klaytn",
        1_666_600_000 => "harmony",
        _ => "unknown",
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .unwrap_or_default()
}

/// The authoritative source (tagged `DEFILLAMA`).
pub struct DefiLlamaSource {
    http: reqwest::Client,
    base_url: String,
}

impl DefiLlamaSource {
    /// Client against the public API.
    #[must_use]
    pub fn new() -> Self {
        Self::with_base_url("https://coins.llama.fi")
    }

    /// Client against a custom base URL.
    #[must_use]
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            http: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for DefiLlamaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[axum::async_trait]
impl RemotePriceSource for DefiLlamaSource {
    async fn fetch(
        &self,
        chain_slug: &str,
        token: Address,
        at: Option<i64>,
    ) -> LedgerResult<Option<f64>> {
        let coin = format!("{chain_slug}:{token:?}");
        let url = match at {
            Some(ts) => format!("{}/prices/historical/{ts}/{coin}", self.base_url),
            None => format!("{}/prices/current/{coin}", self.base_url),
        };

        let response = self.http.get(&url).send().await.map_err(|e| {
            LedgerError::rpc_transient("price API request failed", Some(Box::new(e)))
        })?;

        if response.status().is_server_error() {
            return Err(LedgerError::rpc_transient(
                format!("price API returned {}", response.status()),
                None,
            ));
        }
        if !response.status().is_success() {
            return Ok(None);
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            LedgerError::rpc_transient("price API response unreadable", Some(Box::new(e)))
        })?;

        Ok(body
            .get("coins")
            .and_then(|coins| coins.get(&coin))
            .and_then(|entry| entry.get("price"))
            .and_then(serde_json::Value::as_f64))
    }
}

/// The secondary source (tagged `COINGECKO`).
pub struct CoinGeckoSource {
    http: reqwest::Client,
    base_url: String,
}

impl CoinGeckoSource {
    /// Client against the public API.
    #[must_use]
    pub fn new() -> Self {
        Self::with_base_url("https://api.coingecko.com")
    }

    /// Client against a custom base URL.
    #[must_use]
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            http: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn platform(chain_slug: &str) -> &'static str {
        match chain_slug {
            "dfk" => "defi-kingdoms-blockchain",
            "klaytn" => "klay-token",
            "harmony" => "harmony-shard-0",
            _ => "unknown",
        }
    }
}

impl Default for CoinGeckoSource {
    fn default() -> Self {
        Self::new()
    }
}

#[axum::async_trait]
impl RemotePriceSource for CoinGeckoSource {
    async fn fetch(
        &self,
        chain_slug: &str,
        token: Address,
        _at: Option<i64>,
    ) -> LedgerResult<Option<f64>> {
        // The simple token-price endpoint is current-only; historical
        // lookups fall through to the next source.
        let token_key = format!("{token:?}").to_lowercase();
        let url = format!(
            "{}/api/v3/simple/token_price/{}?contract_addresses={}&vs_currencies=usd",
            self.base_url,
            Self::platform(chain_slug),
            token_key,
        );

        let response = self.http.get(&url).send().await.map_err(|e| {
            LedgerError::rpc_transient("price API request failed", Some(Box::new(e)))
        })?;

        if response.status().is_server_error() || response.status().as_u16() == 429 {
            return Err(LedgerError::rpc_transient(
                format!("price API returned {}", response.status()),
                None,
            ));
        }
        if !response.status().is_success() {
            return Ok(None);
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            LedgerError::rpc_transient("price API response unreadable", Some(Box::new(e)))
        })?;

        Ok(body
            .get(&token_key)
            .and_then(|entry| entry.get("usd"))
            .and_then(serde_json::Value::as_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_slugs() {
        assert_eq!(chain_slug(53935), "dfk");
        assert_eq!(chain_slug(8217), "klaytn");
        assert_eq!(chain_slug(1_666_600_000), "harmony");
        assert_eq!(chain_slug(1), "unknown");
    }

    #[test]
    fn test_gecko_platform_mapping() {
        assert_eq!(CoinGeckoSource::platform("dfk"), "defi-kingdoms-blockchain");
        assert_eq!(CoinGeckoSource::platform("harmony"), "harmony-shard-0");
    }
}
