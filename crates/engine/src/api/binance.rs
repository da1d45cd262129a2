//! Binance public API client for historical candles (no authentication required)

use anyhow::Result;
use async_trait::async_trait;
use persistence::BacktestContext;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::simulation::CandleSource;
use crate::types::Candle;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Binance public market data client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

impl RawKline {
    fn to_candle(&self) -> Option<Candle> {
        Some(Candle {
            timestamp: self.0,
            open: self.1.parse().ok()?,
            high: self.2.parse().ok()?,
            low: self.3.parse().ok()?,
            close: self.4.parse().ok()?,
            volume: self.5.parse().ok()?,
        })
    }
}

/// "BTC/USDT" -> "BTCUSDT"
pub fn exchange_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

impl BinanceClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            base_url: base_url.into(),
        })
    }

    /// Fetch one page of candles; each candle's open time is carried along
    /// with its close time so the caller can advance
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<(Candle, i64)>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.base_url, symbol, interval, start_time, end_time, MAX_KLINES_PER_REQUEST
        );

        debug!(symbol, interval, start_time, "Fetching klines from Binance");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {}: {}", status, body);
        }

        let raw_klines: Vec<RawKline> = response.json().await?;
        Ok(page_candles(&raw_klines, end_time))
    }

    /// Fetch candles opening inside `[start_time, end_time)`, paginating
    /// ranges > 1000 bars
    pub async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<Candle>> {
        let symbol = exchange_symbol(symbol);
        let mut candles = Vec::new();
        let mut current_start = start_time;

        info!(symbol = %symbol, interval, "Fetching paginated klines from Binance");

        while current_start < end_time {
            // Binance treats endTime as inclusive on open time
            let page = self
                .get_klines(&symbol, interval, current_start, end_time - 1)
                .await?;
            let Some(&(_, last_close_time)) = page.last() else {
                break;
            };
            candles.extend(page.into_iter().map(|(candle, _)| candle));

            current_start = last_close_time + 1;

            // Small delay to respect rate limits
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(total = candles.len(), "Paginated kline fetch complete");
        Ok(candles)
    }
}

/// Decoded candles with their close times, dropping any bar that opens
/// after `last_open`
fn page_candles(raw_klines: &[RawKline], last_open: i64) -> Vec<(Candle, i64)> {
    raw_klines
        .iter()
        .filter_map(|raw| raw.to_candle().map(|c| (c, raw.6)))
        .filter(|(candle, _)| candle.timestamp <= last_open)
        .collect()
}

#[async_trait]
impl CandleSource for BinanceClient {
    async fn fetch_candles(&self, ctx: &BacktestContext) -> Result<Vec<Candle>> {
        self.get_candles(
            &ctx.symbol,
            &ctx.timeframe,
            ctx.start_timestamp,
            ctx.end_timestamp,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_symbol() {
        assert_eq!(exchange_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(exchange_symbol("eth-usdt"), "ETHUSDT");
        assert_eq!(exchange_symbol("SOLUSDT"), "SOLUSDT");
    }

    #[test]
    fn test_raw_kline_decoding() {
        let raw: Vec<RawKline> = serde_json::from_str(
            r#"[[1700000000000,"100.5","101.0","99.5","100.8","12.3",1700003599999,"1240.0",42,"6.0","600.0","0"]]"#,
        )
        .unwrap();
        let candle = raw[0].to_candle().unwrap();
        assert_eq!(candle.timestamp, 1_700_000_000_000);
        assert_eq!(candle.close, 100.8);
        assert_eq!(raw[0].6, 1_700_003_599_999);
    }

    #[test]
    fn test_page_excludes_bar_opening_at_window_end() {
        let raw: Vec<RawKline> = serde_json::from_str(
            r#"[
                [1000,"1","1","1","1","1",1999,"1",1,"1","1","0"],
                [2000,"1","1","1","1","1",2999,"1",1,"1","1","0"]
            ]"#,
        )
        .unwrap();
        // window [0, 2000): the caller asks for opens up to 1999
        let page = page_candles(&raw, 2000 - 1);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].0.timestamp, 1000);
        assert_eq!(page[0].1, 1999);
    }
}
