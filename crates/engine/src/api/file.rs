//! Candles from a local JSON file of `[timestamp, open, high, low, close, volume]` rows

use anyhow::{Context, Result};
use async_trait::async_trait;
use persistence::BacktestContext;
use std::path::PathBuf;
use tracing::info;

use crate::simulation::CandleSource;
use crate::types::Candle;

pub struct FileCandleSource {
    path: PathBuf,
}

impl FileCandleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Rows inside `[start, end)`, sorted by time
    pub fn parse(raw: &str, start: i64, end: i64) -> Result<Vec<Candle>> {
        let rows: Vec<[f64; 6]> = serde_json::from_str(raw)?;
        let mut candles: Vec<Candle> = rows
            .into_iter()
            .map(Candle::from_row)
            .filter(|c| c.timestamp >= start && c.timestamp < end)
            .collect();
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }
}

#[async_trait]
impl CandleSource for FileCandleSource {
    async fn fetch_candles(&self, ctx: &BacktestContext) -> Result<Vec<Candle>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let candles = Self::parse(&raw, ctx.start_timestamp, ctx.end_timestamp)?;
        info!(path = %self.path.display(), bars = candles.len(), "Loaded candles from file");
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filters_and_sorts() {
        let raw = "[[3000,1,2,0.5,1.5,10],[1000,1,2,0.5,1.5,10],[9000,1,2,0.5,1.5,10]]";
        let candles = FileCandleSource::parse(raw, 0, 5000).unwrap();
        assert_eq!(
            candles.iter().map(|c| c.timestamp).collect::<Vec<_>>(),
            vec![1000, 3000]
        );
    }

    #[test]
    fn test_parse_rejects_short_rows() {
        assert!(FileCandleSource::parse("[[1,2,3]]", 0, 10).is_err());
    }
}
