//! Indicator catalog: precomputes RSI and SMA values for every candle once
//! per session, so each simulated run only looks values up.

use ta::indicators::{RelativeStrengthIndex, SimpleMovingAverage};
use ta::Next;

use crate::simulation::PatternCatalog;
use crate::types::{Candle, PatternResult};

/// RSI periods a configuration may pick from
pub const RSI_PERIODS: [usize; 4] = [7, 14, 21, 28];
/// SMA periods available as trend filters
pub const SMA_PERIODS: [usize; 3] = [20, 50, 100];

pub fn rsi_key(period: usize) -> String {
    format!("rsi_{period}")
}

pub fn sma_key(period: usize) -> String {
    format!("sma_{period}")
}

#[derive(Debug, Clone)]
pub struct IndicatorCatalog {
    rsi_periods: Vec<usize>,
    sma_periods: Vec<usize>,
}

impl Default for IndicatorCatalog {
    fn default() -> Self {
        Self::new(RSI_PERIODS.to_vec(), SMA_PERIODS.to_vec())
    }
}

impl IndicatorCatalog {
    pub fn new(rsi_periods: Vec<usize>, sma_periods: Vec<usize>) -> Self {
        Self {
            rsi_periods,
            sma_periods,
        }
    }
}

impl PatternCatalog for IndicatorCatalog {
    /// A value appears only once its indicator has seen `period` bars.
    /// Zero periods are rejected by `ta` and skipped.
    fn evaluate(&self, candles: &[Candle]) -> Vec<PatternResult> {
        let mut rsis: Vec<(usize, RelativeStrengthIndex)> = self
            .rsi_periods
            .iter()
            .filter_map(|&p| RelativeStrengthIndex::new(p).ok().map(|ind| (p, ind)))
            .collect();
        let mut smas: Vec<(usize, SimpleMovingAverage)> = self
            .sma_periods
            .iter()
            .filter_map(|&p| SimpleMovingAverage::new(p).ok().map(|ind| (p, ind)))
            .collect();

        candles
            .iter()
            .enumerate()
            .map(|(i, candle)| {
                let seen = i + 1;
                let mut result = PatternResult::default();
                for (period, rsi) in rsis.iter_mut() {
                    let value = rsi.next(candle.close);
                    if seen > *period {
                        result.insert(rsi_key(*period), value);
                    }
                }
                for (period, sma) in smas.iter_mut() {
                    let value = sma.next(candle.close);
                    if seen >= *period {
                        result.insert(sma_key(*period), value);
                    }
                }
                result
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                timestamp: i as i64 * 60_000,
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_one_result_per_candle() {
        let catalog = IndicatorCatalog::default();
        let data = candles(&[100.0; 150]);
        assert_eq!(catalog.evaluate(&data).len(), 150);
        assert!(catalog.evaluate(&[]).is_empty());
    }

    #[test]
    fn test_warmup() {
        let catalog = IndicatorCatalog::new(vec![3], vec![4]);
        let results = catalog.evaluate(&candles(&[1.0, 2.0, 3.0, 4.0, 5.0]));
        assert!(results[2].get(&rsi_key(3)).is_none());
        assert!(results[3].get(&rsi_key(3)).is_some());
        assert!(results[2].get(&sma_key(4)).is_none());
        assert_eq!(results[3].get(&sma_key(4)), Some(2.5));
    }

    #[test]
    fn test_rising_prices_push_rsi_up() {
        let catalog = IndicatorCatalog::new(vec![5], vec![]);
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let results = catalog.evaluate(&candles(&rising));
        let last = results.last().unwrap().get(&rsi_key(5)).unwrap();
        assert!(last > 70.0);
    }

    #[test]
    fn test_zero_period_skipped() {
        let catalog = IndicatorCatalog::new(vec![0, 2], vec![0]);
        let results = catalog.evaluate(&candles(&[1.0, 2.0, 3.0]));
        assert!(results[2].get(&rsi_key(0)).is_none());
        assert!(results[2].get(&rsi_key(2)).is_some());
    }
}
