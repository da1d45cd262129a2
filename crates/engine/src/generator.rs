//! Random configuration generator for the RSI reversal strategy

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::indicators::{RSI_PERIODS, SMA_PERIODS};
use crate::simulation::ConfigGenerator;
use crate::types::BotConfiguration;

/// Samples configurations on coarse grids (whole RSI levels, 5% sizing
/// steps, 0.5% take-profit steps) so repeats happen and get deduplicated.
pub struct RandomConfigGenerator {
    rng: StdRng,
}

impl RandomConfigGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomConfigGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigGenerator for RandomConfigGenerator {
    fn generate(&mut self) -> BotConfiguration {
        let rng = &mut self.rng;
        BotConfiguration {
            rsi_period: RSI_PERIODS[rng.gen_range(0..RSI_PERIODS.len())],
            rsi_oversold: rng.gen_range(15..=40) as f64,
            rsi_overbought: rng.gen_range(60..=85) as f64,
            trend_sma: rng
                .gen_bool(0.5)
                .then(|| SMA_PERIODS[rng.gen_range(0..SMA_PERIODS.len())]),
            position_size_pct: rng.gen_range(1..=10) as f64 * 5.0,
            take_profit_pct: rng
                .gen_bool(0.5)
                .then(|| rng.gen_range(1..=20) as f64 * 0.5),
            allow_short: rng.gen_bool(0.5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_generators_agree() {
        let mut a = RandomConfigGenerator::with_seed(7);
        let mut b = RandomConfigGenerator::with_seed(7);
        for _ in 0..20 {
            assert_eq!(a.generate(), b.generate());
        }
    }

    #[test]
    fn test_values_stay_in_range() {
        let mut g = RandomConfigGenerator::with_seed(42);
        for _ in 0..500 {
            let c = g.generate();
            assert!(RSI_PERIODS.contains(&c.rsi_period));
            assert!((15.0..=40.0).contains(&c.rsi_oversold));
            assert!((60.0..=85.0).contains(&c.rsi_overbought));
            assert!((5.0..=50.0).contains(&c.position_size_pct));
            if let Some(tp) = c.take_profit_pct {
                assert!((0.5..=10.0).contains(&tp));
            }
            if let Some(sma) = c.trend_sma {
                assert!(SMA_PERIODS.contains(&sma));
            }
        }
    }
}
