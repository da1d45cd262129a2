//! Backtest Scout engine: randomized strategy search over historical candles
//!
//! Provides:
//! - Run orchestrator with configuration dedup across workers
//! - Session aggregation and pause / resume / stop control
//! - Trade lifecycle detection and performance metrics
//! - Reference paper market, RSI strategy and random config generator
//! - Binance public API and JSON file candle sources

pub mod api;
pub mod detector;
pub mod fingerprint;
pub mod generator;
pub mod indicators;
pub mod orchestrator;
pub mod paper;
pub mod performance;
pub mod session;
pub mod simulation;
pub mod strategy;
pub mod types;

// Re-exports for convenience
pub use api::{BinanceClient, FileCandleSource};
pub use detector::TradeLifecycleDetector;
pub use fingerprint::{fingerprint, fingerprint_value};
pub use generator::RandomConfigGenerator;
pub use indicators::IndicatorCatalog;
pub use orchestrator::{Collaborators, OrchestratorConfig, OrchestratorError, RunOrchestrator};
pub use paper::{PaperMarket, PaperMarketConfig, PaperMarketFactory};
pub use performance::{max_drawdown, PerformanceCalculator, PerformanceMetrics};
pub use session::{control_channel, ControlSignal, Directive, SessionAggregate, SessionController};
pub use simulation::{
    CandleSource, ConfigGenerator, EvaluatorFactory, MarketSimulator, PatternCatalog,
    SignalEvaluator, SimulatorFactory,
};
pub use strategy::{RsiReversalFactory, RsiReversalStrategy};
pub use types::*;
