//! Run orchestrator: the long-running loop of one backtest session.
//!
//! Each iteration generates a configuration, claims it in the run registry,
//! replays the session's candles through a fresh simulator and records the
//! outcome. Candles and indicator series are loaded once per session.

use anyhow::Context;
use persistence::{
    BacktestContext, KvStore, RunCompletion, RunRegistry, RunStatus, SessionStatus, SessionStore,
    SessionSummary, TradeStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::detector::TradeLifecycleDetector;
use crate::fingerprint::fingerprint;
use crate::generator::RandomConfigGenerator;
use crate::indicators::IndicatorCatalog;
use crate::paper::{PaperMarketConfig, PaperMarketFactory};
use crate::performance::{PerformanceCalculator, PerformanceMetrics};
use crate::session::{ControlSignal, Directive, SessionAggregate, SessionController};
use crate::simulation::{
    CandleSource, ConfigGenerator, EvaluatorFactory, MarketSimulator, PatternCatalog,
    SimulatorFactory,
};
use crate::strategy::RsiReversalFactory;
use crate::types::{BotConfiguration, Candle, OrderSide, PatternResult, PositionSnapshot};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub initial_balance: f64,
    /// Generations tried per iteration before giving up on a unique config
    pub max_dedup_attempts: u32,
    /// Lifetime of a `running` claim; an abandoned claim frees up after it
    pub claim_ttl: Duration,
    /// How often a pause written by another process is re-read
    pub poll_interval: Duration,
    /// Stop with `completed` after this many runs in this invocation
    pub max_runs: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            max_dedup_attempts: 10,
            claim_ttl: persistence::DEFAULT_CLAIM_TTL,
            poll_interval: Duration::from_secs(2),
            max_runs: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no candles available for {0}")]
    NoCandles(String),

    #[error("failed to construct simulator: {0}")]
    Simulator(String),
}

/// Everything the loop drives but does not own
pub struct Collaborators {
    pub candles: Arc<dyn CandleSource>,
    pub patterns: Arc<dyn PatternCatalog>,
    pub generator: Box<dyn ConfigGenerator>,
    pub simulators: Arc<dyn SimulatorFactory>,
    pub evaluators: Arc<dyn EvaluatorFactory>,
}

impl Collaborators {
    /// Paper market, RSI reversal strategy and random configurations
    pub fn reference(
        candles: Arc<dyn CandleSource>,
        market: PaperMarketConfig,
        seed: Option<u64>,
    ) -> Self {
        let generator = match seed {
            Some(seed) => RandomConfigGenerator::with_seed(seed),
            None => RandomConfigGenerator::new(),
        };
        Self {
            candles,
            patterns: Arc::new(IndicatorCatalog::default()),
            generator: Box::new(generator),
            simulators: Arc::new(PaperMarketFactory { config: market }),
            evaluators: Arc::new(RsiReversalFactory),
        }
    }
}

/// Stored as `results_metadata` on a completed run
#[derive(Debug, Serialize)]
struct RunResults<'a> {
    performance: &'a PerformanceMetrics,
    fills: usize,
    trades: usize,
    open_position: Option<PositionSnapshot>,
    market_history: &'a [Candle],
}

/// A configuration this worker has claimed (or is running unclaimed)
struct ClaimedRun {
    config: BotConfiguration,
    configuration: serde_json::Value,
    config_hash: String,
    bot_id: String,
    ctx: BacktestContext,
    market: Box<dyn MarketSimulator>,
}

enum IterationOutcome {
    Completed { config_hash: String, profit: f64 },
    Skipped,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct RunOrchestrator {
    config: OrchestratorConfig,
    registry: RunRegistry,
    trades: TradeStore,
    sessions: SessionController,
    collaborators: Collaborators,
    skipped_iterations: u64,
}

impl RunOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn KvStore>,
        collaborators: Collaborators,
    ) -> Self {
        let sessions = SessionController::new(SessionStore::new(store.clone()), config.poll_interval);
        Self {
            registry: RunRegistry::new(store.clone()),
            trades: TradeStore::new(store),
            sessions,
            collaborators,
            skipped_iterations: 0,
            config,
        }
    }

    /// Iterations abandoned because no unused configuration turned up
    pub fn skipped_iterations(&self) -> u64 {
        self.skipped_iterations
    }

    /// Drive the session until stopped, `max_runs` is reached, or a run fails
    pub async fn run(
        &mut self,
        ctx: &BacktestContext,
        mut control: watch::Receiver<ControlSignal>,
    ) -> anyhow::Result<SessionSummary> {
        let ctx = ctx.session();

        let candles = self.collaborators.candles.fetch_candles(&ctx).await?;
        if candles.is_empty() {
            return Err(OrchestratorError::NoCandles(ctx.to_string()).into());
        }
        let patterns = self.collaborators.patterns.evaluate(&candles);

        let mut aggregate = match self.sessions.fetch(&ctx).await {
            Some(previous) => {
                info!(
                    context = %ctx,
                    completed_runs = previous.completed_runs,
                    "Resuming session"
                );
                SessionAggregate::resume(previous)
            }
            None => SessionAggregate::new(&ctx),
        };
        self.sessions.update(&ctx, aggregate.summary()).await;

        info!(
            context = %ctx,
            bars = candles.len(),
            initial_balance = self.config.initial_balance,
            max_runs = ?self.config.max_runs,
            "Starting backtest session"
        );

        let mut runs = 0u64;
        let final_status = loop {
            if *control.borrow() == ControlSignal::Stop {
                break SessionStatus::Stopped;
            }
            if self.config.max_runs.is_some_and(|max| runs >= max) {
                break SessionStatus::Completed;
            }

            match self.run_iteration(&ctx, &candles, &patterns).await {
                Ok(IterationOutcome::Completed {
                    config_hash,
                    profit,
                }) => {
                    runs += 1;
                    aggregate.apply_run(&config_hash, profit);
                    self.sessions.publish(&ctx, &mut aggregate).await;
                    info!(
                        run = aggregate.summary().completed_runs,
                        profit,
                        best = ?aggregate.summary().best_profit,
                        "Run completed"
                    );
                }
                Ok(IterationOutcome::Skipped) => {
                    self.skipped_iterations += 1;
                }
                Err(e) => {
                    error!(context = %ctx, error = %e, "Session aborted");
                    aggregate.apply_error(&e.to_string());
                    aggregate.finish(SessionStatus::Failed, Some(format!("{e:#}")));
                    self.sessions.update(&ctx, aggregate.summary()).await;
                    return Err(e);
                }
            }

            match self
                .sessions
                .await_clearance(&ctx, &mut aggregate, &mut control)
                .await
            {
                Directive::Continue => {}
                Directive::Stop => break SessionStatus::Stopped,
            }
        };

        aggregate.finish(final_status, None);
        self.sessions.update(&ctx, aggregate.summary()).await;
        info!(
            context = %ctx,
            status = %final_status,
            runs,
            skipped = self.skipped_iterations,
            "Session finished"
        );
        Ok(aggregate.into_summary())
    }

    async fn run_iteration(
        &mut self,
        ctx: &BacktestContext,
        candles: &[Candle],
        patterns: &[PatternResult],
    ) -> anyhow::Result<IterationOutcome> {
        let Some(claimed) = self.claim_configuration(ctx).await? else {
            warn!(
                context = %ctx,
                attempts = self.config.max_dedup_attempts,
                "No unused configuration found, skipping iteration"
            );
            return Ok(IterationOutcome::Skipped);
        };

        let ClaimedRun {
            config,
            configuration,
            config_hash,
            bot_id,
            ctx: run_ctx,
            mut market,
        } = claimed;

        let simulated = self.simulate(&config, &bot_id, market.as_mut(), candles, patterns);
        let (metrics, results, trades) = match simulated {
            Ok(outcome) => outcome,
            Err(e) => {
                self.registry
                    .record_completion(
                        &run_ctx,
                        RunCompletion {
                            bot_id,
                            status: RunStatus::Failed,
                            configuration: Some(configuration),
                            results_metadata: None,
                            profit: None,
                            error: Some(format!("{e:#}")),
                        },
                    )
                    .await;
                return Err(e);
            }
        };

        self.registry
            .record_completion(
                &run_ctx,
                RunCompletion {
                    bot_id,
                    status: RunStatus::Completed,
                    configuration: Some(configuration),
                    results_metadata: Some(results),
                    profit: Some(metrics.profit),
                    error: None,
                },
            )
            .await;
        self.trades.save(&run_ctx, &trades).await;

        Ok(IterationOutcome::Completed {
            config_hash,
            profit: metrics.profit,
        })
    }

    /// Find a configuration nobody has run, build its simulator and claim it.
    /// `None` once `max_dedup_attempts` generations all collided.
    async fn claim_configuration(
        &mut self,
        ctx: &BacktestContext,
    ) -> anyhow::Result<Option<ClaimedRun>> {
        for attempt in 1..=self.config.max_dedup_attempts {
            let config = self.collaborators.generator.generate();
            let config_hash = fingerprint(&config).context("fingerprinting configuration")?;
            let run_ctx = ctx.with_config_hash(&config_hash);

            let status = self.registry.check_status(&run_ctx).await;
            if status != RunStatus::NotFound {
                debug!(attempt, %status, hash = %config_hash, "Configuration already tried");
                continue;
            }

            let configuration =
                serde_json::to_value(&config).context("serializing configuration")?;
            let bot_id = format!("bot-{}", config_hash.chars().take(12).collect::<String>());
            let market = self
                .collaborators
                .simulators
                .create(&bot_id, &config, self.config.initial_balance)
                .map_err(|e| OrchestratorError::Simulator(format!("{e:#}")))?;

            if !self
                .registry
                .record_start(&run_ctx, &bot_id, self.config.claim_ttl)
                .await
            {
                if self.registry.check_status(&run_ctx).await != RunStatus::NotFound {
                    debug!(attempt, hash = %config_hash, "Lost claim race");
                    continue;
                }
                warn!(hash = %config_hash, "Claim not persisted, running unclaimed");
            }

            return Ok(Some(ClaimedRun {
                config,
                configuration,
                config_hash,
                bot_id,
                ctx: run_ctx,
                market,
            }));
        }
        Ok(None)
    }

    /// Replay every candle through the market and strategy.
    /// Returns the metrics, the serialized results and the trade list.
    fn simulate(
        &self,
        config: &BotConfiguration,
        bot_id: &str,
        market: &mut dyn MarketSimulator,
        candles: &[Candle],
        patterns: &[PatternResult],
    ) -> anyhow::Result<(PerformanceMetrics, serde_json::Value, Vec<persistence::Trade>)> {
        let mut evaluator = self.collaborators.evaluators.create(config);
        let mut detector = TradeLifecycleDetector::new();
        let mut fills = 0usize;
        let empty = PatternResult::default();

        for (i, candle) in candles.iter().enumerate() {
            let pattern = patterns.get(i).unwrap_or(&empty);

            market.check_limit_order_fills_against_price(candle.low, candle.timestamp, OrderSide::Buy);
            market.check_limit_order_fills_against_price(
                candle.high,
                candle.timestamp,
                OrderSide::Sell,
            );
            // limit fills settle before the strategy acts on this candle
            let settled = market.drain_fills();
            if !settled.is_empty() {
                fills += settled.len();
                detector.observe(candle.timestamp, candle.close, &market.position(bot_id));
            }

            evaluator
                .evaluate_signals_and_trade(candle.timestamp, candle.close, pattern, bot_id, market)
                .with_context(|| format!("evaluating signals at {}", candle.timestamp))?;
            market.update(candle);
            fills += market.drain_fills().len();

            detector.observe(candle.timestamp, candle.close, &market.position(bot_id));
        }

        let Some(last) = candles.last() else {
            anyhow::bail!(OrchestratorError::NoCandles(bot_id.to_string()));
        };
        let position = market.position(bot_id);
        let open_position = (!position.is_flat()).then_some(position);
        let trades = detector.finish(last.timestamp, last.close);
        let closed: Vec<persistence::Trade> = trades
            .iter()
            .filter(|t| !t.marked_to_market)
            .cloned()
            .collect();

        let metrics = PerformanceCalculator::calculate(
            &closed,
            self.config.initial_balance,
            market.quote_balance(bot_id),
            open_position.as_ref(),
        );
        let results = serde_json::to_value(RunResults {
            performance: &metrics,
            fills,
            trades: trades.len(),
            open_position,
            market_history: candles,
        })?;

        debug!(
            bot_id,
            trades = trades.len(),
            fills,
            profit = metrics.profit,
            "Simulation finished"
        );
        Ok((metrics, results, trades))
    }
}
