//! Backtest Scout: randomized strategy search over historical candles
//!
//! Usage:
//!   backtest-scout run --symbol BTC/USDT --timeframe 1h --start 2024-01-01 --end 2024-03-01
//!   backtest-scout sessions
//!   backtest-scout runs --symbol BTC/USDT --timeframe 1h --start 2024-01-01 --end 2024-03-01
//!   backtest-scout control pause --symbol BTC/USDT ...
//!   backtest-scout serve --port 3002

use axum::{
    extract::{Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use engine::{
    control_channel, BinanceClient, CandleSource, Collaborators, ControlSignal, FileCandleSource,
    OrchestratorConfig, PaperMarketConfig, RunOrchestrator,
};
use persistence::{
    BacktestContext, BacktestRunRecord, KvStore, RunListFilter, RunRegistry, RunStatus,
    SessionStatus, SessionStore, SessionSummary, TradeStore,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_DB_PATH: &str = "data/scout.db";

#[derive(Parser)]
#[command(name = "backtest-scout")]
#[command(about = "Randomized strategy search with cross-worker run dedup", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Identifies a session: instrument, timeframe and date range
#[derive(Args, Clone)]
struct ContextArgs {
    /// Instrument, e.g. BTC/USDT
    #[arg(long)]
    symbol: String,
    /// Candle timeframe, e.g. 1h
    #[arg(long, default_value = "1h")]
    timeframe: String,
    /// Range start: YYYY-MM-DD or epoch milliseconds
    #[arg(long, value_parser = parse_timestamp)]
    start: i64,
    /// Range end: YYYY-MM-DD or epoch milliseconds
    #[arg(long, value_parser = parse_timestamp)]
    end: i64,
}

impl ContextArgs {
    fn context(&self) -> BacktestContext {
        BacktestContext::new(&self.symbol, &self.timeframe, self.start, self.end)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ControlAction {
    Pause,
    Resume,
    Stop,
}

impl ControlAction {
    fn status(self) -> SessionStatus {
        match self {
            ControlAction::Pause => SessionStatus::Paused,
            ControlAction::Resume => SessionStatus::Running,
            ControlAction::Stop => SessionStatus::Stopped,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the search loop for one session until stopped (Ctrl+C)
    Run {
        #[command(flatten)]
        context: ContextArgs,
        /// Stop after this many completed runs
        #[arg(long)]
        max_runs: Option<u64>,
        /// Seed for the configuration generator
        #[arg(long)]
        seed: Option<u64>,
        /// Starting quote balance of every simulated bot
        #[arg(long, default_value_t = 10_000.0)]
        initial_balance: f64,
        /// Taker fee rate (0.0004 = 4 bps)
        #[arg(long, default_value_t = 0.0004)]
        taker_fee: f64,
        /// Read candles from a JSON file instead of Binance
        #[arg(long)]
        candles_file: Option<PathBuf>,
        /// Number of top runs to print at the end
        #[arg(long, default_value_t = 10)]
        top_n: usize,
    },
    /// List every known session
    Sessions,
    /// List the runs of a session
    Runs {
        #[command(flatten)]
        context: ContextArgs,
        /// Only runs with this status (running, completed, failed)
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long)]
        min_profit: Option<f64>,
        #[arg(long)]
        max_profit: Option<f64>,
        /// Rank by profit instead of listing in index order
        #[arg(long)]
        top: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Pause, resume or stop a session driven by another process
    Control {
        action: ControlAction,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Delete one run record so its configuration can be tried again
    DeleteRun {
        #[command(flatten)]
        context: ContextArgs,
        /// Config hash of the run
        #[arg(long)]
        hash: String,
    },
    /// Launch the read/control HTTP API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3002)]
        port: u16,
    },
}

#[derive(Clone)]
struct AppState {
    sessions: SessionStore,
    registry: RunRegistry,
    trades: TradeStore,
}

impl AppState {
    fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            sessions: SessionStore::new(store.clone()),
            registry: RunRegistry::new(store.clone()),
            trades: TradeStore::new(store),
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("info,engine=debug,persistence=debug,backtest_scout=debug")
    } else {
        EnvFilter::new("info,engine=info,persistence=info,backtest_scout=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

/// `YYYY-MM-DD` (UTC midnight) or raw epoch milliseconds
fn parse_timestamp(s: &str) -> Result<i64, String> {
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD or epoch ms, got {s:?}: {e}"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| format!("invalid date {s:?}"))?;
    Ok(Utc.from_utc_datetime(&midnight).timestamp_millis())
}

async fn open_store() -> anyhow::Result<Arc<dyn KvStore>> {
    let db_path =
        std::env::var("BACKTEST_SCOUT_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let db = persistence::Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!(path = %db_path, "Database opened");

    let store = db.store();
    match store.purge_expired().await {
        Ok(0) => {}
        Ok(purged) => info!(purged, "Removed expired run claims"),
        Err(e) => warn!(error = %e, "Failed to purge expired entries"),
    }
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Run {
            context,
            max_runs,
            seed,
            initial_balance,
            taker_fee,
            candles_file,
            top_n,
        } => {
            let config = OrchestratorConfig {
                initial_balance,
                max_runs,
                ..OrchestratorConfig::default()
            };
            let market = PaperMarketConfig {
                taker_fee_rate: taker_fee,
                ..PaperMarketConfig::default()
            };
            cmd_run(context.context(), config, market, seed, candles_file, top_n).await?;
        }
        Commands::Sessions => {
            cmd_sessions().await?;
        }
        Commands::Runs {
            context,
            status,
            min_profit,
            max_profit,
            top,
            limit,
        } => {
            let filter = RunListFilter {
                status,
                min_profit,
                max_profit,
            };
            cmd_runs(context.context(), filter, top, limit).await?;
        }
        Commands::Control { action, context } => {
            cmd_control(context.context(), action).await?;
        }
        Commands::DeleteRun { context, hash } => {
            cmd_delete_run(context.context().with_config_hash(hash)).await?;
        }
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Run command: the search loop
// ============================================================================

async fn cmd_run(
    ctx: BacktestContext,
    config: OrchestratorConfig,
    market: PaperMarketConfig,
    seed: Option<u64>,
    candles_file: Option<PathBuf>,
    top_n: usize,
) -> anyhow::Result<()> {
    println!("\n=== Backtest Scout v{} ===", APP_VERSION);
    println!("Session: {}", ctx);

    let store = open_store().await?;
    let candles: Arc<dyn CandleSource> = match candles_file {
        Some(path) => Arc::new(FileCandleSource::new(path)),
        None => Arc::new(BinanceClient::new()?),
    };

    let (control, receiver) = control_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping after the current run");
            control.send(ControlSignal::Stop).ok();
        }
    });

    let collaborators = Collaborators::reference(candles, market, seed);
    let mut orchestrator = RunOrchestrator::new(config, store.clone(), collaborators);
    let summary = orchestrator.run(&ctx, receiver).await?;

    print_summary(&summary);
    if orchestrator.skipped_iterations() > 0 {
        println!(
            "  Skipped iterations (no unused config): {}",
            orchestrator.skipped_iterations()
        );
    }

    let top = RunRegistry::new(store).top_by_profit(&ctx, top_n).await?;
    print_runs(&top);
    Ok(())
}

fn print_summary(summary: &SessionSummary) {
    println!("\nSession {}", summary.context);
    println!("  Status:          {}", summary.current_status);
    println!("  Completed runs:  {}", summary.completed_runs);
    println!("  Errors:          {}", summary.error_count);
    println!("  Avg profit:      {:+.2}", summary.avg_profit);
    match (summary.best_profit, &summary.best_config_hash) {
        (Some(best), Some(hash)) => println!("  Best profit:     {:+.2} ({})", best, short_hash(hash)),
        _ => println!("  Best profit:     -"),
    }
    if let Some(notes) = &summary.notes {
        println!("  Notes:           {}", notes);
    }
}

fn print_runs(records: &[BacktestRunRecord]) {
    println!("\nRuns ({}):", records.len());
    println!(
        "  {:>3}  {:<14} {:<10} {:>10} {:>7} {:>7} {:>7}",
        "#", "Config", "Status", "Profit", "Trades", "WR%", "Sharpe"
    );
    println!("  {}", "-".repeat(66));
    for (i, r) in records.iter().enumerate() {
        let perf = r
            .results_metadata
            .as_ref()
            .and_then(|m| m.get("performance"));
        let metric = |name: &str| perf.and_then(|p| p.get(name)).and_then(|v| v.as_f64());
        println!(
            "  {:>3}  {:<14} {:<10} {:>+10.2} {:>7} {:>6.1}% {:>7.2}",
            i + 1,
            short_hash(&r.config_hash),
            r.status,
            r.profit.unwrap_or(0.0),
            metric("num_trades").unwrap_or(0.0) as u64,
            metric("win_rate").unwrap_or(0.0) * 100.0,
            metric("sharpe_ratio").unwrap_or(0.0),
        );
    }
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}

// ============================================================================
// Read and control commands
// ============================================================================

async fn cmd_sessions() -> anyhow::Result<()> {
    let store = open_store().await?;
    let sessions = SessionStore::new(store).list_all().await;

    println!("\nSessions ({}):", sessions.len());
    println!(
        "  {:<40} {:<10} {:>6} {:>10} {:>10} {:>6}",
        "Context", "Status", "Runs", "Best", "Avg", "Errors"
    );
    println!("  {}", "-".repeat(88));
    for s in &sessions {
        println!(
            "  {:<40} {:<10} {:>6} {:>10} {:>+10.2} {:>6}",
            s.context.to_string(),
            s.current_status,
            s.completed_runs,
            s.best_profit
                .map(|p| format!("{:+.2}", p))
                .unwrap_or_else(|| "-".to_string()),
            s.avg_profit,
            s.error_count,
        );
    }
    Ok(())
}

async fn cmd_runs(
    ctx: BacktestContext,
    filter: RunListFilter,
    top: bool,
    limit: usize,
) -> anyhow::Result<()> {
    let store = open_store().await?;
    let registry = RunRegistry::new(store);

    if top {
        let records = registry.top_by_profit(&ctx, limit).await?;
        print_runs(&records);
        return Ok(());
    }

    let page = registry.list_by_context(&ctx, &filter, 0, limit).await?;
    print_runs(&page.records);
    if page.next_cursor.is_some() {
        println!("  ... {} indexed runs in total", page.total);
    }
    Ok(())
}

async fn cmd_control(ctx: BacktestContext, action: ControlAction) -> anyhow::Result<()> {
    let store = open_store().await?;
    let status = action.status();
    if SessionStore::new(store).set_status(&ctx, status).await {
        info!(context = %ctx, %status, "Session status written");
        Ok(())
    } else {
        anyhow::bail!("No session found for {}", ctx)
    }
}

async fn cmd_delete_run(ctx: BacktestContext) -> anyhow::Result<()> {
    let store = open_store().await?;
    if RunRegistry::new(store).delete(&ctx).await {
        info!(context = %ctx, "Run deleted");
        Ok(())
    } else {
        anyhow::bail!("No run found for {}", ctx)
    }
}

// ============================================================================
// Serve command: Axum HTTP API
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Backtest Scout v{} starting...", APP_VERSION);

    let state = AppState::new(open_store().await?);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/sessions", get(api_sessions))
        .route("/session", get(api_session))
        .route("/session/pause", post(api_session_pause))
        .route("/session/resume", post(api_session_resume))
        .route("/session/stop", post(api_session_stop))
        .route("/runs", get(api_runs))
        .route("/run", get(api_run))
        .route("/trades", get(api_trades))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Backtest Scout v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints (session selected by symbol, timeframe, start, end):");
    println!("  GET  /api/health              - Health check");
    println!("  GET  /api/sessions            - All sessions");
    println!("  GET  /api/session             - One session summary");
    println!("  POST /api/session/pause       - Pause a session");
    println!("  POST /api/session/resume      - Resume a session");
    println!("  POST /api/session/stop        - Stop a session");
    println!("  GET  /api/runs                - Runs of a session (status, min_profit, max_profit, cursor, limit, top)");
    println!("  GET  /api/run                 - One run (hash)");
    println!("  GET  /api/trades              - Trades of one run (hash)");
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

type Params = HashMap<String, String>;

fn context_from(params: &Params) -> Result<BacktestContext, String> {
    let field = |name: &str| {
        params
            .get(name)
            .ok_or_else(|| format!("missing query parameter: {name}"))
    };
    let ctx = BacktestContext::new(
        field("symbol")?,
        field("timeframe")?,
        parse_timestamp(field("start")?)?,
        parse_timestamp(field("end")?)?,
    );
    Ok(match params.get("hash") {
        Some(hash) => ctx.with_config_hash(hash),
        None => ctx,
    })
}

fn bad_request(message: String) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": false,
        "error": message,
    }))
}

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "backtest-scout",
        "version": APP_VERSION,
    }))
}

/// GET /api/sessions
async fn api_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.sessions.list_all().await;
    Json(serde_json::json!({
        "success": true,
        "data": sessions,
        "total": sessions.len(),
    }))
}

/// GET /api/session
async fn api_session(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Json<serde_json::Value> {
    let ctx = match context_from(&params) {
        Ok(ctx) => ctx,
        Err(e) => return bad_request(e),
    };
    match state.sessions.fetch(&ctx).await {
        Some(summary) => Json(serde_json::json!({
            "success": true,
            "session": summary,
        })),
        None => Json(serde_json::json!({
            "success": false,
            "error": format!("No session for {}", ctx),
        })),
    }
}

async fn set_session_status(
    state: &AppState,
    params: &Params,
    status: SessionStatus,
) -> Json<serde_json::Value> {
    let ctx = match context_from(params) {
        Ok(ctx) => ctx,
        Err(e) => return bad_request(e),
    };
    if state.sessions.set_status(&ctx, status).await {
        info!(context = %ctx, %status, "Session status set via API");
        Json(serde_json::json!({
            "success": true,
            "status": status,
        }))
    } else {
        Json(serde_json::json!({
            "success": false,
            "error": format!("No session for {}", ctx),
        }))
    }
}

/// POST /api/session/pause
async fn api_session_pause(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Json<serde_json::Value> {
    set_session_status(&state, &params, SessionStatus::Paused).await
}

/// POST /api/session/resume
async fn api_session_resume(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Json<serde_json::Value> {
    set_session_status(&state, &params, SessionStatus::Running).await
}

/// POST /api/session/stop
async fn api_session_stop(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Json<serde_json::Value> {
    set_session_status(&state, &params, SessionStatus::Stopped).await
}

/// GET /api/runs: paginated runs of a session with filters, or `top=true` by profit
async fn api_runs(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Json<serde_json::Value> {
    let ctx = match context_from(&params) {
        Ok(ctx) => ctx.session(),
        Err(e) => return bad_request(e),
    };
    let limit: usize = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);
    let cursor: usize = params
        .get("cursor")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    if params.get("top").is_some_and(|v| v == "true") {
        return match state.registry.top_by_profit(&ctx, limit).await {
            Ok(records) => Json(serde_json::json!({
                "success": true,
                "data": records,
                "total": records.len(),
            })),
            Err(e) => bad_request(format!("Failed to rank runs: {}", e)),
        };
    }

    let filter = RunListFilter {
        status: params.get("status").and_then(|s| s.parse().ok()),
        min_profit: params.get("min_profit").and_then(|s| s.parse().ok()),
        max_profit: params.get("max_profit").and_then(|s| s.parse().ok()),
    };
    match state.registry.list_by_context(&ctx, &filter, cursor, limit).await {
        Ok(page) => Json(serde_json::json!({
            "success": true,
            "data": page.records,
            "next_cursor": page.next_cursor,
            "total": page.total,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to list runs: {}", e),
            "data": [],
            "total": 0,
        })),
    }
}

/// GET /api/run
async fn api_run(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Json<serde_json::Value> {
    let ctx = match context_from(&params) {
        Ok(ctx) if ctx.config_hash.is_some() => ctx,
        Ok(_) => return bad_request("missing query parameter: hash".to_string()),
        Err(e) => return bad_request(e),
    };
    match state.registry.get(&ctx).await {
        Some(record) => Json(serde_json::json!({
            "success": true,
            "run": record,
        })),
        None => Json(serde_json::json!({
            "success": false,
            "error": format!("No run for {}", ctx),
        })),
    }
}

/// GET /api/trades
async fn api_trades(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Json<serde_json::Value> {
    let ctx = match context_from(&params) {
        Ok(ctx) if ctx.config_hash.is_some() => ctx,
        Ok(_) => return bad_request("missing query parameter: hash".to_string()),
        Err(e) => return bad_request(e),
    };
    match state.trades.load(&ctx).await {
        Ok(trades) => Json(serde_json::json!({
            "success": true,
            "data": trades,
            "total": trades.len(),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to load trades: {}", e),
            "data": [],
        })),
    }
}
