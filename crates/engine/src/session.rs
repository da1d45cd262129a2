//! Session lifecycle: the running aggregate over completed runs and the
//! pause / resume / stop protocol between iterations.

use chrono::Utc;
use persistence::{BacktestContext, SessionStatus, SessionStore, SessionSummary};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Control signal delivered to a running orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Stop,
}

/// Channel starting in `Run`. Keep the sender to pause, resume or stop.
pub fn control_channel() -> (watch::Sender<ControlSignal>, watch::Receiver<ControlSignal>) {
    watch::channel(ControlSignal::Run)
}

/// What the loop should do after a pause check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    Stop,
}

/// In-memory aggregate of a session, written out after every run
#[derive(Debug, Clone)]
pub struct SessionAggregate {
    summary: SessionSummary,
    total_profit: f64,
}

impl SessionAggregate {
    pub fn new(ctx: &BacktestContext) -> Self {
        Self {
            summary: SessionSummary::new(ctx.session()),
            total_profit: 0.0,
        }
    }

    /// Continue from a persisted summary so counts and averages carry over
    pub fn resume(mut summary: SessionSummary) -> Self {
        let total_profit = summary.avg_profit * summary.completed_runs as f64;
        summary.current_status = SessionStatus::Running;
        summary.active = true;
        summary.notes = None;
        summary.last_update = Utc::now().timestamp_millis();
        Self {
            summary,
            total_profit,
        }
    }

    /// Fold in a completed run. Ties on best profit keep the earlier config.
    pub fn apply_run(&mut self, config_hash: &str, profit: f64) {
        let s = &mut self.summary;
        s.run_count += 1;
        s.completed_runs += 1;
        self.total_profit += profit;
        s.avg_profit = self.total_profit / s.completed_runs as f64;
        s.current_profit = profit;
        s.last_config_hash = Some(config_hash.to_string());
        if s.best_profit.map_or(true, |best| profit > best) {
            s.best_profit = Some(profit);
            s.best_config_hash = Some(config_hash.to_string());
        }
        s.last_update = Utc::now().timestamp_millis();
    }

    pub fn apply_error(&mut self, message: &str) {
        self.summary.error_count += 1;
        self.summary.notes = Some(message.to_string());
        self.summary.last_update = Utc::now().timestamp_millis();
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.summary.current_status = status;
        self.summary.last_update = Utc::now().timestamp_millis();
    }

    /// Terminal write: the session is no longer driven by anyone
    pub fn finish(&mut self, status: SessionStatus, notes: Option<String>) {
        self.set_status(status);
        self.summary.active = false;
        if notes.is_some() {
            self.summary.notes = notes;
        }
    }

    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    pub fn into_summary(self) -> SessionSummary {
        self.summary
    }
}

/// Reads and writes session summaries and blocks the loop while paused
#[derive(Clone)]
pub struct SessionController {
    sessions: SessionStore,
    poll_interval: Duration,
}

impl SessionController {
    pub fn new(sessions: SessionStore, poll_interval: Duration) -> Self {
        Self {
            sessions,
            poll_interval,
        }
    }

    pub async fn fetch(&self, ctx: &BacktestContext) -> Option<SessionSummary> {
        self.sessions.fetch(ctx).await
    }

    pub async fn list_all(&self) -> Vec<SessionSummary> {
        self.sessions.list_all().await
    }

    /// Unconditional overwrite
    pub async fn update(&self, ctx: &BacktestContext, summary: &SessionSummary) -> bool {
        self.sessions.update(ctx, summary).await
    }

    /// Write the aggregate, keeping a pause or stop that another actor wrote
    /// while the last run was in flight.
    pub async fn publish(&self, ctx: &BacktestContext, aggregate: &mut SessionAggregate) -> bool {
        if aggregate.summary().current_status == SessionStatus::Running {
            if let Some(stored) = self.sessions.fetch(ctx).await {
                if matches!(
                    stored.current_status,
                    SessionStatus::Paused | SessionStatus::Stopped
                ) {
                    aggregate.set_status(stored.current_status);
                }
            }
        }
        self.sessions.update(ctx, aggregate.summary()).await
    }

    /// Between iterations: return at once when nothing asks for a pause,
    /// otherwise wait until resumed or stopped.
    ///
    /// A local pause waits on the control channel only. A pause written to
    /// the store by another process is re-read every `poll_interval`.
    pub async fn await_clearance(
        &self,
        ctx: &BacktestContext,
        aggregate: &mut SessionAggregate,
        control: &mut watch::Receiver<ControlSignal>,
    ) -> Directive {
        let mut waiting = false;
        let mut paused_locally = false;
        let mut channel_open = true;

        loop {
            let local = *control.borrow_and_update();
            if local == ControlSignal::Stop {
                return Directive::Stop;
            }

            let stored = self.sessions.fetch(ctx).await.map(|s| s.current_status);
            if stored == Some(SessionStatus::Stopped) {
                info!(context = %ctx, "Session stopped externally");
                return Directive::Stop;
            }
            // a paused record we wrote ourselves is not a remote pause
            let remote_pause = stored == Some(SessionStatus::Paused) && !paused_locally;

            if local == ControlSignal::Run && !remote_pause {
                if waiting {
                    info!(context = %ctx, "Session resumed");
                    aggregate.set_status(SessionStatus::Running);
                    self.sessions.update(ctx, aggregate.summary()).await;
                }
                return Directive::Continue;
            }

            if local == ControlSignal::Pause {
                if !paused_locally {
                    paused_locally = true;
                    aggregate.set_status(SessionStatus::Paused);
                    self.sessions.update(ctx, aggregate.summary()).await;
                }
            } else {
                paused_locally = false;
            }

            if !waiting {
                waiting = true;
                info!(context = %ctx, remote = remote_pause, "Session paused");
            }

            if local == ControlSignal::Pause {
                if control.changed().await.is_err() {
                    warn!(context = %ctx, "Control channel closed while paused, stopping");
                    return Directive::Stop;
                }
                continue;
            }

            tokio::select! {
                changed = control.changed(), if channel_open => {
                    if changed.is_err() {
                        channel_open = false;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
