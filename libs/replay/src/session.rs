use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ReplayConfig;
use crate::dispatch::{Dispatch, HttpDispatcher};
use crate::error::ReplayError;
use crate::event::{Event, validate_events};
use crate::report::{ReportStatus, Summary, emit_report};
use crate::scheduler::{ReplayOutcome, Scheduler};

/// Всё, что остаётся после прогона.
#[derive(Debug)]
pub struct ReplayRun {
    pub outcome: ReplayOutcome,
    pub summary: Summary,
    pub report: ReportStatus,
}

/// Прогнать события против HTTP endpoint'а из `config`.
///
/// Ошибки конфигурации и трассы возвращаются до первой отправки.
/// Ошибка записи отчёта в результат не превращается: см. `ReplayRun::report`.
pub async fn run(
    events: &[Event],
    config: &ReplayConfig,
    cancel: CancellationToken,
) -> Result<ReplayRun, ReplayError> {
    config.validate()?;
    validate_events(events)?;

    let dispatcher = HttpDispatcher::new(config)?;
    tracing::info!(
        url = %dispatcher.url(),
        scale = config.scale,
        mode = %config.mode,
        pacing = %config.pacing,
        timeout = ?config.timeout,
        events = events.len(),
        "starting replay"
    );

    run_with(events, config, Arc::new(dispatcher), cancel).await
}

/// То же, что [`run`], но с произвольным dispatcher'ом.
pub async fn run_with(
    events: &[Event],
    config: &ReplayConfig,
    dispatcher: Arc<dyn Dispatch>,
    cancel: CancellationToken,
) -> Result<ReplayRun, ReplayError> {
    let scheduler = Scheduler::new(config.scale, config.pacing)?;
    let outcome = scheduler.run(events, dispatcher, cancel).await?;

    tracing::info!(
        elapsed_secs = outcome.elapsed.as_secs_f64(),
        dispatched = outcome.dispatched,
        total = outcome.total,
        cancelled = outcome.cancelled,
        "replay finished"
    );

    let summary = Summary::from_outcome(&outcome);
    let report = emit_report(config.mode, config.output.as_deref(), &outcome.records);

    Ok(ReplayRun { outcome, summary, report })
}
