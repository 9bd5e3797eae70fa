use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::{Pacing, validate_scale};
use crate::dispatch::Dispatch;
use crate::error::ReplayError;
use crate::event::{Event, validate_events};
use crate::report::ResultRecord;

const PROGRESS_EVERY: usize = 100;

/// Итог одного прогона scheduler'а.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    /// Blocking-режим: по одной записи на завершённый dispatch, по index.
    pub records: Vec<ResultRecord>,
    pub total: usize,
    pub dispatched: usize,
    pub elapsed: Duration,
    /// Максимальное отставание старта dispatch от его deadline.
    pub max_lag: Duration,
    /// Пик одновременно выполняющихся dispatch (sequential: не больше 1).
    pub max_inflight: usize,
    pub cancelled: bool,
}

// ═══════════════════════════════════════════════════════════════
//  Scheduler
// ═══════════════════════════════════════════════════════════════

/// Выдаёт события в порядке трассы: событие `i` уходит не раньше
/// `start + offset_i * scale`. Сам ничего не сортирует.
pub struct Scheduler {
    scale: f64,
    pacing: Pacing,
}

impl Scheduler {
    pub fn new(scale: f64, pacing: Pacing) -> Result<Self, ReplayError> {
        validate_scale(scale)?;
        Ok(Self { scale, pacing })
    }

    pub async fn run(
        &self,
        events: &[Event],
        dispatcher: Arc<dyn Dispatch>,
        cancel: CancellationToken,
    ) -> Result<ReplayOutcome, ReplayError> {
        validate_events(events)?;

        let start = Instant::now();
        let mut pace = Pace::new(start, self.scale, events)?;

        let (records, dispatched, max_inflight, cancelled) = match self.pacing {
            Pacing::Sequential => {
                let (records, dispatched, cancelled) =
                    run_sequential(events, &mut pace, dispatcher, &cancel).await;
                (records, dispatched, usize::from(dispatched > 0), cancelled)
            }
            Pacing::Concurrent => run_concurrent(events, &mut pace, dispatcher, &cancel).await,
        };

        if cancelled {
            tracing::warn!(dispatched, total = events.len(), "replay cancelled");
        }

        Ok(ReplayOutcome {
            records,
            total: events.len(),
            dispatched,
            elapsed: start.elapsed(),
            max_lag: pace.max_lag,
            max_inflight,
            cancelled,
        })
    }
}

/// Часы прогона: один `start` на всю трассу, deadline'ы от него.
struct Pace {
    scale: f64,
    deadlines: Vec<Instant>,
    max_lag: Duration,
}

impl Pace {
    /// Все deadline'ы считаются до первой отправки: offset, который не
    /// представим как момент времени, отклоняет трассу целиком.
    fn new(start: Instant, scale: f64, events: &[Event]) -> Result<Self, ReplayError> {
        let deadlines = events
            .iter()
            .enumerate()
            .map(|(i, event)| {
                let offset = event.timestamp_offset * scale;
                Duration::try_from_secs_f64(offset)
                    .ok()
                    .and_then(|d| start.checked_add(d))
                    .ok_or_else(|| {
                        ReplayError::trace(format!(
                            "event {i}: scaled offset {offset}s is out of range"
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { scale, deadlines, max_lag: Duration::ZERO })
    }

    fn offset(&self, event: &Event) -> f64 {
        event.timestamp_offset * self.scale
    }

    /// Дождаться deadline'а события `index`. `false`: прогон отменён.
    async fn wait(&mut self, index: usize, cancel: &CancellationToken) -> bool {
        let deadline = self.deadlines[index];
        if Instant::now() < deadline {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = sleep_until(deadline) => {}
            }
        }
        if cancel.is_cancelled() {
            return false;
        }
        let lag = Instant::now().saturating_duration_since(deadline);
        self.max_lag = self.max_lag.max(lag);
        true
    }
}

fn log_join(joined: Result<(), JoinError>) {
    match joined {
        Err(e) if e.is_panic() => tracing::error!(error = %e, "dispatch task panicked"),
        _ => {}
    }
}

fn progress(dispatched: usize, total: usize) {
    if dispatched % PROGRESS_EVERY == 0 {
        tracing::info!(dispatched, total, "replay progress");
    }
}

/// Следующее событие ждёт завершения текущего dispatch; опоздания не
/// компенсируются пропуском событий.
async fn run_sequential(
    events: &[Event],
    pace: &mut Pace,
    dispatcher: Arc<dyn Dispatch>,
    cancel: &CancellationToken,
) -> (Vec<ResultRecord>, usize, bool) {
    let mut records = Vec::new();
    let mut dispatched = 0;

    for (index, event) in events.iter().enumerate() {
        let offset = pace.offset(event);
        if !pace.wait(index, cancel).await {
            return (records, dispatched, true);
        }

        dispatched += 1;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return (records, dispatched, true),
            record = dispatcher.dispatch(index, offset, event) => {
                records.extend(record);
            }
        }
        progress(dispatched, events.len());
    }

    (records, dispatched, false)
}

/// Каждый dispatch: своя task в момент deadline'а. Записи собираются
/// через один канал и упорядочиваются по index в конце.
async fn run_concurrent(
    events: &[Event],
    pace: &mut Pace,
    dispatcher: Arc<dyn Dispatch>,
    cancel: &CancellationToken,
) -> (Vec<ResultRecord>, usize, usize, bool) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut inflight = JoinSet::new();
    let mut dispatched = 0;
    let mut max_inflight = 0;
    let mut cancelled = false;

    for (index, event) in events.iter().enumerate() {
        let offset = pace.offset(event);
        if !pace.wait(index, cancel).await {
            cancelled = true;
            break;
        }

        // Завершённые task'и не копятся в JoinSet до конца трассы.
        while let Some(joined) = inflight.try_join_next() {
            log_join(joined);
        }

        let dispatcher = dispatcher.clone();
        let event = event.clone();
        let tx = tx.clone();
        inflight.spawn(async move {
            if let Some(record) = dispatcher.dispatch(index, offset, &event).await {
                let _ = tx.send(record);
            }
        });
        dispatched += 1;
        max_inflight = max_inflight.max(inflight.len());
        progress(dispatched, events.len());
    }
    drop(tx);

    if !cancelled {
        tracing::debug!(inflight = inflight.len(), "waiting for in-flight requests");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                joined = inflight.join_next() => match joined {
                    Some(joined) => log_join(joined),
                    None => break,
                },
            }
        }
    }
    inflight.abort_all();

    let mut records = Vec::with_capacity(dispatched);
    while let Ok(record) = rx.try_recv() {
        records.push(record);
    }
    records.sort_by_key(|r| r.index);

    (records, dispatched, max_inflight, cancelled)
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use super::*;

    /// Записывает момент каждого вызова; опционально «обрабатывает» запрос `delay`.
    struct Recording {
        delay: Duration,
        blocking: bool,
        calls: Mutex<Vec<(usize, f64, Instant)>>,
    }

    impl Recording {
        fn new(delay: Duration, blocking: bool) -> Arc<Self> {
            Arc::new(Self { delay, blocking, calls: Mutex::new(Vec::new()) })
        }

        fn calls(&self) -> Vec<(usize, f64, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Dispatch for Recording {
        fn dispatch<'a>(
            &'a self,
            index: usize,
            offset: f64,
            event: &'a Event,
        ) -> Pin<Box<dyn Future<Output = Option<ResultRecord>> + Send + 'a>> {
            Box::pin(async move {
                let started = Instant::now();
                self.calls.lock().unwrap().push((index, offset, started));
                tokio::time::sleep(self.delay).await;
                self.blocking.then(|| {
                    let mut r = ResultRecord::for_event(index, offset, event);
                    r.client_latency = Some(started.elapsed());
                    r.status = Some(200);
                    r
                })
            })
        }
    }

    fn events(offsets: &[f64]) -> Vec<Event> {
        offsets
            .iter()
            .enumerate()
            .map(|(i, &o)| Event::new(o, ((i % 4) + 1).to_string(), "prompt", 100, 10))
            .collect()
    }

    fn assert_near(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        let diff = if actual > expected { actual - expected } else { expected - actual };
        assert!(diff <= Duration::from_millis(2), "expected ~{expected:?}, got {actual:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_in_order_at_scaled_offsets() {
        let rec = Recording::new(Duration::ZERO, true);
        let scheduler = Scheduler::new(0.5, Pacing::Sequential).unwrap();
        let t0 = Instant::now();

        let out = scheduler
            .run(&events(&[0.0, 1.0, 2.5]), rec.clone(), CancellationToken::new())
            .await
            .unwrap();

        let calls = rec.calls();
        assert_eq!(calls.iter().map(|c| c.0).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(calls.iter().map(|c| c.1).collect::<Vec<_>>(), vec![0.0, 0.5, 1.25]);
        assert_near(calls[0].2 - t0, 0);
        assert_near(calls[1].2 - t0, 500);
        assert_near(calls[2].2 - t0, 1250);

        assert_eq!(out.records.len(), 3);
        assert_eq!((out.total, out.dispatched), (3, 3));
        assert!(!out.cancelled);
        assert_near(out.max_lag, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_offsets_fire_back_to_back() {
        let rec = Recording::new(Duration::ZERO, false);
        let scheduler = Scheduler::new(1.0, Pacing::Sequential).unwrap();
        let t0 = Instant::now();

        let out = scheduler
            .run(&events(&[0.0, 0.0, 0.0]), rec.clone(), CancellationToken::new())
            .await
            .unwrap();

        for call in rec.calls() {
            assert_near(call.2 - t0, 0);
        }
        assert_eq!(out.dispatched, 3);
        assert!(out.records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_pacing_drifts_behind_slow_backend() {
        let rec = Recording::new(Duration::from_millis(1500), true);
        let scheduler = Scheduler::new(1.0, Pacing::Sequential).unwrap();
        let t0 = Instant::now();

        let out = scheduler
            .run(&events(&[0.0, 1.0, 2.0]), rec.clone(), CancellationToken::new())
            .await
            .unwrap();

        let calls = rec.calls();
        assert_near(calls[1].2 - t0, 1500);
        assert_near(calls[2].2 - t0, 3000);
        assert_near(out.max_lag, 1000);
        assert_near(out.elapsed, 4500);
        assert_eq!(out.records.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_pacing_keeps_deadlines_and_order() {
        let rec = Recording::new(Duration::from_millis(1500), true);
        let scheduler = Scheduler::new(1.0, Pacing::Concurrent).unwrap();
        let t0 = Instant::now();

        let out = scheduler
            .run(&events(&[0.0, 1.0, 2.0]), rec.clone(), CancellationToken::new())
            .await
            .unwrap();

        let calls = rec.calls();
        assert_eq!(calls.iter().map(|c| c.0).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_near(calls[1].2 - t0, 1000);
        assert_near(calls[2].2 - t0, 2000);
        assert_near(out.max_lag, 0);
        // Last request starts at 2s and takes 1.5s.
        assert_near(out.elapsed, 3500);
        assert_eq!(out.records.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_keeps_partial_records() {
        let rec = Recording::new(Duration::ZERO, true);
        let scheduler = Scheduler::new(1.0, Pacing::Sequential).unwrap();
        let token = CancellationToken::new();

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let out = scheduler
            .run(&events(&[0.0, 1.0, 2.0, 3.0]), rec.clone(), token)
            .await
            .unwrap();

        assert!(out.cancelled);
        assert_eq!(out.dispatched, 2);
        assert_eq!(out.records.len(), 2);
        assert_near(out.elapsed, 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_in_flight_request() {
        let rec = Recording::new(Duration::from_secs(30), true);
        let scheduler = Scheduler::new(1.0, Pacing::Concurrent).unwrap();
        let token = CancellationToken::new();

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let out = scheduler
            .run(&events(&[0.0]), rec.clone(), token)
            .await
            .unwrap();

        assert!(out.cancelled);
        assert_eq!(out.dispatched, 1);
        assert!(out.records.is_empty());
        assert_near(out.elapsed, 200);
    }

    #[tokio::test]
    async fn rejects_unsorted_events_before_dispatch() {
        let rec = Recording::new(Duration::ZERO, true);
        let scheduler = Scheduler::new(1.0, Pacing::Sequential).unwrap();

        let err = scheduler
            .run(&events(&[0.0, 2.0, 1.0]), rec.clone(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReplayError::TraceFormat(_)));
        assert!(rec.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_offset_is_rejected_before_dispatch() {
        let rec = Recording::new(Duration::ZERO, true);

        for (offsets, scale) in [(&[0.0, 1e20][..], 1.0), (&[0.0, 1e19][..], 1.0), (&[0.0, 1e10][..], 1e10)] {
            let scheduler = Scheduler::new(scale, Pacing::Sequential).unwrap();
            let err = scheduler
                .run(&events(offsets), rec.clone(), CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, ReplayError::TraceFormat(_)), "{err}");
            assert!(err.to_string().contains("event 1"), "{err}");
        }
        assert!(rec.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_pacing_reaps_finished_tasks() {
        let rec = Recording::new(Duration::from_millis(100), true);
        let scheduler = Scheduler::new(1.0, Pacing::Concurrent).unwrap();
        let offsets: Vec<f64> = (0..250).map(f64::from).collect();

        let out = scheduler
            .run(&events(&offsets), rec.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.dispatched, 250);
        assert_eq!(out.records.len(), 250);
        assert_eq!(out.max_inflight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_pacing_counts_overlapping_requests() {
        let rec = Recording::new(Duration::from_millis(2500), true);
        let scheduler = Scheduler::new(1.0, Pacing::Concurrent).unwrap();

        let out = scheduler
            .run(&events(&[0.0, 1.0, 2.0, 3.0, 4.0]), rec.clone(), CancellationToken::new())
            .await
            .unwrap();

        // Each request overlaps the next two.
        assert_eq!(out.max_inflight, 3);
        assert_eq!(out.records.len(), 5);
    }

    #[test]
    fn rejects_non_positive_scale() {
        assert!(Scheduler::new(0.0, Pacing::Sequential).is_err());
        assert!(Scheduler::new(-2.0, Pacing::Concurrent).is_err());
    }
}
