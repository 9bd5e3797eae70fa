use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bucket::percentile;
use crate::config::DispatchMode;
use crate::csv::format_row;
use crate::error::{DispatchError, ReplayError};
use crate::event::Event;
use crate::scheduler::ReplayOutcome;

// ═══════════════════════════════════════════════════════════════
//  ResultRecord
// ═══════════════════════════════════════════════════════════════

/// Результат одного blocking-запроса. Создаётся по завершении dispatch
/// и больше не изменяется.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    /// Позиция события в трассе (для упорядочивания при concurrent pacing).
    pub index: usize,
    /// Масштабированный offset: то же значение, что ушло в payload.
    pub offset: f64,
    pub bucket_id: String,
    pub context_tokens: u64,
    pub generated_tokens: u64,
    /// От момента перед отправкой до получения тела ответа.
    pub client_latency: Option<Duration>,
    /// Поле `duration` из JSON-ответа, если было.
    pub server_duration_ms: Option<f64>,
    pub status: Option<u16>,
    pub error: Option<DispatchError>,
}

impl ResultRecord {
    /// Пустая запись для события: ни latency, ни статуса.
    pub fn for_event(index: usize, offset: f64, event: &Event) -> Self {
        Self {
            index,
            offset,
            bucket_id: event.bucket_id.clone(),
            context_tokens: event.context_tokens,
            generated_tokens: event.generated_tokens,
            client_latency: None,
            server_duration_ms: None,
            status: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.is_some_and(|s| (200..300).contains(&s))
    }

    fn cells(&self) -> [Option<String>; 8] {
        [
            Some(self.offset.to_string()),
            Some(self.bucket_id.clone()),
            Some(self.context_tokens.to_string()),
            Some(self.generated_tokens.to_string()),
            self.client_latency.map(|d| format!("{:.6}", d.as_secs_f64())),
            self.server_duration_ms.map(|d| d.to_string()),
            self.status.map(|s| s.to_string()),
            self.error.as_ref().map(|e| e.to_string()),
        ]
    }
}

// ═══════════════════════════════════════════════════════════════
//  CSV report
// ═══════════════════════════════════════════════════════════════

pub const REPORT_COLUMNS: [&str; 8] = [
    "rel_timestamp",
    "bucket_id",
    "context_tokens",
    "generated_tokens",
    "client_latency_sec",
    "server_duration_ms",
    "status_code",
    "error",
];

/// Записать отчёт: сначала во временный файл рядом, затем rename,
/// прерванный прогон не оставляет обрезанный CSV.
pub fn write_report(path: &Path, records: &[ResultRecord]) -> Result<usize, ReplayError> {
    let io_err = |source: std::io::Error| ReplayError::ReportWrite {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp = tmp_path(path);
    let result = (|| {
        let file = std::fs::File::create(&tmp)?;
        let mut out = std::io::BufWriter::new(file);
        writeln!(out, "{}", REPORT_COLUMNS.join(","))?;
        for record in records {
            writeln!(out, "{}", format_row(&record.cells()))?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        std::fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(e));
    }
    Ok(records.len())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Что случилось с CSV в конце прогона.
#[derive(Debug)]
pub enum ReportStatus {
    Written { path: PathBuf, rows: usize },
    Skipped(&'static str),
    Failed(ReplayError),
}

/// Записать отчёт, если blocking-режим, задан путь и есть хотя бы одна запись.
/// Ошибка записи не делает прогон неуспешным: только возвращается.
pub fn emit_report(
    mode: DispatchMode,
    output: Option<&Path>,
    records: &[ResultRecord],
) -> ReportStatus {
    if mode != DispatchMode::Blocking {
        return ReportStatus::Skipped("fire-and-forget mode records nothing");
    }
    let Some(path) = output else {
        return ReportStatus::Skipped("no output path configured");
    };
    if records.is_empty() {
        return ReportStatus::Skipped("no records collected");
    }

    match write_report(path, records) {
        Ok(rows) => {
            tracing::info!(path = %path.display(), rows, "wrote per-request stats");
            ReportStatus::Written { path: path.to_path_buf(), rows }
        }
        Err(e) => {
            tracing::error!(error = %e, "report write failed");
            ReportStatus::Failed(e)
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Summary
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub mean: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl LatencyStats {
    fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut nanos: Vec<f64> = samples.iter().map(|d| d.as_nanos() as f64).collect();
        nanos.sort_by(f64::total_cmp);
        let to_duration = |n: f64| Duration::from_nanos(n.round() as u64);
        let at = |q: f64| to_duration(percentile(&nanos, q));
        Some(Self {
            mean: to_duration(nanos.iter().sum::<f64>() / nanos.len() as f64),
            p50: at(0.50),
            p90: at(0.90),
            p99: at(0.99),
            max: to_duration(nanos[nanos.len() - 1]),
        })
    }
}

/// Сводка прогона для консоли.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub total: usize,
    pub dispatched: usize,
    pub records: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub latency: Option<LatencyStats>,
    pub mean_server_duration_ms: Option<f64>,
    pub max_lag: Duration,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl Summary {
    pub fn from_outcome(outcome: &ReplayOutcome) -> Self {
        let records = &outcome.records;
        let succeeded = records.iter().filter(|r| r.is_success()).count();
        let latencies: Vec<Duration> = records.iter().filter_map(|r| r.client_latency).collect();
        let server: Vec<f64> = records.iter().filter_map(|r| r.server_duration_ms).collect();
        Self {
            total: outcome.total,
            dispatched: outcome.dispatched,
            records: records.len(),
            succeeded,
            failed: records.len() - succeeded,
            latency: LatencyStats::from_samples(&latencies),
            mean_server_duration_ms: (!server.is_empty())
                .then(|| server.iter().sum::<f64>() / server.len() as f64),
            max_lag: outcome.max_lag,
            elapsed: outcome.elapsed,
            cancelled: outcome.cancelled,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Replay summary{}", if self.cancelled { " (cancelled)" } else { "" })?;
        writeln!(f, "  events  : {}/{} dispatched", self.dispatched, self.total)?;
        if self.records > 0 {
            writeln!(
                f,
                "  records : {} ({} ok, {} failed)",
                self.records, self.succeeded, self.failed
            )?;
        }
        if let Some(l) = &self.latency {
            writeln!(
                f,
                "  latency : mean {:.3}s  p50 {:.3}s  p90 {:.3}s  p99 {:.3}s  max {:.3}s",
                l.mean.as_secs_f64(),
                l.p50.as_secs_f64(),
                l.p90.as_secs_f64(),
                l.p99.as_secs_f64(),
                l.max.as_secs_f64()
            )?;
        }
        if let Some(ms) = self.mean_server_duration_ms {
            writeln!(f, "  server  : mean {ms:.1} ms")?;
        }
        writeln!(f, "  max lag : {:.3}s", self.max_lag.as_secs_f64())?;
        write!(f, "  elapsed : {:.3}s", self.elapsed.as_secs_f64())
    }
}
