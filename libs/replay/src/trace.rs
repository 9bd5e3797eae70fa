use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};

use crate::bucket::{BucketSpec, Classifier};
use crate::csv::{ColumnMap, DELIMITER, parse_fields, records};
use crate::error::ReplayError;
use crate::event::{Event, validate_events};

pub const COL_TIMESTAMP: &str = "TIMESTAMP";
pub const COL_CONTEXT_TOKENS: &str = "ContextTokens";
pub const COL_GENERATED_TOKENS: &str = "GeneratedTokens";

// ═══════════════════════════════════════════════════════════════
//  Raw trace rows
// ═══════════════════════════════════════════════════════════════

/// Одна строка CSV-трассы до классификации.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRow {
    /// Абсолютное время (секунды Unix или «как есть» для числовых меток).
    pub timestamp: f64,
    pub context_tokens: u64,
    pub generated_tokens: u64,
    /// Номер строки в файле (1-based, заголовок = 1).
    pub line: usize,
}

pub fn read_rows(path: &Path) -> Result<Vec<TraceRow>, ReplayError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ReplayError::trace(format!("cannot read trace {}: {e}", path.display())))?;
    parse_rows(&content)
}

/// Разобрать CSV с заголовком. Лишние колонки игнорируются.
pub fn parse_rows(content: &str) -> Result<Vec<TraceRow>, ReplayError> {
    let mut lines = records(content)
        .into_iter()
        .filter(|(_, l)| !l.trim().is_empty());

    let (_, header) = lines
        .next()
        .ok_or_else(|| ReplayError::trace("trace is empty (no header)"))?;
    let cols = ColumnMap::from_header(&parse_fields(header, DELIMITER));
    let ts_idx = cols.require(COL_TIMESTAMP)?;
    let ctx_idx = cols.require(COL_CONTEXT_TOKENS)?;
    let gen_idx = cols.require(COL_GENERATED_TOKENS)?;

    let mut rows = Vec::new();
    for (line_no, line) in lines {
        let fields = parse_fields(line, DELIMITER);
        let field = |idx: usize, name: &str| {
            fields.get(idx).map(|s| s.trim()).ok_or_else(|| {
                ReplayError::trace(format!("line {line_no}: missing field '{name}'"))
            })
        };

        let raw_ts = field(ts_idx, COL_TIMESTAMP)?;
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| {
            ReplayError::trace(format!("line {line_no}: unparsable {COL_TIMESTAMP} '{raw_ts}'"))
        })?;
        let context_tokens = parse_tokens(field(ctx_idx, COL_CONTEXT_TOKENS)?, COL_CONTEXT_TOKENS, line_no)?;
        let generated_tokens =
            parse_tokens(field(gen_idx, COL_GENERATED_TOKENS)?, COL_GENERATED_TOKENS, line_no)?;

        rows.push(TraceRow { timestamp, context_tokens, generated_tokens, line: line_no });
    }

    if rows.is_empty() {
        return Err(ReplayError::trace("trace has a header but no rows"));
    }
    Ok(rows)
}

fn parse_tokens(raw: &str, name: &str, line_no: usize) -> Result<u64, ReplayError> {
    raw.parse::<u64>()
        .map_err(|_| ReplayError::trace(format!("line {line_no}: {name} must be a non-negative integer, got '{raw}'")))
}

/// Метка времени в секундах: RFC 3339, `YYYY-MM-DD HH:MM:SS[.frac][+HH:MM]`
/// (без зоны: UTC) или просто число секунд.
pub fn parse_timestamp(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return secs.is_finite().then_some(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(unix_seconds(dt.timestamp(), dt.timestamp_subsec_nanos()));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(unix_seconds(dt.timestamp(), dt.timestamp_subsec_nanos()));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            let dt = naive.and_utc();
            return Some(unix_seconds(dt.timestamp(), dt.timestamp_subsec_nanos()));
        }
    }
    None
}

fn unix_seconds(secs: i64, nanos: u32) -> f64 {
    secs as f64 + f64::from(nanos) * 1e-9
}

// ═══════════════════════════════════════════════════════════════
//  Prompts (bucket_id → payload text)
// ═══════════════════════════════════════════════════════════════

pub fn load_prompts(path: &Path) -> Result<HashMap<String, String>, ReplayError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ReplayError::trace(format!("cannot read prompts {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| ReplayError::trace(format!("bad prompts {}: {e}", path.display())))
}

// ═══════════════════════════════════════════════════════════════
//  Rows → Events
// ═══════════════════════════════════════════════════════════════

/// Упорядочить строки, применить limit и построить события.
///
/// Пороги классификатора считаются по всей трассе до limit; offset'ы
/// относительно первой оставшейся строки.
pub fn build_events(
    mut rows: Vec<TraceRow>,
    classifier: &dyn Classifier,
    prompts: &HashMap<String, String>,
    limit: Option<usize>,
) -> Result<Vec<Event>, ReplayError> {
    rows.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    if let Some(limit) = limit {
        rows.truncate(limit);
    }

    let shared: HashMap<&str, Arc<str>> =
        prompts.iter().map(|(k, v)| (k.as_str(), Arc::from(v.as_str()))).collect();

    let Some(t0) = rows.first().map(|r| r.timestamp) else {
        return Err(ReplayError::trace("no events left after limit"));
    };

    let mut events = Vec::with_capacity(rows.len());
    for row in &rows {
        let bucket = classifier
            .classify(row.context_tokens as f64)
            .map_err(|e| ReplayError::trace(format!("line {}: {e}", row.line)))?;
        let text = shared.get(bucket).ok_or_else(|| {
            let mut keys: Vec<&str> = prompts.keys().map(String::as_str).collect();
            keys.sort_unstable();
            ReplayError::trace(format!(
                "bucket '{bucket}' not found in prompts (keys: {})",
                keys.join(", ")
            ))
        })?;
        events.push(Event::new(
            row.timestamp - t0,
            bucket,
            Arc::clone(text),
            row.context_tokens,
            row.generated_tokens,
        ));
    }

    validate_events(&events)?;
    Ok(events)
}

/// Результат загрузки: события плюс то, что стоит залогировать.
pub struct LoadedTrace {
    pub events: Vec<Event>,
    pub total_rows: usize,
    pub thresholds: Vec<String>,
}

/// Полный путь загрузки: CSV + prompts.json → отсортированные события.
pub fn load_trace(
    trace_path: &Path,
    prompts_path: &Path,
    buckets: &BucketSpec,
    limit: Option<usize>,
) -> Result<LoadedTrace, ReplayError> {
    tracing::info!(path = %trace_path.display(), "loading trace");
    let rows = read_rows(trace_path)?;
    let total_rows = rows.len();

    let column: Vec<f64> = rows.iter().map(|r| r.context_tokens as f64).collect();
    let classifier = buckets.build(&column)?;
    let thresholds = classifier.thresholds();
    for line in &thresholds {
        tracing::info!(threshold = %line, "bucket threshold ({COL_CONTEXT_TOKENS})");
    }

    let prompts = load_prompts(prompts_path)?;
    let events = build_events(rows, classifier.as_ref(), &prompts, limit)?;
    tracing::info!(rows = total_rows, events = events.len(), "loaded trace (after limit)");

    Ok(LoadedTrace { events, total_rows, thresholds })
}
