use std::sync::Arc;

use serde::Serialize;

use crate::error::ReplayError;

// ═══════════════════════════════════════════════════════════════
//  Event: единица работы replay
// ═══════════════════════════════════════════════════════════════

/// Одно событие трассы. Неизменяемо после создания.
///
/// `payload_text` разделяется между всеми событиями одного bucket'а,
/// поэтому хранится как `Arc<str>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Секунды от первого события трассы (относительные часы).
    pub timestamp_offset: f64,
    pub bucket_id: String,
    pub payload_text: Arc<str>,
    pub context_tokens: u64,
    pub generated_tokens: u64,
}

impl Event {
    pub fn new(
        timestamp_offset: f64,
        bucket_id: impl Into<String>,
        payload_text: impl Into<Arc<str>>,
        context_tokens: u64,
        generated_tokens: u64,
    ) -> Self {
        Self {
            timestamp_offset,
            bucket_id: bucket_id.into(),
            payload_text: payload_text.into(),
            context_tokens,
            generated_tokens,
        }
    }

    /// Тело запроса для этого события; `timestamp`: уже масштабированный offset.
    pub fn request_body(&self, timestamp: f64) -> RequestBody<'_> {
        RequestBody {
            timestamp,
            bucket_id: &self.bucket_id,
            prompt: &self.payload_text,
            context_tokens: self.context_tokens,
            generated_tokens: self.generated_tokens,
        }
    }
}

/// JSON body: `{timestamp, bucket_id, prompt, context_tokens, generated_tokens}`.
#[derive(Debug, Serialize)]
pub struct RequestBody<'a> {
    pub timestamp: f64,
    pub bucket_id: &'a str,
    pub prompt: &'a str,
    pub context_tokens: u64,
    pub generated_tokens: u64,
}

// ═══════════════════════════════════════════════════════════════
//  Validation
// ═══════════════════════════════════════════════════════════════

/// Проверить последовательность событий, полученную от внешнего загрузчика.
///
/// Scheduler полагается на порядок и никогда не сортирует сам, поэтому
/// неотсортированная трасса отклоняется здесь, а не «чинится».
pub fn validate_events(events: &[Event]) -> Result<(), ReplayError> {
    if events.is_empty() {
        return Err(ReplayError::trace("event sequence is empty"));
    }

    let mut prev = 0.0_f64;
    for (i, ev) in events.iter().enumerate() {
        if !ev.timestamp_offset.is_finite() || ev.timestamp_offset < 0.0 {
            return Err(ReplayError::trace(format!(
                "event {i}: offset must be finite and non-negative, got {}",
                ev.timestamp_offset
            )));
        }
        if ev.timestamp_offset < prev {
            return Err(ReplayError::trace(format!(
                "event {i}: offset {} is before previous offset {prev}",
                ev.timestamp_offset
            )));
        }
        if ev.bucket_id.is_empty() {
            return Err(ReplayError::trace(format!("event {i}: empty bucket id")));
        }
        if ev.payload_text.is_empty() {
            return Err(ReplayError::trace(format!(
                "event {i}: bucket '{}' has no payload text",
                ev.bucket_id
            )));
        }
        prev = ev.timestamp_offset;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(offset: f64) -> Event {
        Event::new(offset, "1", "hello", 10, 5)
    }

    #[test]
    fn accepts_sorted_sequence_with_ties() {
        assert!(validate_events(&[ev(0.0), ev(0.5), ev(0.5), ev(2.0)]).is_ok());
    }

    #[test]
    fn rejects_empty_sequence() {
        assert!(matches!(validate_events(&[]), Err(ReplayError::TraceFormat(_))));
    }

    #[test]
    fn rejects_unsorted_sequence() {
        let err = validate_events(&[ev(0.0), ev(2.0), ev(1.0)]).unwrap_err();
        assert!(err.to_string().contains("event 2"), "{err}");
    }

    #[test]
    fn rejects_negative_and_nan_offsets() {
        assert!(validate_events(&[ev(-1.0)]).is_err());
        assert!(validate_events(&[ev(f64::NAN)]).is_err());
    }

    #[test]
    fn rejects_missing_payload() {
        let bad = Event::new(0.0, "3", "", 1, 1);
        let err = validate_events(&[bad]).unwrap_err();
        assert!(err.to_string().contains("bucket '3'"), "{err}");
    }

    #[test]
    fn request_body_serializes_expected_fields() {
        let e = Event::new(1.5, "2", "prompt text", 300, 40);
        let json = serde_json::to_value(e.request_body(0.75)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "timestamp": 0.75,
                "bucket_id": "2",
                "prompt": "prompt text",
                "context_tokens": 300,
                "generated_tokens": 40,
            })
        );
    }
}
