use std::time::Duration;

/// Фатальные ошибки replay: прерывают запуск до старта (Configuration,
/// TraceFormat) или сообщаются в конце (ReportWrite).
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("trace format: {0}")]
    TraceFormat(String),

    #[error("report write ({path}): {source}")]
    ReportWrite { path: String, source: std::io::Error },
}

impl ReplayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn trace(msg: impl Into<String>) -> Self {
        Self::TraceFormat(msg.into())
    }
}

/// Ошибка одного запроса. Никогда не выходит за пределы scheduler'а:
/// попадает в колонку `error` отчёта или в warn-лог.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("connect: {0}")]
    Connect(String),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("body: {0}")]
    Body(String),

    #[error("transport: {0}")]
    Transport(String),
}

impl DispatchError {
    /// Classify a reqwest failure; `timeout` is reported back for timeouts.
    pub fn from_reqwest(e: &reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            Self::Timeout(timeout)
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            Self::Body(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}
