//! Replay of recorded request-arrival traces against an HTTP endpoint.
//!
//! Загрузка трассы ([`trace`]) → классификация по bucket'ам ([`bucket`]) →
//! расписание с масштабированием времени ([`scheduler`]) → HTTP-отправка
//! ([`dispatch`]) → CSV-отчёт и сводка ([`report`]).

pub mod bucket;
pub mod config;
mod csv;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod trace;

pub use bucket::{BucketSpec, Classifier, FixedThresholds, Quantiles, TokenStats};
pub use config::{BasicAuth, DispatchMode, Pacing, ReplayConfig};
pub use dispatch::{Dispatch, HttpDispatcher};
pub use error::{DispatchError, ReplayError};
pub use event::Event;
pub use report::{ReportStatus, ResultRecord, Summary};
pub use scheduler::{ReplayOutcome, Scheduler};
pub use session::ReplayRun;
pub use trace::{LoadedTrace, load_trace};
