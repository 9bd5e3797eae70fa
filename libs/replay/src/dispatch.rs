use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Url;
use tokio::time::Instant;

use crate::config::{BasicAuth, DispatchMode, ReplayConfig};
use crate::error::{DispatchError, ReplayError};
use crate::event::Event;
use crate::report::ResultRecord;

// ═══════════════════════════════════════════════════════════════
//  Dispatch trait
// ═══════════════════════════════════════════════════════════════

/// Отправка одного события. Scheduler знает только этот trait.
///
/// `offset`: масштабированный offset события, уходит в payload как
/// `timestamp`. Ошибки запроса не возвращаются наверх: в blocking-режиме
/// они попадают в `ResultRecord::error`, в fire-and-forget только логируются.
pub trait Dispatch: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        index: usize,
        offset: f64,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Option<ResultRecord>> + Send + 'a>>;
}

// ═══════════════════════════════════════════════════════════════
//  HttpDispatcher
// ═══════════════════════════════════════════════════════════════

/// HTTP POST через один переиспользуемый `reqwest::Client`.
pub struct HttpDispatcher {
    client: reqwest::Client,
    url: Url,
    auth: Option<BasicAuth>,
    mode: DispatchMode,
    timeout: Duration,
}

impl HttpDispatcher {
    pub fn new(config: &ReplayConfig) -> Result<Self, ReplayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| ReplayError::config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            url: config.dispatch_url(),
            auth: config.auth.clone(),
            mode: config.mode,
            timeout: config.timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn send(&self, offset: f64, event: &Event) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .client
            .post(self.url.clone())
            .json(&event.request_body(offset));
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.user, Some(&auth.key));
        }
        request.send().await
    }

    async fn fire(&self, index: usize, offset: f64, event: &Event) {
        match self.send(offset, event).await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(index, status = resp.status().as_u16(), "dispatched");
            }
            Ok(resp) => {
                tracing::warn!(index, status = resp.status().as_u16(), "request rejected");
            }
            Err(e) => {
                let err = DispatchError::from_reqwest(&e, self.timeout);
                tracing::warn!(index, error = %err, "request failed");
            }
        }
    }

    async fn measure(&self, index: usize, offset: f64, event: &Event) -> ResultRecord {
        let mut record = ResultRecord::for_event(index, offset, event);
        let started = Instant::now();

        let resp = match self.send(offset, event).await {
            Ok(resp) => resp,
            Err(e) => {
                let err = DispatchError::from_reqwest(&e, self.timeout);
                tracing::warn!(index, error = %err, "request failed");
                record.error = Some(err);
                return record;
            }
        };

        let status = resp.status();
        record.status = Some(status.as_u16());

        match resp.bytes().await {
            Ok(body) => {
                record.client_latency = Some(started.elapsed());
                record.server_duration_ms = parse_server_duration(&body);
                if !status.is_success() {
                    tracing::warn!(index, status = status.as_u16(), "request rejected");
                    record.error = Some(DispatchError::Status(status.as_u16()));
                }
            }
            Err(e) => {
                let err = DispatchError::from_reqwest(&e, self.timeout);
                tracing::warn!(index, status = status.as_u16(), error = %err, "response body failed");
                record.error = Some(err);
            }
        }

        tracing::trace!(index, latency = ?record.client_latency, "request finished");
        record
    }
}

impl Dispatch for HttpDispatcher {
    fn dispatch<'a>(
        &'a self,
        index: usize,
        offset: f64,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Option<ResultRecord>> + Send + 'a>> {
        Box::pin(async move {
            match self.mode {
                DispatchMode::FireAndForget => {
                    self.fire(index, offset, event).await;
                    None
                }
                DispatchMode::Blocking => Some(self.measure(index, offset, event).await),
            }
        })
    }
}

/// Поле `duration` (мс) из JSON-ответа backend'а.
pub fn parse_server_duration(body: &[u8]) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("duration")?.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_url;

    #[test]
    fn server_duration_from_json_body() {
        assert_eq!(parse_server_duration(br#"{"duration":120}"#), Some(120.0));
        assert_eq!(parse_server_duration(br#"{"duration":12.5,"x":1}"#), Some(12.5));
        assert_eq!(parse_server_duration(br#"{"activationId":"abc"}"#), None);
        assert_eq!(parse_server_duration(br#"{"duration":"slow"}"#), None);
        assert_eq!(parse_server_duration(b"not json"), None);
        assert_eq!(parse_server_duration(b""), None);
    }

    #[test]
    fn dispatcher_targets_blocking_url_in_blocking_mode() {
        let mut cfg = ReplayConfig::new(parse_url("http://127.0.0.1:9/api?blocking=false").unwrap());
        cfg.mode = DispatchMode::Blocking;
        let d = HttpDispatcher::new(&cfg).unwrap();
        assert_eq!(d.url().as_str(), "http://127.0.0.1:9/api?blocking=true");
    }
}
