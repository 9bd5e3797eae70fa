use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::error::ReplayError;

// ═══════════════════════════════════════════════════════════════
//  Modes
// ═══════════════════════════════════════════════════════════════

/// Как выполняется один запрос.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// At-most-once, без ретраев: ошибки только логируются.
    #[default]
    FireAndForget,
    /// `blocking=true`, замер latency, запись ResultRecord.
    Blocking,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::FireAndForget => f.write_str("fire-and-forget"),
            DispatchMode::Blocking => f.write_str("blocking"),
        }
    }
}

/// Как scheduler ждёт завершения запроса перед следующим deadline'ом.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
    /// Следующее событие: только после возврата текущего dispatch.
    /// Медленный backend сдвигает последующие отправки (drift).
    #[default]
    Sequential,
    /// Каждый dispatch: отдельная task; порядок инициации сохраняется.
    Concurrent,
}

impl std::fmt::Display for Pacing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pacing::Sequential => f.write_str("sequential"),
            Pacing::Concurrent => f.write_str("concurrent"),
        }
    }
}

impl FromStr for Pacing {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Pacing::Sequential),
            "concurrent" => Ok(Pacing::Concurrent),
            other => Err(ReplayError::config(format!(
                "pacing must be \"sequential\" or \"concurrent\", got {other:?}"
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Auth
// ═══════════════════════════════════════════════════════════════

/// Basic auth, задаётся строкой `user:key`.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub user: String,
    pub key: String,
}

impl BasicAuth {
    pub fn parse(s: &str) -> Result<Self, ReplayError> {
        match s.split_once(':') {
            Some((user, key)) if !user.is_empty() => Ok(Self {
                user: user.to_string(),
                key: key.to_string(),
            }),
            _ => Err(ReplayError::config("auth must be in format 'user:key'")),
        }
    }
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BasicAuth({}:***)", self.user)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Target URL
// ═══════════════════════════════════════════════════════════════

pub fn parse_url(raw: &str) -> Result<Url, ReplayError> {
    let url = Url::parse(raw).map_err(|e| ReplayError::config(format!("bad url '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ReplayError::config(format!("unsupported url scheme '{other}'"))),
    }
}

/// `{api_host}/api/v1/namespaces/{namespace}/actions/{action}?blocking=false`
pub fn action_url(api_host: &str, namespace: &str, action: &str) -> Result<Url, ReplayError> {
    if action.is_empty() {
        return Err(ReplayError::config("action name is empty"));
    }
    let host = api_host.trim_end_matches('/');
    parse_url(&format!(
        "{host}/api/v1/namespaces/{namespace}/actions/{action}?blocking=false"
    ))
}

/// Копия `url` с query-параметром `blocking` равным `blocking`; остальные
/// параметры сохраняются.
pub fn with_blocking(url: &Url, blocking: bool) -> Url {
    let rest: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "blocking")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut out = url.clone();
    {
        let mut query = out.query_pairs_mut();
        query.clear();
        for (k, v) in &rest {
            query.append_pair(k, v);
        }
        query.append_pair("blocking", if blocking { "true" } else { "false" });
    }
    out
}

// ═══════════════════════════════════════════════════════════════
//  ReplayConfig
// ═══════════════════════════════════════════════════════════════

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Всё, что нужно scheduler'у и dispatcher'у для одного прогона.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// URL как задан пользователем (blocking-вариант строится отдельно).
    pub url: Url,
    pub auth: Option<BasicAuth>,
    pub timeout: Duration,
    /// Множитель offset'ов: `<1.0` сжимает replay, `>1.0` растягивает.
    pub scale: f64,
    pub mode: DispatchMode,
    pub pacing: Pacing,
    /// CSV-отчёт (только blocking-режим).
    pub output: Option<PathBuf>,
    /// Принимать самоподписанные TLS-сертификаты.
    pub insecure: bool,
}

impl ReplayConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            auth: None,
            timeout: DEFAULT_TIMEOUT,
            scale: 1.0,
            mode: DispatchMode::default(),
            pacing: Pacing::default(),
            output: None,
            insecure: false,
        }
    }

    pub fn validate(&self) -> Result<(), ReplayError> {
        validate_scale(self.scale)?;
        if self.timeout.is_zero() {
            return Err(ReplayError::config("timeout must be > 0"));
        }
        Ok(())
    }

    /// URL, на который реально уходят запросы в текущем режиме.
    pub fn dispatch_url(&self) -> Url {
        match self.mode {
            DispatchMode::Blocking => with_blocking(&self.url, true),
            DispatchMode::FireAndForget => self.url.clone(),
        }
    }
}

pub fn validate_scale(scale: f64) -> Result<(), ReplayError> {
    if scale.is_finite() && scale > 0.0 {
        Ok(())
    } else {
        Err(ReplayError::config(format!("scale must be > 0, got {scale}")))
    }
}

/// Таймаут из секунд; `<= 0`, NaN, бесконечность и значения, не
/// помещающиеся в `Duration`, отклоняются.
pub fn timeout_from_secs(secs: f64) -> Result<Duration, ReplayError> {
    if !(secs.is_finite() && secs > 0.0) {
        return Err(ReplayError::config(format!("timeout must be > 0 seconds, got {secs}")));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ReplayError::config(format!("timeout {secs}s is out of range: {e}")))
}
