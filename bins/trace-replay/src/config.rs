use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use replay::config::{action_url, parse_url, timeout_from_secs, validate_scale};
use replay::{BasicAuth, BucketSpec, DispatchMode, Pacing, ReplayConfig};

use crate::error::CliError;

pub const DEFAULT_LIMIT: usize = 100;
const DEFAULT_NAMESPACE: &str = "_";

#[derive(Parser)]
#[command(name = "trace-replay", about = "Replay трассы запросов против HTTP endpoint'а")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Воспроизвести трассу
    Replay(ReplayArgs),
    /// Статистика токенов и границы bucket'ов, без отправки запросов
    Buckets(BucketsArgs),
}

// ═══════════════════════════════════════════════════════════════
//  Config file (TOML)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub trace: Option<PathBuf>,
    pub prompts: Option<PathBuf>,
    pub url: Option<String>,
    pub api_host: Option<String>,
    pub namespace: Option<String>,
    pub action: Option<String>,
    pub auth: Option<String>,
    pub timeout: Option<f64>,
    pub scale: Option<f64>,
    pub limit: Option<usize>,
    pub blocking: Option<bool>,
    pub pacing: Option<Pacing>,
    pub output: Option<PathBuf>,
    pub insecure: Option<bool>,
    pub buckets: Option<BucketSpec>,
}

pub fn load_config(path: &str) -> Result<Config, CliError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| CliError::Config(format!("cannot read config {path}: {e}")))?;
    toml::from_str(&content).map_err(|e| CliError::Config(format!("bad config {path}: {e}")))
}

/// Отсутствующий файл: пустой конфиг; существующий, но битый: ошибка.
fn load_optional(path: &str) -> Result<Config, CliError> {
    match load_config(path) {
        Ok(c) => Ok(c),
        Err(e) => {
            if Path::new(path).exists() {
                return Err(e);
            }
            tracing::debug!(path, "config file not found, using flags only");
            Ok(Config::default())
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  CLI args
// ═══════════════════════════════════════════════════════════════

/// Общие для обеих подкоманд опции трассы.
#[derive(Args, Clone, Debug)]
pub struct TraceArgs {
    /// Путь к trace-replay.toml
    #[arg(long, default_value = "trace-replay.toml", env = "TRACE_REPLAY_CONFIG")]
    pub config: String,

    /// CSV трасса (TIMESTAMP, ContextTokens, GeneratedTokens)
    #[arg(long, env = "TRACE_REPLAY_TRACE")]
    pub trace: Option<PathBuf>,

    /// Фиксированные пороги по токенам [0,256,1000,4000,8000] вместо квартилей
    #[arg(long)]
    pub fixed_buckets: bool,
}

#[derive(Args, Clone, Debug)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub trace: TraceArgs,

    /// JSON: bucket_id -> текст запроса
    #[arg(long, env = "TRACE_REPLAY_PROMPTS")]
    pub prompts: Option<PathBuf>,

    /// Полный URL endpoint'а (приоритетнее api-host/action)
    #[arg(long, env = "TRACE_REPLAY_URL")]
    pub url: Option<String>,

    /// Базовый адрес API, напр. https://localhost:31001
    #[arg(long, env = "TRACE_REPLAY_API_HOST")]
    pub api_host: Option<String>,

    /// Namespace action'а (по умолчанию "_")
    #[arg(long)]
    pub namespace: Option<String>,

    /// Имя action'а
    #[arg(long)]
    pub action: Option<String>,

    /// Basic auth в формате user:key
    #[arg(long, env = "TRACE_REPLAY_AUTH")]
    pub auth: Option<String>,

    /// Таймаут запроса, секунды (по умолчанию 1.0)
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Множитель offset'ов (<1: быстрее, >1: медленнее)
    #[arg(long)]
    pub scale: Option<f64>,

    /// Сколько первых событий воспроизвести (0 = все, по умолчанию 100)
    #[arg(long)]
    pub limit: Option<usize>,

    /// Ждать завершения и мерить latency
    #[arg(long)]
    pub blocking: bool,

    /// sequential | concurrent
    #[arg(long)]
    pub pacing: Option<Pacing>,

    /// CSV с результатами (только --blocking)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Не проверять TLS-сертификат
    #[arg(long)]
    pub insecure: bool,
}

#[derive(Args, Clone, Debug)]
pub struct BucketsArgs {
    #[command(flatten)]
    pub trace: TraceArgs,
}

// ═══════════════════════════════════════════════════════════════
//  Effective: merged config
// ═══════════════════════════════════════════════════════════════

/// Откуда брать события и как их классифицировать.
#[derive(Debug)]
pub struct TraceSettings {
    pub trace: PathBuf,
    pub buckets: BucketSpec,
}

impl TraceSettings {
    fn merge(args: &TraceArgs, cfg: &Config) -> Result<Self, CliError> {
        let trace = args
            .trace
            .clone()
            .or_else(|| cfg.trace.clone())
            .ok_or_else(|| CliError::Config("trace path is required (--trace or `trace`)".into()))?;
        let buckets = if args.fixed_buckets {
            BucketSpec::fixed_defaults()
        } else {
            cfg.buckets.clone().unwrap_or_default()
        };
        Ok(Self { trace, buckets })
    }

    pub fn new(args: &TraceArgs) -> Result<Self, CliError> {
        Self::merge(args, &load_optional(&args.config)?)
    }
}

/// Итоговая конфигурация replay после мержа: config.toml < env/CLI
#[derive(Debug)]
pub struct Effective {
    pub trace: TraceSettings,
    pub prompts: PathBuf,
    /// `None`: без ограничения.
    pub limit: Option<usize>,
    pub replay: ReplayConfig,
}

impl Effective {
    pub fn new(args: &ReplayArgs) -> Result<Self, CliError> {
        let cfg = load_optional(&args.trace.config)?;
        let trace = TraceSettings::merge(&args.trace, &cfg)?;

        let prompts = args
            .prompts
            .clone()
            .or(cfg.prompts)
            .ok_or_else(|| CliError::Config("prompts path is required (--prompts or `prompts`)".into()))?;

        let url = match args.url.clone().or(cfg.url) {
            Some(raw) => parse_url(&raw)?,
            None => {
                let host = args.api_host.clone().or(cfg.api_host);
                let action = args.action.clone().or(cfg.action);
                let (Some(host), Some(action)) = (host, action) else {
                    return Err(CliError::Config(
                        "target is required: --url, or --api-host with --action".into(),
                    ));
                };
                let namespace = args
                    .namespace
                    .clone()
                    .or(cfg.namespace)
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.into());
                action_url(&host, &namespace, &action)?
            }
        };

        let auth = args
            .auth
            .clone()
            .or(cfg.auth)
            .map(|s| BasicAuth::parse(&s))
            .transpose()?;

        let scale = args.scale.or(cfg.scale).unwrap_or(1.0);
        validate_scale(scale)?;

        let blocking = args.blocking || cfg.blocking.unwrap_or(false);
        let limit = match args.limit.or(cfg.limit).unwrap_or(DEFAULT_LIMIT) {
            0 => None,
            n => Some(n),
        };

        let replay = ReplayConfig {
            url,
            auth,
            timeout: timeout_from_secs(args.timeout.or(cfg.timeout).unwrap_or(1.0))?,
            scale,
            mode: if blocking { DispatchMode::Blocking } else { DispatchMode::FireAndForget },
            pacing: args.pacing.or(cfg.pacing).unwrap_or_default(),
            output: args.output.clone().or(cfg.output),
            insecure: args.insecure || cfg.insecure.unwrap_or(false),
        };

        Ok(Self { trace, prompts, limit, replay })
    }
}
