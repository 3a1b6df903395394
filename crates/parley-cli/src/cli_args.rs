use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use parley_chat::{
    ChatAdmissionFailurePolicy, ChatDeliveryConfig, ChatPipelineConfig, ChatRateLimitConfig,
    LineMessagingConfig,
};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_f64(value: &str) -> Result<f64, String> {
    let parsed = value
        .parse::<f64>()
        .map_err(|error| format!("failed to parse float: {error}"))?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err("value must be a finite number greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliStoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Parser)]
#[command(
    name = "parley",
    about = "Chat event admission and delivery pipeline",
    version
)]
pub struct Cli {
    #[arg(
        long = "events-file",
        env = "PARLEY_EVENTS_FILE",
        help = "Webhook body (JSON with an events array) to process as one batch"
    )]
    pub events_file: Option<PathBuf>,

    #[arg(
        long,
        env = "PARLEY_STORE",
        value_enum,
        default_value = "memory",
        help = "Backend for idempotency and debounce markers"
    )]
    pub store: CliStoreBackend,

    #[arg(
        long = "store-sqlite-path",
        env = "PARLEY_STORE_SQLITE_PATH",
        default_value = ".parley/admission.sqlite",
        help = "SQLite file used when --store=sqlite; several processes may share it"
    )]
    pub store_sqlite_path: PathBuf,

    #[arg(
        long = "store-sweep-interval-ms",
        env = "PARLEY_STORE_SWEEP_INTERVAL_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64,
        help = "Interval between background sweeps of expired markers"
    )]
    pub store_sweep_interval_ms: u64,

    #[arg(
        long = "idempotency-ttl-ms",
        env = "PARLEY_IDEMPOTENCY_TTL_MS",
        default_value_t = 300_000,
        value_parser = parse_positive_u64,
        help = "How long an event id is remembered"
    )]
    pub idempotency_ttl_ms: u64,

    #[arg(
        long = "debounce-window-ms",
        env = "PARLEY_DEBOUNCE_WINDOW_MS",
        default_value_t = 1_200,
        value_parser = parse_positive_u64,
        help = "Window in which an identical payload from one conversation is dropped"
    )]
    pub debounce_window_ms: u64,

    #[arg(
        long = "rate-limit-capacity",
        env = "PARLEY_RATE_LIMIT_CAPACITY",
        default_value_t = 10.0,
        value_parser = parse_positive_f64,
        help = "Token bucket capacity per conversation"
    )]
    pub rate_limit_capacity: f64,

    #[arg(
        long = "rate-limit-refill-per-second",
        env = "PARLEY_RATE_LIMIT_REFILL_PER_SECOND",
        default_value_t = 1.0,
        value_parser = parse_positive_f64,
        help = "Tokens restored per second per conversation"
    )]
    pub rate_limit_refill_per_second: f64,

    #[arg(
        long = "max-concurrent-lanes",
        env = "PARLEY_MAX_CONCURRENT_LANES",
        value_parser = parse_positive_usize,
        help = "Optional cap on conversations processed at the same time"
    )]
    pub max_concurrent_lanes: Option<usize>,

    #[arg(
        long = "delivery-max-attempts",
        env = "PARLEY_DELIVERY_MAX_ATTEMPTS",
        default_value_t = 4,
        value_parser = parse_positive_u32,
        help = "Attempts per delivery channel (reply, then push fallback)"
    )]
    pub delivery_max_attempts: u32,

    #[arg(
        long = "delivery-base-backoff-ms",
        env = "PARLEY_DELIVERY_BASE_BACKOFF_MS",
        default_value_t = 2_000,
        value_parser = parse_positive_u64,
        help = "First retry delay; doubles per attempt"
    )]
    pub delivery_base_backoff_ms: u64,

    #[arg(
        long = "delivery-max-backoff-ms",
        env = "PARLEY_DELIVERY_MAX_BACKOFF_MS",
        default_value_t = 8_000,
        value_parser = parse_positive_u64,
        help = "Upper bound for computed retry delay"
    )]
    pub delivery_max_backoff_ms: u64,

    #[arg(
        long = "delivery-call-timeout-ms",
        env = "PARLEY_DELIVERY_CALL_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Timeout for a single outbound API call"
    )]
    pub delivery_call_timeout_ms: u64,

    #[arg(
        long = "messaging-api-base",
        env = "PARLEY_MESSAGING_API_BASE",
        default_value = "https://api.line.me",
        help = "Base URL of the messaging API"
    )]
    pub messaging_api_base: String,

    #[arg(
        long = "messaging-access-token",
        env = "PARLEY_MESSAGING_ACCESS_TOKEN",
        hide_env_values = true,
        help = "Channel access token for the messaging API"
    )]
    pub messaging_access_token: Option<String>,

    #[arg(
        long = "faq-catalog",
        env = "PARLEY_FAQ_CATALOG",
        help = "JSON FAQ catalog used by the command router"
    )]
    pub faq_catalog: Option<PathBuf>,

    #[arg(
        long = "admin-user-id",
        env = "PARLEY_ADMIN_USER_IDS",
        value_delimiter = ',',
        help = "User id allowed to run /status and /ping; repeatable"
    )]
    pub admin_user_id: Vec<String>,

    #[arg(
        long = "fail-closed",
        env = "PARLEY_FAIL_CLOSED",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Reject events when the admission store is unreachable instead of admitting them"
    )]
    pub fail_closed: bool,

    #[arg(
        long = "readiness-inspect",
        env = "PARLEY_READINESS_INSPECT",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Print store readiness and exit non-zero when the store is unreachable"
    )]
    pub readiness_inspect: bool,

    #[arg(
        long,
        env = "PARLEY_JSON",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Emit reports as JSON"
    )]
    pub json: bool,
}

impl Cli {
    pub fn pipeline_config(&self) -> ChatPipelineConfig {
        ChatPipelineConfig {
            idempotency_ttl: Duration::from_millis(self.idempotency_ttl_ms),
            debounce_window: Duration::from_millis(self.debounce_window_ms),
            rate_limit: ChatRateLimitConfig {
                capacity: self.rate_limit_capacity,
                refill_per_second: self.rate_limit_refill_per_second,
                ..ChatRateLimitConfig::default()
            },
            max_concurrent_lanes: self.max_concurrent_lanes,
            delivery: ChatDeliveryConfig {
                max_attempts: self.delivery_max_attempts,
                base_backoff_ms: self.delivery_base_backoff_ms,
                max_backoff_ms: self.delivery_max_backoff_ms,
                call_timeout_ms: self.delivery_call_timeout_ms,
                ..ChatDeliveryConfig::default()
            },
            failure_policy: if self.fail_closed {
                ChatAdmissionFailurePolicy::FailClosed
            } else {
                ChatAdmissionFailurePolicy::FailOpen
            },
        }
    }

    pub fn messaging_config(&self) -> LineMessagingConfig {
        LineMessagingConfig {
            api_base: self.messaging_api_base.clone(),
            access_token: self.messaging_access_token.clone().unwrap_or_default(),
            http_timeout_ms: self.delivery_call_timeout_ms,
        }
    }
}
