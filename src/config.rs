use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::client::Endpoints;
use crate::engine::EngineSettings;
use crate::reconcile::ResolverSettings;
use crate::retry::RetryPolicy;
use crate::sizing::SizingPolicy;

#[derive(Clone, Debug)]
pub struct Config {
    pub accounts_dir: PathBuf,
    pub poll_interval_ms: u64,

    // Follower randomization
    pub vol_random_min: f64,
    pub vol_random_max: f64,
    pub leverage_random_min: u32,
    pub leverage_random_max: u32,
    pub volume_step: f64,

    pub max_in_flight: usize,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub request_timeout_ms: u64,

    // Reconciliation
    pub open_settle_ms: u64,
    pub close_settle_ms: u64,
    pub history_window_secs: u64,
    pub history_page_size: u32,
    pub volume_tolerance: f64,

    pub order_api_base: String,
    pub query_api_base: String,

    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,

    pub log_level: String,
}

fn var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key}: cannot parse {raw:?}")),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            accounts_dir: var("MX_ACCOUNTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./accounts")),
            poll_interval_ms: parse_or("MX_POLL_INTERVAL_MS", 1000)?,
            vol_random_min: parse_or("MX_VOL_RANDOM_MIN", -5.0)?,
            vol_random_max: parse_or("MX_VOL_RANDOM_MAX", 5.0)?,
            leverage_random_min: parse_or("MX_LEVERAGE_RANDOM_MIN", 5)?,
            leverage_random_max: parse_or("MX_LEVERAGE_RANDOM_MAX", 15)?,
            volume_step: parse_or("MX_VOLUME_STEP", 1.0)?,
            max_in_flight: parse_or("MX_MAX_IN_FLIGHT", 8)?,
            retry_attempts: parse_or("MX_RETRY_ATTEMPTS", 3)?,
            retry_base_ms: parse_or("MX_RETRY_BASE_MS", 500)?,
            request_timeout_ms: parse_or("MX_REQUEST_TIMEOUT_MS", 10_000)?,
            open_settle_ms: parse_or("MX_OPEN_SETTLE_MS", 2000)?,
            close_settle_ms: parse_or("MX_CLOSE_SETTLE_MS", 3000)?,
            history_window_secs: parse_or("MX_HISTORY_WINDOW_SECS", 3600)?,
            history_page_size: parse_or("MX_HISTORY_PAGE_SIZE", 20)?,
            volume_tolerance: parse_or("MX_VOLUME_TOLERANCE", 1.0)?,
            order_api_base: var("MX_ORDER_API_BASE")
                .unwrap_or_else(|| "https://futures.mexc.com".to_string()),
            query_api_base: var("MX_QUERY_API_BASE")
                .unwrap_or_else(|| "https://www.mexc.com/api/platform/futures".to_string()),
            telegram_bot_token: var("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: var("TELEGRAM_CHAT_ID"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vol_random_min > self.vol_random_max {
            bail!(
                "MX_VOL_RANDOM_MIN ({}) exceeds MX_VOL_RANDOM_MAX ({})",
                self.vol_random_min,
                self.vol_random_max
            );
        }
        if self.vol_random_min <= -100.0 {
            bail!("MX_VOL_RANDOM_MIN must be above -100");
        }
        if self.leverage_random_min < 1 {
            bail!("MX_LEVERAGE_RANDOM_MIN must be at least 1");
        }
        if self.leverage_random_min > self.leverage_random_max {
            bail!(
                "MX_LEVERAGE_RANDOM_MIN ({}) exceeds MX_LEVERAGE_RANDOM_MAX ({})",
                self.leverage_random_min,
                self.leverage_random_max
            );
        }
        if self.volume_step < 0.0 || self.volume_tolerance < 0.0 {
            bail!("MX_VOLUME_STEP and MX_VOLUME_TOLERANCE must not be negative");
        }
        if self.max_in_flight == 0 {
            bail!("MX_MAX_IN_FLIGHT must be at least 1");
        }
        if self.retry_attempts == 0 {
            bail!("MX_RETRY_ATTEMPTS must be at least 1");
        }
        if self.telegram_bot_token.is_some() != self.telegram_chat_id.is_some() {
            return Err(anyhow!(
                "Provide both TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID, or neither"
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sizing_policy(&self) -> SizingPolicy {
        SizingPolicy {
            vol_pct_min: self.vol_random_min,
            vol_pct_max: self.vol_random_max,
            leverage_min: self.leverage_random_min,
            leverage_max: self.leverage_random_max,
            volume_step: (self.volume_step > 0.0).then_some(self.volume_step),
        }
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            open_settle: Duration::from_millis(self.open_settle_ms),
            close_settle: Duration::from_millis(self.close_settle_ms),
            history_window: Duration::from_secs(self.history_window_secs),
            page_size: self.history_page_size,
            volume_tolerance: self.volume_tolerance,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_in_flight: self.max_in_flight,
            retry: self.retry_policy(),
            request_timeout: self.request_timeout(),
            sizing: self.sizing_policy(),
            resolver: self.resolver_settings(),
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            order_base: self.order_api_base.trim_end_matches('/').to_string(),
            query_base: self.query_api_base.trim_end_matches('/').to_string(),
        }
    }
}
