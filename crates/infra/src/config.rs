//! Environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use dispatchgate_guards::{ConcurrencyLimits, ExecutionMode, LogStats, RateLimitPolicy};

pub const DEV_JWT_SECRET: &str = "dev-secret";
pub const DEV_WEBHOOK_SECRET: &str = "dispatchgate-dev-secret";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("could not read {path}: {message}")]
    Unreadable { path: String, message: String },
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub bind_addr: SocketAddr,
    /// `None` runs on in-memory stores.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub workflow_engine_url: String,
    pub webhook_secret: String,
    pub invoke_timeout: Duration,
    pub execution_mode: ExecutionMode,
    pub rate_limit: RateLimitPolicy,
    pub concurrency: ConcurrencyLimits,
    pub audit_stale_after: chrono::Duration,
    pub tools_file: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            jwt_secret: DEV_JWT_SECRET.to_string(),
            workflow_engine_url: "http://127.0.0.1:5678".to_string(),
            webhook_secret: DEV_WEBHOOK_SECRET.to_string(),
            invoke_timeout: Duration::from_secs(30),
            execution_mode: ExecutionMode::Full,
            rate_limit: RateLimitPolicy::default(),
            concurrency: ConcurrencyLimits::new(3)
                .with_limit("listing", 2)
                .with_limit("research", 2)
                .with_limit("media", 1),
            audit_stale_after: chrono::Duration::seconds(3600),
            tools_file: None,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and blank keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("DISPATCH_BIND_ADDR") {
            config.bind_addr = parse("DISPATCH_BIND_ADDR", &v)?;
        }
        config.database_url = get("DATABASE_URL");
        if let Some(v) = get("JWT_SECRET") {
            config.jwt_secret = v;
        }
        if let Some(v) = get("WORKFLOW_ENGINE_URL") {
            config.workflow_engine_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("WORKFLOW_WEBHOOK_SECRET") {
            config.webhook_secret = v;
        }
        if let Some(v) = get("DISPATCH_INVOKE_TIMEOUT_SECS") {
            let secs: u64 = parse("DISPATCH_INVOKE_TIMEOUT_SECS", &v)?;
            if secs == 0 {
                return Err(invalid("DISPATCH_INVOKE_TIMEOUT_SECS", &v));
            }
            config.invoke_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = get("DISPATCH_EXECUTION_MODE") {
            config.execution_mode =
                ExecutionMode::from_str(&v).map_err(|_| invalid("DISPATCH_EXECUTION_MODE", &v))?;
        }

        let limit = match get("DISPATCH_RATE_LIMIT") {
            Some(v) => parse("DISPATCH_RATE_LIMIT", &v)?,
            None => config.rate_limit.limit,
        };
        let window = match get("DISPATCH_RATE_WINDOW_SECS") {
            Some(v) => parse("DISPATCH_RATE_WINDOW_SECS", &v)?,
            None => config.rate_limit.window_secs,
        };
        config.rate_limit = RateLimitPolicy::new(limit, window).map_err(|_| {
            if limit == 0 {
                invalid("DISPATCH_RATE_LIMIT", "0")
            } else {
                invalid("DISPATCH_RATE_WINDOW_SECS", &window.to_string())
            }
        })?;

        if let Some(v) = get("DISPATCH_DEFAULT_MAX_CONCURRENCY") {
            config.concurrency.default_max = parse("DISPATCH_DEFAULT_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("DISPATCH_CONCURRENCY_LIMITS") {
            let mut limits = ConcurrencyLimits::new(config.concurrency.default_max);
            limits
                .parse_overrides(&v)
                .map_err(|_| invalid("DISPATCH_CONCURRENCY_LIMITS", &v))?;
            config.concurrency = limits;
        }
        if let Some(v) = get("DISPATCH_AUDIT_STALE_AFTER_SECS") {
            let secs: i64 = parse("DISPATCH_AUDIT_STALE_AFTER_SECS", &v)?;
            config.audit_stale_after = chrono::Duration::try_seconds(secs)
                .filter(|d| secs > 0 && *d <= LogStats::max_window())
                .ok_or_else(|| invalid("DISPATCH_AUDIT_STALE_AFTER_SECS", &v))?;
        }
        config.tools_file = get("DISPATCH_TOOLS_FILE").map(PathBuf::from);

        Ok(config)
    }

    pub fn uses_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn uses_dev_webhook_secret(&self) -> bool {
        self.webhook_secret == DEV_WEBHOOK_SECRET
    }

    /// Webhooks live under `{base}/webhook/`.
    pub fn webhook_base_url(&self) -> String {
        format!("{}/webhook", self.workflow_engine_url)
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}
