use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::poller::PollPolicy;

const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7777";
const DEFAULT_SETTLE_MS: u64 = 2000;
const DEFAULT_POLL_INITIAL_MS: u64 = 1000;
const DEFAULT_POLL_MAX_MS: u64 = 15_000;
const DEFAULT_POLL_ATTEMPTS: u32 = 8;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the generation service (API and `/static` tree).
    pub backend_url: String,
    pub bind_addr: SocketAddr,
    pub poll: PollPolicy,
    /// Applies to probes and metadata reads only; generation calls have no client timeout.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7777)),
            poll: PollPolicy::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Read configuration from `REEL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let backend_url = std::env::var("REEL_BACKEND_URL")
            .unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        reqwest::Url::parse(&backend_url)
            .with_context(|| format!("REEL_BACKEND_URL is not a valid URL: {}", backend_url))?;

        let bind_addr: SocketAddr = env_or("REEL_BIND_ADDR", DEFAULT_BIND_ADDR.parse()?)?;

        let settle_ms = env_or("REEL_SETTLE_MS", DEFAULT_SETTLE_MS)?;
        let initial_ms = env_or("REEL_POLL_INITIAL_MS", DEFAULT_POLL_INITIAL_MS)?;
        let max_ms = env_or("REEL_POLL_MAX_MS", DEFAULT_POLL_MAX_MS)?;
        let poll = PollPolicy {
            settle_delay: Duration::from_millis(settle_ms),
            initial_backoff: Duration::from_millis(initial_ms),
            max_backoff: Duration::from_millis(max_ms),
            max_attempts: env_or("REEL_POLL_ATTEMPTS", DEFAULT_POLL_ATTEMPTS)?.max(1),
        };

        let request_timeout = Duration::from_secs(env_or(
            "REEL_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?);

        Ok(Config {
            backend_url,
            bind_addr,
            poll,
            request_timeout,
        })
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_MS),
            initial_backoff: Duration::from_millis(DEFAULT_POLL_INITIAL_MS),
            max_backoff: Duration::from_millis(DEFAULT_POLL_MAX_MS),
            max_attempts: DEFAULT_POLL_ATTEMPTS,
        }
    }
}
