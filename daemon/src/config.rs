//! Process configuration loaded from environment variables with defaults.

use sms_retry_runtime::EngineConfig;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_STATE_DIR: &str = "./state";
const DEFAULT_SUCCESS_RATE: f64 = 0.7;
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_METRICS_PORT: u16 = 9090;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;

/// Which delivery gateway to run against.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayConfig {
    /// POST each message to a provider endpoint
    Http {
        /// Provider endpoint URL
        url: String,
    },
    /// Simulated provider that succeeds with a fixed probability
    Random {
        /// Probability of success, in `[0, 1]`
        success_rate: f64,
    },
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Engine sizing and writer settings
    pub engine: EngineConfig,
    /// Root of the filesystem object store (`SMS_STATE_DIR`)
    pub state_dir: PathBuf,
    /// Gateway selection (`SMS_GATEWAY_URL`, `SMS_SEND_SUCCESS_RATE`)
    pub gateway: GatewayConfig,
    /// HTTP API listener address (`HTTP_ADDR`)
    pub http_addr: SocketAddr,
    /// Prometheus listener address (`METRICS_ADDR`)
    pub metrics_addr: SocketAddr,
    /// Upper bound on graceful shutdown (`SHUTDOWN_TIMEOUT_SECS`)
    pub shutdown_timeout: Duration,
    /// How often to log engine status (`SMS_STATUS_INTERVAL_SECS`)
    pub status_interval: Duration,
}

impl DaemonConfig {
    /// Load configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(EngineConfig::from_env(), |key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, on top of an engine configuration.
    #[must_use]
    pub fn from_lookup(engine: EngineConfig, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let gateway = match lookup("SMS_GATEWAY_URL").filter(|url| !url.trim().is_empty()) {
            Some(url) => GatewayConfig::Http { url },
            None => GatewayConfig::Random {
                success_rate: parse_or(&lookup, "SMS_SEND_SUCCESS_RATE", DEFAULT_SUCCESS_RATE)
                    .clamp(0.0, 1.0),
            },
        };

        let http_addr = addr_or(&lookup, "HTTP_ADDR", DEFAULT_HTTP_PORT);
        let metrics_addr = addr_or(&lookup, "METRICS_ADDR", DEFAULT_METRICS_PORT);

        Self {
            engine,
            state_dir: lookup("SMS_STATE_DIR")
                .filter(|dir| !dir.is_empty())
                .map_or_else(|| PathBuf::from(DEFAULT_STATE_DIR), PathBuf::from),
            gateway,
            http_addr,
            metrics_addr,
            shutdown_timeout: Duration::from_secs(parse_or(
                &lookup,
                "SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            )),
            status_interval: Duration::from_secs(
                parse_or(&lookup, "SMS_STATUS_INTERVAL_SECS", DEFAULT_STATUS_INTERVAL_SECS).max(1),
            ),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn addr_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, port: u16) -> SocketAddr {
    lookup(key)
        .and_then(|addr| addr.trim().parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], port)))
}
