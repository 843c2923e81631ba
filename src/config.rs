use crate::domain::registration::DeviceInfo;
use crate::domain::token::{CustomerRef, Platform, TokenShape};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub registration: RegistrationConfig,

    #[command(flatten)]
    pub retry: RetryConfig,

    #[command(flatten)]
    pub store: StoreConfig,

    #[command(flatten)]
    pub provider: ProviderConfig,

    #[command(flatten)]
    pub device: DeviceConfig,

    #[command(flatten)]
    pub reachability: ReachabilityConfig,

    #[command(flatten)]
    pub telemetry: TelemetryConfig,

    /// Seconds to wait for background tasks after a shutdown signal
    #[arg(long, env = "PUSHTOKEN_SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Keep the token registered until interrupted (default)
    Run,
    /// Acquire and register the token once, then exit
    Register,
    /// Print the stored record and scheduler state as JSON
    Status,
    /// Forget the stored token record
    Reset,
}

#[derive(Clone, Debug, Args)]
pub struct RegistrationConfig {
    /// Token registration endpoint
    #[arg(long = "endpoint", env = "PUSHTOKEN_ENDPOINT", default_value = "http://127.0.0.1:8080/api/push/token")]
    pub endpoint: String,

    /// Static bearer credential sent with every registration
    #[arg(long, env = "PUSHTOKEN_BEARER_TOKEN", default_value = "", hide_env_values = true)]
    pub bearer_token: String,

    /// Request timeout for a single registration call
    #[arg(long = "registration-timeout-secs", env = "PUSHTOKEN_REGISTRATION_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/api/push/token".to_string(),
            bearer_token: String::new(),
            timeout_secs: 30,
        }
    }
}

impl RegistrationConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Args)]
pub struct RetryConfig {
    /// Delay before the first retry; doubles after every failure
    #[arg(long = "retry-base-delay-secs", env = "PUSHTOKEN_RETRY_BASE_DELAY_SECS", default_value_t = 5)]
    pub base_delay_secs: u64,

    /// Consecutive failures before entering the cool-down
    #[arg(long, env = "PUSHTOKEN_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    /// Length of the cool-down after which the retry counter is reset
    #[arg(long = "retry-cooldown-secs", env = "PUSHTOKEN_RETRY_COOLDOWN_SECS", default_value_t = 3600)]
    pub cooldown_secs: u64,

    /// How often to look for unregistered tokens with no retry armed
    #[arg(long = "retry-sweep-interval-secs", env = "PUSHTOKEN_RETRY_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Upper bound for the registration attempt made when the app goes to background
    #[arg(long, env = "PUSHTOKEN_BACKGROUND_GRACE_SECS", default_value_t = 10)]
    pub background_grace_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            max_retries: 5,
            cooldown_secs: 3600,
            sweep_interval_secs: 30,
            background_grace_secs: 10,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct StoreConfig {
    /// File holding the persisted token record
    #[arg(long = "state-file", env = "PUSHTOKEN_STATE_FILE", default_value = "push-token-state.json")]
    pub path: PathBuf,

    /// Key under which the record is stored
    #[arg(long = "store-key", env = "PUSHTOKEN_STORE_KEY", default_value = "@pushtoken/record")]
    pub key: String,

    /// Age after which a token is re-registered even if unchanged
    #[arg(long, env = "PUSHTOKEN_TOKEN_TTL_HOURS", default_value_t = 168)]
    pub token_ttl_hours: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("push-token-state.json"),
            key: "@pushtoken/record".to_string(),
            token_ttl_hours: 168,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_hours.saturating_mul(3600))
    }
}

#[derive(Clone, Debug, Args)]
pub struct ProviderConfig {
    /// File the platform bridge writes the current push token to
    #[arg(long, env = "PUSHTOKEN_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// How often to re-read the token file for rotations
    #[arg(long = "token-poll-interval-secs", env = "PUSHTOKEN_TOKEN_POLL_INTERVAL_SECS", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Ask the platform for notification permission at startup
    #[arg(long, env = "PUSHTOKEN_REQUEST_PERMISSION", default_value_t = true, action = clap::ArgAction::Set)]
    pub request_permission: bool,

    #[arg(long, env = "PUSHTOKEN_MIN_TOKEN_LENGTH", default_value_t = 50)]
    pub min_token_length: usize,

    #[arg(long, env = "PUSHTOKEN_MAX_TOKEN_LENGTH", default_value_t = 250)]
    pub max_token_length: usize,

    /// Separator between the token's provider prefix and its body
    #[arg(long, env = "PUSHTOKEN_TOKEN_DELIMITER", default_value_t = ':')]
    pub token_delimiter: char,

    #[arg(long, env = "PUSHTOKEN_MIN_TOKEN_SUFFIX_LENGTH", default_value_t = 140)]
    pub min_suffix_length: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let shape = TokenShape::default();
        Self {
            token_file: None,
            poll_interval_secs: 5,
            request_permission: true,
            min_token_length: shape.min_length,
            max_token_length: shape.max_length,
            token_delimiter: shape.delimiter,
            min_suffix_length: shape.min_suffix_length,
        }
    }
}

impl ProviderConfig {
    #[must_use]
    pub const fn shape(&self) -> TokenShape {
        TokenShape {
            min_length: self.min_token_length,
            max_length: self.max_token_length,
            delimiter: self.token_delimiter,
            min_suffix_length: self.min_suffix_length,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct DeviceConfig {
    #[arg(long, env = "PUSHTOKEN_PLATFORM", value_enum, default_value_t = Platform::current())]
    pub platform: Platform,

    /// Authenticated customer the token belongs to, if known
    #[arg(long, env = "PUSHTOKEN_CUSTOMER_ID")]
    pub customer_id: Option<String>,

    #[arg(long, env = "PUSHTOKEN_CUSTOMER_EMAIL")]
    pub customer_email: Option<String>,

    #[arg(long, env = "PUSHTOKEN_APP_VERSION")]
    pub app_version: Option<String>,

    #[arg(long, env = "PUSHTOKEN_DEVICE_MODEL")]
    pub device_model: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            customer_id: None,
            customer_email: None,
            app_version: None,
            device_model: None,
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn customer(&self) -> Option<CustomerRef> {
        self.customer_id.as_ref().map(|id| CustomerRef::new(id.clone(), self.customer_email.clone()))
    }

    #[must_use]
    pub fn device_info(&self) -> Option<DeviceInfo> {
        let info = DeviceInfo {
            app_version: self.app_version.clone(),
            device_model: self.device_model.clone(),
            os_version: Some(std::env::consts::OS.to_string()),
            ..DeviceInfo::default()
        };
        (!info.is_empty()).then_some(info)
    }
}

#[derive(Clone, Debug, Args)]
pub struct ReachabilityConfig {
    /// How often to probe the registration host; 0 disables probing
    #[arg(long = "probe-interval-secs", env = "PUSHTOKEN_PROBE_INTERVAL_SECS", default_value_t = 10)]
    pub probe_interval_secs: u64,

    #[arg(long = "probe-timeout-ms", env = "PUSHTOKEN_PROBE_TIMEOUT_MS", default_value_t = 2000)]
    pub probe_timeout_ms: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self { probe_interval_secs: 10, probe_timeout_ms: 2000 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Default, Args)]
pub struct TelemetryConfig {
    #[arg(long, env = "PUSHTOKEN_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// OTLP collector base URL; traces and metrics are only exported when set
    #[arg(long, env = "PUSHTOKEN_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: None,
            registration: RegistrationConfig::default(),
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
            provider: ProviderConfig::default(),
            device: DeviceConfig::default(),
            reachability: ReachabilityConfig::default(),
            telemetry: TelemetryConfig::default(),
            shutdown_timeout_secs: 5,
        }
    }
}

impl Config {
    #[must_use]
    pub fn load() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_match_default_impls() {
        let parsed = Config::try_parse_from(["push-token-lifecycle"]).unwrap();
        let defaults = Config::default();

        assert_eq!(parsed.command, None);
        assert_eq!(parsed.registration.timeout_secs, defaults.registration.timeout_secs);
        assert_eq!(parsed.retry.base_delay_secs, defaults.retry.base_delay_secs);
        assert_eq!(parsed.retry.max_retries, defaults.retry.max_retries);
        assert_eq!(parsed.retry.cooldown_secs, defaults.retry.cooldown_secs);
        assert_eq!(parsed.store.key, defaults.store.key);
        assert_eq!(parsed.provider.shape(), TokenShape::default());
        assert_eq!(parsed.telemetry.log_format, LogFormat::Text);
    }

    #[test]
    fn test_subcommand_and_overrides() {
        let parsed = Config::try_parse_from([
            "push-token-lifecycle",
            "--max-retries",
            "3",
            "--platform",
            "ios",
            "--customer-id",
            "c-1",
            "status",
        ])
        .unwrap();

        assert_eq!(parsed.command, Some(Command::Status));
        assert_eq!(parsed.retry.max_retries, 3);
        assert_eq!(parsed.device.platform, Platform::Ios);
        assert_eq!(parsed.device.customer().unwrap().customer_id, "c-1");
    }

    #[test]
    fn test_token_ttl_saturates_for_huge_values() {
        let store = StoreConfig { token_ttl_hours: u64::MAX / 1000, ..StoreConfig::default() };
        assert_eq!(store.token_ttl(), Duration::from_secs(u64::MAX));
        assert_eq!(StoreConfig::default().token_ttl(), Duration::from_secs(168 * 3600));
    }
}
