use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use realtime::{BackoffPolicy, RealtimeConfig};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Buffer change events per channel and deliver them after a quiet window
    #[arg(long, env, default_value_t = true, action = clap::ArgAction::Set)]
    pub realtime_batching: bool,

    /// Quiet window in milliseconds before buffered change events are delivered
    #[arg(long, env, default_value_t = 100)]
    pub realtime_batch_window_ms: u64,

    /// Delay in milliseconds before the first reconnect attempt; doubles on every further attempt
    #[arg(long, env, default_value_t = 1000)]
    pub reconnect_initial_delay_ms: u64,

    /// Upper bound in milliseconds for the reconnect delay
    #[arg(long, env, default_value_t = 30_000)]
    pub reconnect_max_delay_ms: u64,

    /// Reconnect attempts before the connection is reported as failed
    #[arg(long, env, default_value_t = 10)]
    pub max_reconnect_attempts: u32,

    /// Interval in milliseconds of the connection health check
    #[arg(long, env, default_value_t = 30_000)]
    pub health_check_interval_ms: u64,

    /// Default interval in milliseconds at which presence state is re-tracked
    #[arg(long, env, default_value_t = 30_000)]
    pub presence_heartbeat_ms: u64,

    /// Remote presence entries not refreshed within this many milliseconds are dropped
    #[arg(long, env, default_value_t = 60_000)]
    pub presence_timeout_ms: u64,

    /// Default milliseconds of inactivity after which a typing indicator stops
    #[arg(long, env, default_value_t = 3000)]
    pub typing_timeout_ms: u64,

    /// How long in seconds the development harness feeds scripted traffic
    #[arg(long, env, default_value_t = 5)]
    pub harness_duration_secs: u64,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }

    pub fn harness_duration(&self) -> Duration {
        Duration::from_secs(self.harness_duration_secs)
    }

    /// Settings for the realtime manager.
    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            batching: self.realtime_batching,
            batch_window: Duration::from_millis(self.realtime_batch_window_ms),
            backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
                max_attempts: self.max_reconnect_attempts,
            },
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            presence_heartbeat: Duration::from_millis(self.presence_heartbeat_ms),
            presence_timeout: Duration::from_millis(self.presence_timeout_ms),
            typing_timeout: Duration::from_millis(self.typing_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_realtime_defaults() {
        let config = Config::parse_from(["foodshare_realtime"]);
        assert_eq!(config.realtime_config(), RealtimeConfig::default());
        assert_eq!(config.log_level_filter, LevelFilter::Info);
        assert!(!config.is_production());
    }

    #[test]
    fn flags_override_realtime_settings() {
        let config = Config::parse_from([
            "foodshare_realtime",
            "--realtime-batching",
            "false",
            "--max-reconnect-attempts",
            "3",
            "--typing-timeout-ms",
            "1500",
            "--runtime-env",
            "PRODUCTION",
        ]);
        let realtime = config.realtime_config();

        assert!(!realtime.batching);
        assert_eq!(realtime.backoff.max_attempts, 3);
        assert_eq!(realtime.typing_timeout, Duration::from_millis(1500));
        assert!(config.is_production());
    }

    #[test]
    fn rust_env_parses_case_insensitively() {
        assert_eq!("Staging".parse::<RustEnv>(), Ok(RustEnv::Staging));
        assert_eq!(RustEnv::Production.to_string(), "production");
        assert_eq!("qa".parse::<RustEnv>(), Err(RustEnvParseError));
    }
}
