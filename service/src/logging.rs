use crate::config::Config;
use log::{LevelFilter, SetLoggerError};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Runtime and networking crates muted below `TRACE`.
const FILTERED_MODULES: &[&str] = &["tokio", "mio", "hyper", "rustls", "tungstenite"];

pub struct Logger {}

impl Logger {
    /// Installs the terminal logger at `config.log_level_filter`.
    ///
    /// Fails when a logger has already been installed in this process.
    pub fn init_logger(config: &Config) -> Result<(), SetLoggerError> {
        let level = config.log_level_filter;
        TermLogger::init(
            level,
            Self::log_config(level),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )
    }

    fn muted_modules(level: LevelFilter) -> &'static [&'static str] {
        match level {
            LevelFilter::Trace => &[],
            _ => FILTERED_MODULES,
        }
    }

    fn log_config(level: LevelFilter) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();
        for module in Self::muted_modules(level) {
            builder.add_filter_ignore_str(module);
        }
        builder.build()
    }
}
