pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Level, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

#[derive(Debug)]
pub enum LoggingError {
    Parse(serdeconv::Error),
    Build(sloggers::Error),
}

impl From<serdeconv::Error> for LoggingError {
    #[inline]
    fn from(err: serdeconv::Error) -> Self {
        LoggingError::Parse(err)
    }
}

impl From<sloggers::Error> for LoggingError {
    #[inline]
    fn from(err: sloggers::Error) -> Self {
        LoggingError::Build(err)
    }
}

/// Builds a terminal logger writing to stderr at info level.
#[inline]
pub fn terminal() -> Logger {
    from_toml_str(DEFAULT_CONFIG).expect("Default logging config must be valid")
}

/// Builds a logger from a sloggers TOML configuration string.
pub fn from_toml_str(config: &str) -> Result<Logger, LoggingError> {
    let config: LoggerConfig = serdeconv::from_toml_str(config)?;
    let logger = config.build_logger()?;
    Ok(logger)
}

/// A logger that swallows all records. Used by components constructed without
/// a parent logger.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
