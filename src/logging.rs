//! Tracing subscriber setup for the `--log` option.
//!
//! `RUST_LOG` takes precedence over the level implied by `--verbose`.

use anyhow::Result;
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Off,
    Stdout,
    Stderr,
    /// Append to a file, without ANSI colors.
    File(PathBuf),
}

impl LogSink {
    /// Parse `0|off`, `1|stdout`, `2|stderr`, or treat anything else as a path.
    pub fn parse(value: &str) -> Self {
        match value {
            "0" | "off" => LogSink::Off,
            "1" | "stdout" => LogSink::Stdout,
            "2" | "stderr" => LogSink::Stderr,
            path => LogSink::File(PathBuf::from(path)),
        }
    }
}

fn env_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber.
pub fn init_logging(sink: &LogSink, verbose: bool) -> Result<()> {
    match sink {
        LogSink::Off => {}
        LogSink::Stdout => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(env_filter(verbose))
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogSink::Stderr => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(env_filter(verbose))
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogSink::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(env_filter(verbose))
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_named_sinks() {
        assert_eq!(LogSink::parse("0"), LogSink::Off);
        assert_eq!(LogSink::parse("off"), LogSink::Off);
        assert_eq!(LogSink::parse("1"), LogSink::Stdout);
        assert_eq!(LogSink::parse("stderr"), LogSink::Stderr);
        assert_eq!(
            LogSink::parse("run.log"),
            LogSink::File(PathBuf::from("run.log"))
        );
    }
}
