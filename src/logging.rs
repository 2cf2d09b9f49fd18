//! Process-wide `tracing` subscriber setup.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::error::Error;

/// Maps the configured level name to a filter directive.
///
/// Accepts the usual `tracing` names plus `warning`, `fatal` and `panic`,
/// which older configs use.
pub fn level_directive(level: &str) -> &str {
    match level.to_ascii_lowercase().as_str() {
        "" => "info",
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" | "fatal" | "panic" => "error",
        _ => level,
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides `LogLevel`.
///
/// - `IsStdOut`: human-readable records on stdout
/// - `LogPath`: JSON records appended to that file
/// - otherwise: JSON records on stderr
pub fn init(config: &LogConfig) -> Result<(), Error> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level_directive(&config.log_level))
            .map_err(|e| Error::Logging(format!("invalid LogLevel `{}`: {e}", config.log_level)))?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true);

    let installed = if config.is_std_out {
        builder.with_writer(std::io::stdout).try_init()
    } else if !config.log_path.is_empty() {
        let file = OpenOptions::new().create(true).append(true).open(&config.log_path)?;
        builder.json().with_writer(Mutex::new(file)).try_init()
    } else {
        builder.json().with_writer(std::io::stderr).try_init()
    };
    installed.map_err(|e| Error::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_level_names_map_to_tracing_levels() {
        assert_eq!(level_directive(""), "info");
        assert_eq!(level_directive("Warning"), "warn");
        assert_eq!(level_directive("fatal"), "error");
        assert_eq!(level_directive("applyd=trace"), "applyd=trace");
    }
}
