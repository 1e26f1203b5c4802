use tracing_subscriber::{fmt, EnvFilter};

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// Logs go to stderr so command output on stdout stays machine readable.
/// Later calls are no-ops, which keeps tests free to call it.
pub fn init(format: LogFormat, service_name: &str, default_level: &str) {
    let installed = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter(default_level))
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter(default_level))
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, ?format, "logging initialised");
    }
}

pub fn init_logging(service_name: &str, default_level: &str) {
    init(LogFormat::Pretty, service_name, default_level);
}

pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(LogFormat::Json, service_name, default_level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_logging("duet-test", "debug");
        init_logging_json("duet-test", "debug");
        tracing::debug!("still logging");
    }

    #[test]
    fn format_from_flag() {
        assert_eq!(LogFormat::from_flag(true), LogFormat::Json);
        assert_eq!(LogFormat::from_flag(false), LogFormat::Pretty);
    }
}
