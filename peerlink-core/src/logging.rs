use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. The `json` format is meant
/// for collection by a log pipeline, anything else renders human-readable
/// output. When `file_path` is set, output is appended to that file instead of
/// stderr.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let layer = build_layer(config)?.with_filter(env_filter);
    tracing_subscriber::registry().with(layer).try_init()?;

    Ok(())
}

fn build_layer(config: &LoggingConfig) -> anyhow::Result<BoxedLayer> {
    let file = match &config.file_path {
        Some(path) => Some(Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => None,
    };

    let layer: BoxedLayer = if config.format == "json" {
        let json = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_line_number(true);
        match file {
            Some(file) => json.with_writer(file).boxed(),
            None => json.with_writer(std::io::stderr).boxed(),
        }
    } else {
        let pretty = fmt::layer()
            .compact()
            .with_target(true)
            .with_line_number(true)
            .with_file(false);
        match file {
            Some(file) => pretty.with_ansi(false).with_writer(file).boxed(),
            None => pretty.with_writer(std::io::stderr).boxed(),
        }
    };

    Ok(layer)
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARNING").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_init_logging_rejects_invalid_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_build_layer_with_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerlink.log");
        let config = LoggingConfig {
            level: "info".to_string(),
            format: "json".to_string(),
            file_path: Some(path.to_string_lossy().into_owned()),
        };

        assert!(build_layer(&config).is_ok());
        assert!(path.exists());
    }
}
