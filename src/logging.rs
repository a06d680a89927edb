// Structured Logging Configuration
// "Every failure leaves a trace"

use crate::error::{DocFiscalResult, TypedError};
use serde::{Deserialize, Serialize};
use std::io;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty, compact)
    pub format: String,
    pub include_thread_ids: bool,
    pub include_targets: bool,
    /// Whether to include file and line numbers
    pub include_file_line: bool,
    /// Span events to include (new, enter, exit, close, active, full)
    pub span_events: String,
    pub enable_colors: bool,
    /// Append to this file instead of stdout
    pub file_path: Option<String>,
    /// Full `EnvFilter` directive, overrides `level`
    pub env_filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            include_thread_ids: false,
            include_targets: false,
            include_file_line: false,
            span_events: "close".to_string(),
            enable_colors: true,
            file_path: None,
            env_filter: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = TypedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(TypedError::validation(format!(
                "Invalid log format: {s}. Valid options: json, pretty, compact"
            ))
            .with_context("field", "logging.format")),
        }
    }
}

/// Span events configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanEvents {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
    pub active: bool,
    pub full: bool,
}

impl SpanEvents {
    pub fn from_string(s: &str) -> Self {
        let events: Vec<String> = s.split(',').map(|e| e.trim().to_lowercase()).collect();
        let has = |name: &str| events.iter().any(|e| e == name || e == "full");

        Self {
            new: has("new"),
            enter: has("enter"),
            exit: has("exit"),
            close: has("close"),
            active: has("active"),
            full: events.iter().any(|e| e == "full"),
        }
    }

    pub fn to_fmt_span(&self) -> FmtSpan {
        if self.full {
            return FmtSpan::FULL;
        }

        let mut span = FmtSpan::NONE;
        if self.new {
            span |= FmtSpan::NEW;
        }
        if self.enter {
            span |= FmtSpan::ENTER;
        }
        if self.exit {
            span |= FmtSpan::EXIT;
        }
        if self.close {
            span |= FmtSpan::CLOSE;
        }
        if self.active {
            span |= FmtSpan::ACTIVE;
        }
        span
    }
}

/// Parse a log level name
pub fn parse_level(level: &str) -> DocFiscalResult<Level> {
    level.parse::<Level>().map_err(|_| {
        TypedError::validation(format!("Invalid log level: {level}"))
            .with_context("field", "logging.level")
    })
}

fn build_filter(config: &LoggingConfig) -> DocFiscalResult<EnvFilter> {
    if let Some(filter) = &config.env_filter {
        return EnvFilter::try_new(filter).map_err(|e| {
            TypedError::validation(format!("Invalid env filter: {e}"))
                .with_context("field", "logging.env_filter")
        });
    }

    let level = parse_level(&config.level)?;
    let mut filter = EnvFilter::from_default_env();
    for target in ["docfiscal", "docfiscal_watch"] {
        let directive = format!("{target}={level}").parse().map_err(|e| {
            TypedError::validation(format!("Invalid log directive for {target}: {e}"))
        })?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

fn build_writer(config: &LoggingConfig) -> DocFiscalResult<BoxMakeWriter> {
    match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    TypedError::validation(format!("Failed to open log file: {e}"))
                        .with_context("path", path.clone())
                })?;
            Ok(BoxMakeWriter::new(Mutex::new(file)))
        }
        None => Ok(BoxMakeWriter::new(io::stdout)),
    }
}

/// Plain stderr subscriber for events raised before [`init_logging`] runs,
/// such as those emitted while the configuration itself loads. Meant for
/// `tracing::subscriber::with_default`.
pub fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    fmt::Subscriber::builder()
        .compact()
        .with_max_level(Level::INFO)
        .with_writer(io::stderr)
        .finish()
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> DocFiscalResult<()> {
    let format = config.format.parse::<LogFormat>()?;
    let filter = build_filter(config)?;
    let writer = build_writer(config)?;
    let span_events = SpanEvents::from_string(&config.span_events).to_fmt_span();
    // Never colour a file
    let ansi = config.enable_colors && config.file_path.is_none();

    let subscriber = Registry::default().with(filter);
    let installed = match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_target(config.include_targets)
                    .with_thread_ids(config.include_thread_ids)
                    .with_file(config.include_file_line)
                    .with_line_number(config.include_file_line)
                    .with_span_events(span_events)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(config.include_targets)
                    .with_thread_ids(config.include_thread_ids)
                    .with_file(config.include_file_line)
                    .with_line_number(config.include_file_line)
                    .with_span_events(span_events)
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_target(config.include_targets)
                    .with_thread_ids(config.include_thread_ids)
                    .with_file(config.include_file_line)
                    .with_line_number(config.include_file_line)
                    .with_span_events(span_events)
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init(),
    };
    installed.map_err(|e| TypedError::client(format!("Logging already initialized: {e}")))?;

    tracing::info!(
        "⚬ Logging initialized with level: {}, format: {}",
        config.level,
        config.format
    );
    Ok(())
}
