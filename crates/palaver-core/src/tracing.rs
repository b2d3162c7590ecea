//! Log subscriber setup.
//!
//! The palaver crates only emit `tracing` events; whoever embeds the engine
//! calls [`init_tracing`] once to decide where those events go.
//!
//! ```ignore
//! use palaver_core::tracing::{init_tracing, LogFormat, TracingConfig};
//!
//! // watch raw stream traffic while keeping the event loop quiet
//! let config = TracingConfig::default()
//!     .with_wire_level(tracing::Level::TRACE)
//!     .with_format(LogFormat::Compact);
//! init_tracing(config).expect("failed to initialize tracing");
//! ```

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Target of the XML stream framing and dispatcher events.
pub const WIRE_TARGET: &str = "palaver_protocol";
/// Target of the poll loop, sockets and timers.
pub const EVENT_LOOP_TARGET: &str = "palaver_engine::event_queue";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("invalid log filter `{directive}`: {source}")]
    Filter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, colored output for terminals.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per line.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Level for every `palaver*` target without a more specific setting.
    pub level: Level,
    /// Override for stanza framing and dispatch.
    pub wire_level: Option<Level>,
    /// Override for the poll loop, usually noisy at `TRACE`.
    pub event_loop_level: Option<Level>,
    pub format: LogFormat,
    pub source_location: bool,
    pub timestamps: bool,
    /// Log span open/close, useful to time individual poll passes.
    pub span_lifecycle: bool,
    /// Raw directive that replaces everything above and `RUST_LOG`.
    pub filter_override: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            wire_level: None,
            event_loop_level: None,
            format: LogFormat::Pretty,
            source_location: false,
            timestamps: true,
            span_lifecycle: false,
            filter_override: None,
        }
    }
}

impl TracingConfig {
    /// JSON lines with locations and span lifecycle, for log collectors.
    #[must_use]
    pub fn structured() -> Self {
        Self {
            format: LogFormat::Json,
            source_location: true,
            span_lifecycle: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_wire_level(mut self, level: Level) -> Self {
        self.wire_level = Some(level);
        self
    }

    #[must_use]
    pub fn with_event_loop_level(mut self, level: Level) -> Self {
        self.event_loop_level = Some(level);
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, directive: impl Into<String>) -> Self {
        self.filter_override = Some(directive.into());
        self
    }

    /// Filter directive derived from the per-component levels.
    pub fn directives(&self) -> String {
        let mut directives = format!("palaver={0},palaver_core={0},palaver_engine={0}", self.level);
        if let Some(level) = self.wire_level {
            directives.push_str(&format!(",{WIRE_TARGET}={level}"));
        } else {
            directives.push_str(&format!(",{WIRE_TARGET}={}", self.level));
        }
        if let Some(level) = self.event_loop_level {
            directives.push_str(&format!(",{EVENT_LOOP_TARGET}={level}"));
        }
        directives
    }

    fn env_filter(&self) -> Result<EnvFilter, TracingError> {
        let parse = |directive: String| {
            EnvFilter::try_new(&directive).map_err(|source| TracingError::Filter { directive, source })
        };
        if let Some(directive) = &self.filter_override {
            return parse(directive.clone());
        }
        match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(directive) if !directive.trim().is_empty() => parse(directive),
            _ => parse(self.directives()),
        }
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let spans = if self.span_lifecycle {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_file(self.source_location)
            .with_line_number(self.source_location)
            .with_span_events(spans);

        match (self.format, self.timestamps) {
            (LogFormat::Pretty, true) => base.pretty().boxed(),
            (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
            (LogFormat::Compact, true) => base.compact().boxed(),
            (LogFormat::Compact, false) => base.compact().without_time().boxed(),
            (LogFormat::Json, true) => base.json().boxed(),
            (LogFormat::Json, false) => base.json().without_time().boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured levels unless
/// [`TracingConfig::with_filter`] was used.
///
/// # Errors
///
/// Fails when a subscriber is already installed or a directive does not
/// parse.
pub fn init_tracing(config: TracingConfig) -> Result<(), TracingError> {
    let filter = config.env_filter()?;
    let subscriber = tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_follow_base_level() {
        let config = TracingConfig::default().with_level(Level::WARN);
        assert_eq!(
            config.directives(),
            "palaver=WARN,palaver_core=WARN,palaver_engine=WARN,palaver_protocol=WARN"
        );
    }

    #[test]
    fn component_overrides_are_appended() {
        let config = TracingConfig::default()
            .with_wire_level(Level::TRACE)
            .with_event_loop_level(Level::ERROR);
        let directives = config.directives();
        assert!(directives.contains("palaver_protocol=TRACE"));
        assert!(directives.ends_with("palaver_engine::event_queue=ERROR"));
    }

    #[test]
    fn structured_preset() {
        let config = TracingConfig::structured();
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.span_lifecycle);
        assert_eq!(config.level, Level::INFO);
    }

    #[test]
    fn override_filter_is_validated() {
        let config = TracingConfig::default().with_filter("palaver=notalevel");
        match config.env_filter() {
            Err(TracingError::Filter { directive, .. }) => assert_eq!(directive, "palaver=notalevel"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn generated_directives_parse() {
        let config = TracingConfig::default()
            .with_wire_level(Level::DEBUG)
            .with_event_loop_level(Level::TRACE);
        assert!(EnvFilter::try_new(config.directives()).is_ok());
    }
}
