//! Logging setup for di-runtime
//!
//! The container emits `tracing` events under the `di_runtime` target:
//!
//! - `trace`: cache hits and resolution entry points
//! - `debug`: registrations, sealing, construction, hooks, scope open/close
//! - `info`: container shutdown
//! - `warn`: failed resolutions, hook failures, scopes dropped while open
//!
//! This module installs a `tracing-subscriber` for applications that do not
//! bring their own.
//!
//! # Features
//!
//! - `logging` - Emit events (default)
//! - `logging-json` - JSON structured output (recommended for production)
//! - `logging-pretty` - Human-readable output (recommended for development)
//!
//! # Example
//!
//! ```rust,ignore
//! use di_runtime::logging;
//!
//! // Default format for the enabled features
//! logging::init();
//!
//! // Or configure explicitly
//! logging::builder()
//!     .trace()
//!     .di_only()
//!     .pretty()
//!     .init();
//! ```

use tracing::Level;

/// The target every event of this crate is emitted under.
pub const TARGET: &str = "di_runtime";

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON structured logging (production default)
    #[default]
    Json,
    /// Multi-line human-readable output
    Pretty,
    /// Compact single-line output
    Compact,
}

/// Errors from installing a subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// A global subscriber was already installed
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
    /// The crate was built without `logging-json` or `logging-pretty`
    #[error("no subscriber backend enabled (enable `logging-json` or `logging-pretty`)")]
    Unavailable,
}

/// Builder for logging configuration
#[derive(Debug, Clone)]
pub struct LoggingBuilder {
    level: Level,
    format: LogFormat,
    targets: Vec<&'static str>,
    respect_env: bool,
    with_file: bool,
    with_line_number: bool,
    with_thread_ids: bool,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self {
            level: Level::DEBUG,
            format: LogFormat::Json,
            targets: Vec::new(),
            respect_env: false,
            with_file: false,
            with_line_number: false,
            with_thread_ids: false,
        }
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum log level
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn trace(self) -> Self {
        self.with_level(Level::TRACE)
    }

    pub fn debug(self) -> Self {
        self.with_level(Level::DEBUG)
    }

    pub fn info(self) -> Self {
        self.with_level(Level::INFO)
    }

    pub fn warn(self) -> Self {
        self.with_level(Level::WARN)
    }

    /// Restrict output to `target`. May be called several times.
    pub fn with_target_filter(mut self, target: &'static str) -> Self {
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
        self
    }

    /// Only show di-runtime events
    pub fn di_only(self) -> Self {
        self.with_target_filter(TARGET)
    }

    /// Let `RUST_LOG` override the configured filter when it is set.
    pub fn from_env(mut self) -> Self {
        self.respect_env = true;
        self
    }

    pub fn with_file(mut self) -> Self {
        self.with_file = true;
        self
    }

    pub fn with_line_number(mut self) -> Self {
        self.with_line_number = true;
        self
    }

    pub fn with_thread_ids(mut self) -> Self {
        self.with_thread_ids = true;
        self
    }

    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.format = LogFormat::Pretty;
        self
    }

    pub fn compact(mut self) -> Self {
        self.format = LogFormat::Compact;
        self
    }

    /// The `EnvFilter` directive this builder installs.
    ///
    /// `"debug"` without target filters, `"di_runtime=debug"` (comma
    /// separated for several targets) otherwise.
    pub fn directive(&self) -> String {
        let level = self.level.to_string().to_ascii_lowercase();
        if self.targets.is_empty() {
            level
        } else {
            self.targets
                .iter()
                .map(|target| format!("{target}={level}"))
                .collect::<Vec<_>>()
                .join(",")
        }
    }

    /// Install the subscriber globally.
    #[cfg(any(feature = "logging-json", feature = "logging-pretty"))]
    pub fn try_init(self) -> Result<(), LoggingError> {
        use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

        let filter = match self.respect_env {
            true => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directive())),
            false => EnvFilter::new(self.directive()),
        };

        let base = fmt::layer()
            .with_file(self.with_file)
            .with_line_number(self.with_line_number)
            .with_thread_ids(self.with_thread_ids)
            .with_target(true);

        let layer: Box<dyn Layer<Registry> + Send + Sync> = match self.format {
            #[cfg(feature = "logging-json")]
            LogFormat::Json => base.json().boxed(),
            // Without the json backend, fall back to the default text format
            #[cfg(not(feature = "logging-json"))]
            LogFormat::Json => base.boxed(),
            LogFormat::Pretty => base.pretty().boxed(),
            LogFormat::Compact => base.compact().boxed(),
        };

        tracing_subscriber::registry()
            .with(layer)
            .with(filter)
            .try_init()
            .map_err(|_| LoggingError::AlreadyInitialized)
    }

    #[cfg(not(any(feature = "logging-json", feature = "logging-pretty")))]
    pub fn try_init(self) -> Result<(), LoggingError> {
        Err(LoggingError::Unavailable)
    }

    /// Install the subscriber globally, ignoring a subscriber that is
    /// already in place.
    pub fn init(self) {
        let _ = self.try_init();
    }
}

/// Create a new logging builder
pub fn builder() -> LoggingBuilder {
    LoggingBuilder::new()
}

/// Initialize logging with the default format for the enabled features:
/// JSON with `logging-json`, pretty with only `logging-pretty`. Honors
/// `RUST_LOG`.
pub fn init() {
    let builder = builder().from_env();
    if cfg!(feature = "logging-json") {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

/// Initialize JSON structured logging at debug level.
///
/// # Example output
/// ```json
/// {"timestamp":"2024-01-01T00:00:00.000Z","level":"DEBUG","target":"di_runtime","fields":{"message":"Opened scope","scope":"scope-1","parent":"root","depth":1}}
/// ```
pub fn init_json() {
    builder().json().debug().init();
}

/// Initialize human-readable logging at debug level.
pub fn init_pretty() {
    builder().pretty().debug().init();
}

/// Initialize logging for di-runtime events only.
pub fn init_di_only() {
    builder().di_only().debug().pretty().init();
}
