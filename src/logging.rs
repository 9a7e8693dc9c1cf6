//! Unified logging for daemon output.
//!
//! Provides compact timestamped logging with per-module level configuration.
//! Supports `RUST_LOG` environment variable for runtime overrides.
//!
//! # Configuration
//!
//! ```toml
//! [logging]
//! default = "info"
//!
//! [logging.modules]
//! watch = "debug"   # enable watch-index debug logs
//! ```
//!
//! # Environment Variable
//!
//! `RUST_LOG` takes precedence over config:
//! ```bash
//! RUST_LOG=debug vigild
//! RUST_LOG=watch=debug,daemon=trace vigild
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Compact time format: HH:MM:SS.mmm
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Initialize logging with configuration.
///
/// Call once at startup. Safe to call multiple times (only first call takes
/// effect), which also means a restarted worker keeps the filter it booted
/// with until the process itself is relaunched.
///
/// The `RUST_LOG` environment variable takes precedence over config settings.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        // RUST_LOG env var takes precedence over config
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            let mut filter_str = config.default.clone();
            for (module, level) in &config.modules {
                filter_str.push_str(&format!(",{module}={level}"));
            }
            EnvFilter::new(&filter_str)
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_timer(CompactTime)
            .with_level(true)
            .with_filter(filter);

        tracing_subscriber::registry().with(fmt_layer).init();
    });
}

/// Initialize logging with default configuration.
///
/// The default level is `debug` when stderr is a terminal and `info`
/// otherwise; use `RUST_LOG` for anything else.
pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// Log an event with subsystem context.
///
/// # Examples
/// ```ignore
/// log_event!("watch", "dispatch", "{}", path.display());
/// log_event!("daemon", "started");
/// ```
#[macro_export]
macro_rules! log_event {
    ($subsystem:expr, $event:expr) => {
        tracing::info!("[{}] {}", $subsystem, $event)
    };
    ($subsystem:expr, $event:expr, $($arg:tt)*) => {
        tracing::info!("[{}] {}: {}", $subsystem, $event, format!($($arg)*))
    };
}

/// Debug-only event logging.
///
/// # Examples
/// ```ignore
/// debug_event!("daemon", "unmatched store key", "{}", key);
/// ```
#[macro_export]
macro_rules! debug_event {
    ($subsystem:expr, $event:expr) => {
        tracing::debug!("[{}] {}", $subsystem, $event)
    };
    ($subsystem:expr, $event:expr, $($arg:tt)*) => {
        tracing::debug!("[{}] {}: {}", $subsystem, $event, format!($($arg)*))
    };
}
