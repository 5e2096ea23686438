//! Debug logging utilities

use tracing_subscriber::{fmt, EnvFilter};

/// Logger setup for test harnesses using sandboxes
pub struct DebugLogger;

impl DebugLogger {
    fn filter(debug: bool) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if debug {
                EnvFilter::new("grain_sandbox=debug")
            } else {
                EnvFilter::new("grain_sandbox=info")
            }
        })
    }

    /// Initialize the debug logger. Panics if a global subscriber is already set.
    pub fn init(debug: bool) {
        fmt()
            .with_env_filter(Self::filter(debug))
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(debug)
            .init();
    }

    /// Like [`DebugLogger::init`], but returns `false` instead of panicking when
    /// a subscriber is already installed (e.g. by another test)
    pub fn try_init(debug: bool) -> bool {
        fmt()
            .with_env_filter(Self::filter(debug))
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(debug)
            .with_test_writer()
            .try_init()
            .is_ok()
    }
}
