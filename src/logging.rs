//! Logging setup.
//!
//! The library only emits [`tracing`] events. Programs that want them on
//! stderr call [`init`] once at startup; later calls are no-ops.
//!
//! Filters come from the `FERROLINK_LOG` environment variable using the
//! usual `EnvFilter` directive syntax (`debug`, `ferrolink=trace`, ...).
//! The default level is `info`.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives.
pub const FILTER_ENV: &str = "FERROLINK_LOG";

/// Default filter when [`FILTER_ENV`] is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

static INIT: Once = Once::new();

/// Install a stderr `fmt` subscriber for this process.
///
/// Does nothing if this function already ran, or if another global
/// subscriber was installed first.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .try_init();
    });
}
