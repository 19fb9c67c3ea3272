//! Subscriber setup for binaries embedding the engine.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{MaintError, Result};

/// Installs a formatting subscriber writing to stderr.
///
/// `level` is an `EnvFilter` directive such as `info` or
/// `vecmaint=debug,warn`; `RUST_LOG` takes precedence when set.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| MaintError::InvalidConfig(format!("invalid log level: {e}")))?,
    };
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| MaintError::Message("logging already initialized".into()))
}
