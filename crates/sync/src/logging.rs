//! Tracing setup for hosts embedding the engine.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,volsync_transfer=debug,volsync_sync=debug";

/// Installs a fmt subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_twice_is_harmless() {
        super::init();
        super::init();
        tracing::debug!("logging initialised");
    }
}
