use tracing_subscriber::EnvFilter;

pub mod audio;
pub mod channel;
pub mod cloud;
pub mod config;
pub mod device;
pub mod led;
pub mod lkg;
pub mod lock;
pub mod model;
pub mod process;
pub mod resolver;
pub mod supervisor;
pub mod updater;

/// Installs the global tracing subscriber for a binary. `RUST_LOG` wins over
/// the configured debug flag.
pub fn install_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
