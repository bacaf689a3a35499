//! Multi-party room SFU: room registry, signaling, recording and the
//! client-side room view.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod recording;
pub mod sfu;

pub use config::Config;
pub use error::{ErrorKind, Result, SfuError};

/// Installs the global `tracing` subscriber. `RUST_LOG` filters (default
/// `info`); `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {}", e);
    }
}
