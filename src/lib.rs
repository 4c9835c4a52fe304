//! SHARP TURN relay library (lib.rs)
//!
//! TURN server core (RFC 5766/8656) over UDP: STUN/ChannelData codec,
//! long-term credential authentication, allocation table with relay port
//! leasing, permissions, channel bindings and the per-allocation relay.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod stun;
pub mod turn;

pub use config::{ServerConfig, UserConfig};
pub use error::{AuthError, StunError, TurnError, TurnResult};
pub use turn::{StatsSnapshot, TurnServer, TurnServerBuilder};

/// Crate version, also the default SOFTWARE attribute suffix
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with `level` unless `RUST_LOG` is set
///
/// Safe to call more than once; later calls are ignored.
///
/// # Example
/// ```
/// sharp_turn::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // Reduce verbosity of some dependencies
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .with(filter)
        .try_init();
}
