//! End-to-end tests: the TCP binding against an in-process SMB2 peer

pub mod loopback;
pub mod scenarios;

pub use loopback::{FakeServer, ServerOptions};

/// Route `tracing` output to the test harness; `RUST_LOG` overrides the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
