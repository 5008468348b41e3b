pub mod common;
pub mod failure_injection;
pub mod scenarios;

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls the output.
pub fn init_test_environment() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
