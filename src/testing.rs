//! Helpers for testing the protocol engine.
//!
//! This module is only compiled when `test` is enabled.
use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

/// Initialize tracing with a subscriber and some reasonable defaults suitable for enabling log
/// output in tests.
///
/// This is idempotent; it can be called from multiple tests in multiple threads but will only
/// initialize tracing once.
pub fn init_test_logging() {
    use std::sync::OnceLock;

    const DEFAULT_LOG_FILTER: &str = "trace";
    static INIT_LOGGING: OnceLock<()> = OnceLock::new();

    INIT_LOGGING.get_or_init(|| {
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
            .with_test_writer()
            .try_init()
            .unwrap()
    });
}

/// Create a connected pair of in-memory byte pipes, each already split into
/// the read and write halves [`crate::attach`] wants.
///
/// Return value is a tuple, `(client_halves, server_halves)`, where each side
/// is `(reader, writer)`.
#[allow(clippy::type_complexity)]
pub fn setup_test_pipe() -> (
    (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>),
    (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>),
) {
    let (client, server) = duplex(64 * 1024);
    (split(client), split(server))
}
