//! Log subscriber setup for binaries and tests embedding a service.

/// Installs a compact `tracing` subscriber filtered by `RUST_LOG`.
///
/// - `RUST_LOG=info`: service start, shutdown and serve loop events
/// - `RUST_LOG=res_service=debug`: routing decisions and group drain activity
/// - `RUST_LOG=res_service=trace`: every inbound message and outbound publish
///
/// Handler faults are logged at `error`, failed publishes and elapsed request
/// deadlines at `warn`.
///
/// Calling it more than once is harmless; only the first call installs.
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}
