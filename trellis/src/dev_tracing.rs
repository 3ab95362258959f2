use std::env;

/// Development helper: install a tracing subscriber when `RUST_LOG` is set.
///
/// The integration suites call this at the top of every test so fabric
/// internals (topology bootstrap, poll ticks, reaper sweeps) can be watched
/// with e.g. `RUST_LOG=trellis_core=debug`. Without `RUST_LOG`, or when a
/// global subscriber is already installed, this does nothing.
pub fn init_tracing() {
    if env::var("RUST_LOG").is_err() {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
