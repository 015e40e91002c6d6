//! One process-wide logging init point, honoring `RUST_LOG`.
//!
//! Every other crate logs through the `log` facade; only the `ingest`
//! binary calls [`init`], so library crates never fight over which
//! backend owns stdout.

/// Initialises the global logger. Safe to call more than once; later calls
/// are no-ops, matching `env_logger`'s own `try_init` semantics.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
