//! Process-level logging setup. Treated as a thin external collaborator
//! (SPEC_FULL.md §1) -- we initialize `tracing-subscriber` once and defer
//! to `RUST_LOG`/the given default for filtering, the way `clash_lib`'s
//! own `app::logging` module wires `tracing` up, minus the websocket log
//! broadcast (out of scope here, see SPEC_FULL.md §1).

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. Safe to call once; a second
/// call is a no-op (errors from `try_init` are swallowed).
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
