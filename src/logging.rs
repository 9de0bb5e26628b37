//! Process-wide log sink.
//!
//! The runtime logs through `tracing` and never installs a subscriber on its
//! own. Call [`init`] (or [`init_with`]) once at startup; later calls are
//! no-ops.

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();
    install(filter);
}

/// Installs a fmt subscriber with explicit filter directives such as
/// `"spider_actor=debug,reqwest=warn"`. Invalid directives are skipped.
pub fn init_with(directives: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .parse_lossy(directives);
    install(filter);
}

fn install(filter: EnvFilter) {
    // Err means a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_harmless() {
        init_with("spider_actor=debug");
        init();
        tracing::debug!("logging initialised");
    }
}
