//! Logging setup.

/// Installs an env-filtered `fmt` subscriber unless the host application
/// already installed one. Controlled by `RUST_LOG`.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}
