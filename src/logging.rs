use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber. Later calls are no-ops, so
/// embedders and tests may call this freely.
pub fn init() {
    if INIT.get().is_some() {
        return;
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false));

    // Another subscriber may already be installed by the host; keep theirs.
    if subscriber.try_init().is_ok() {
        install_panic_hook();
    }

    let _ = INIT.set(());
}

fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("panic: {info}");
        previous(info);
    }));
}
