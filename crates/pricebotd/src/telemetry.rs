use std::sync::OnceLock;

use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _};

static TELEMETRY_INIT: OnceLock<()> = OnceLock::new();

/// Crates that log every gateway heartbeat and HTTP request at info.
const NOISY_CRATES: [&str; 5] = [
    "h2",
    "hyper_util",
    "serenity",
    "tungstenite",
    "alloy_transport_ipc",
];

pub fn get_subscriber() -> impl Subscriber + Send + Sync {
    // use the passed log level or default to RUST_LOG value
    let filter = NOISY_CRATES.iter().fold(
        EnvFilter::from_default_env(),
        |filter, krate| match format!("{krate}=warn").parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        },
    );

    let fmt_layer = fmt::layer().with_file(true).with_line_number(true);

    tracing_subscriber::Registry::default()
        .with(filter)
        .with(fmt_layer)
}

pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    if TELEMETRY_INIT.set(()).is_err() {
        return;
    }
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }
}
