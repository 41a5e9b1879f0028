//! Process-wide tracing setup

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// RFC 3339 timestamps in local time
struct LocalTimer;

impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().to_rfc3339())
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. With `quiet` nothing is written to the console, which keeps the
/// terminal UI readable.
pub fn init_logging(quiet: bool) {
    let console_layer = (!quiet).then(|| {
        fmt::Layer::new()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_timer(LocalTimer)
    });

    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // a second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .try_init();
}
