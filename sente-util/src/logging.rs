use atty::Stream;
use chrono::Timelike;
use once_cell::sync::Lazy;
use std::env;
use std::time::Instant;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

struct WallClockAndUptime;

impl FormatTime for WallClockAndUptime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        let elapsed = START_TIME.elapsed();

        write!(
            w,
            "{:02}:{:02}:{:02} +{}.{:03}s",
            now.hour(),
            now.minute(),
            now.second(),
            elapsed.as_secs(),
            elapsed.subsec_millis()
        )
    }
}

/// Install the global tracing subscriber. `RUST_LOG` controls the filter
/// (default `info`), `RUST_LOG_STYLE` forces ANSI colors on or off.
pub fn setup_logging() {
    let ansi = match env::var("RUST_LOG_STYLE").as_deref() {
        Ok("always") => true,
        Ok("never") => false,
        _ => atty::is(Stream::Stdout),
    };

    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(WallClockAndUptime)
        .with_ansi(ansi)
        .with_target(false)
        .with_thread_names(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
