use once_cell::sync::OnceCell;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGER_INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber. Later calls are no-ops.
///
/// The filter comes from `RUST_LOG` and defaults to `info`; e.g.
/// `RUST_LOG=selector=debug` shows strategy switches and detaches.
pub fn init_logger(service_name: &'static str, json: bool) {
    LOGGER_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let builder = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_span_events(fmt::format::FmtSpan::CLOSE)
            .with_writer(std::io::stderr);

        // try_init: a test harness or embedding binary may already own the global slot
        let installed = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };

        match installed {
            Ok(()) => tracing::info!(service = service_name, json, "logger initialized"),
            Err(e) => eprintln!("{service_name}: logger already installed: {e}"),
        }
    });
}
