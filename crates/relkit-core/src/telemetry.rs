//! Global subscriber setup for the `relkit` binary.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Filter from `RUST_LOG`, or `level` for every target when it is unset or invalid.
fn filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Event formatter: one JSON object per line, or human-readable text.
fn output_layer(json: bool) -> BoxedLayer {
    let layer = fmt::layer().with_target(false);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the process-wide subscriber.
///
/// Returns `false` when a subscriber was already installed; the earlier one
/// stays in effect.
pub fn init_tracing(json: bool, level: Level) -> bool {
    tracing_subscriber::registry()
        .with(output_layer(json))
        .with(filter(level))
        .try_init()
        .is_ok()
}
