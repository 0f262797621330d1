//! Process-wide logging setup for the ledger service.

pub mod tracing;

pub use self::tracing::{LogFormat, LogSettings};

/// Install the default subscriber: `RUST_LOG` filter (default `info`), JSON
/// lines unless `LEDGER_LOG_FORMAT=pretty`.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init() {
    let format = std::env::var("LEDGER_LOG_FORMAT")
        .ok()
        .and_then(|raw| LogFormat::parse(&raw))
        .unwrap_or_default();
    self::tracing::init(LogSettings {
        format,
        ..LogSettings::default()
    });
}
