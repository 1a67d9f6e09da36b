//! Structured logging setup: a `tracing`
//! subscriber configured from an env filter, plus the error
//! categorization trait reconcile errors implement so failures carry a
//! stable `category` field for dashboards and alerts.
use tracing_subscriber::EnvFilter;

/// Implemented by every reconcile-path error enum so `tracing` events
/// can tag failures with a stable category independent of the
/// human-readable `Display` message.
pub trait ReconcilerError: std::error::Error {
    fn category(&self) -> &'static str;
}

pub fn initialize_logging(app_name: &str) {
    let filter = EnvFilter::try_from_env("FLEETLB_LOG")
        .or_else(|_| EnvFilter::try_new(format!("info,{app_name}=debug")))
        .expect("default log filter is valid");
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
