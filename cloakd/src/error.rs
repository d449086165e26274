//! Error taxonomy shared by the adapters, the executor, and startup.

use thiserror::Error;

/// Every failure the engine distinguishes. Adapters return these; the
/// executor logs them and keeps going. Only `ConfigInvalid` and
/// `InitFailure` terminate the process.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A sensor returned no data. Callers treat the reading as zero and
    /// must not throttle based on it.
    #[error("sensor unavailable: {0}")]
    SensorUnavailable(String),

    /// An external tool failed or timed out. The next tick re-issues.
    #[error("adapter failure: {0}")]
    AdapterTransient(String),

    /// The tool backing a knob is missing on this host. The knob is
    /// disabled for the rest of the session.
    #[error("adapter unavailable: {0}")]
    AdapterPermanent(String),

    /// The target pid disappeared under us.
    #[error("process {0} no longer exists")]
    ProcessGone(u32),

    /// An unregistered strategy name was requested.
    #[error("unknown cloaking strategy `{0}`")]
    StrategyUnknown(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("initialization failed: {0}")]
    InitFailure(String),
}
