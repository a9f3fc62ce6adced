use thiserror::Error;

/// Errors surfaced by the lifecycle and configuration surface.
///
/// The allocation hot path never produces these: profiler failures there
/// degrade sampling accuracy silently instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfilerError {
    #[error("cannot enable the sampling heap profiler without allocation hooks")]
    HooksUnavailable,

    #[error("allocation hooks are already routed to another profiler instance")]
    AlreadyInstalled,

    #[error("stop() called while the profiler is not running")]
    NotRunning,

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidConfig {
        key: String,
        value: String,
        reason: String,
    },
}
