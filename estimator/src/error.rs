use thiserror::Error;

/// Recoverable "no estimate" conditions reported to callers.
///
/// Invariant violations (negative confirmation counts, cross-horizon bucket
/// mismatches, rollback bookkeeping corruption) are programming errors and
/// panic instead of surfacing here.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EstimateError {
    #[error("not enough blocks have been observed ({registered} < {required})")]
    NotReady { registered: u32, required: u32 },

    #[error("confirmation target {target} is outside the tracked range 1..={max}")]
    TargetOutOfRange { target: u64, max: u64 },

    #[error("intermediate block not recorded; last known height is {last_known}, new height is {got}")]
    StaleBlock { last_known: u64, got: u64 },

    #[error("no such block was recently registered")]
    UnknownRollbackBlock,
}
