use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    /// The mempool snapshotter has not observed this height yet.
    #[error("mempool cache has no snapshot for height {height}")]
    CacheNotRecorded { height: u64 },

    /// The per-height rate lock stayed contended through every retry.
    #[error("per-height rate lock is busy for height {height}")]
    RateLockBusy { height: u64 },

    #[error(transparent)]
    Rpc(#[from] rpc::RpcError),

    #[error("output error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Transient failures are logged and the tick is skipped; the next tick
    /// retries. Anything else terminates the runner.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HarnessError::CacheNotRecorded { .. }
                | HarnessError::RateLockBusy { .. }
                | HarnessError::Rpc(_)
        )
    }
}
