//! Harness plumbing shared by the estimation runners: the mempool snapshot
//! cache, the per-block actual-feerate cache, and the prediction scorer that
//! grades every estimator against the blocks that follow its predictions.

pub mod error;
pub mod mempool_cache;
pub mod rate_cache;
pub mod runner;
pub mod scores;

pub use error::HarnessError;
pub use mempool_cache::MempoolCache;
pub use rate_cache::{FeeRates, RateCache};
pub use scores::PredictionScorer;
