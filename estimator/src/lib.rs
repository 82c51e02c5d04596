//! Fee estimation algorithms for the research harness.
//!
//! Two estimators share the same inputs (mempool observations and confirmed
//! blocks) and produce the same kind of answer (a feerate per confirmation
//! target):
//!
//! - [`policy::BlockPolicyEstimator`] keeps exponentially decayed
//!   per-feerate-bucket confirmation statistics across three time horizons
//!   and answers "what feerate gets P% of transactions confirmed within N
//!   blocks?".
//! - [`bins::BinFeeEstimator`] keeps a fixed set of bounded bins indexed by
//!   observed confirmation lag, with random replacement and rollback support
//!   for orphaned blocks.

pub mod bins;
pub mod buckets;
pub mod conf_stats;
pub mod error;
pub mod fee_rate;
pub mod policy;

pub use bins::{BinFeeEstimator, ConfirmedBlock};
pub use buckets::BucketTable;
pub use conf_stats::{EstimationResult, EstimatorBucket, TxConfirmStats};
pub use error::EstimateError;
pub use fee_rate::{FeeRate, COIN};
pub use policy::{BlockPolicyEstimator, FeeHorizon, MempoolTx};
