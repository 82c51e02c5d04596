//! JSON-RPC access to the observed Bitcoin node.
//!
//! The harness only consumes a handful of read-only calls; they are typed
//! here and served through [`CachedRpcClient`], which keeps verbose raw
//! transactions in an expiring in-memory cache because the rate cache
//! resolves every input of every block transaction.

pub mod client;
pub mod error;
pub mod types;

pub use client::{CachedRpcClient, DEFAULT_EXPIRATION};
pub use error::RpcError;
pub use types::{
    BlockchainInfo, MempoolEntry, RawTransaction, SmartFeeResult, TxInput, TxOutput, VerboseBlock,
};
