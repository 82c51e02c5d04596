use bitcoin::{BlockHash, Txid};
use serde::Deserialize;

/// Subset of `getblockchaininfo` the harness reads.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: BlockHash,
}

/// One entry of `getrawmempool` with `verbose=true`.
#[derive(Debug, Clone, Deserialize)]
pub struct MempoolEntry {
    /// Fee in BTC.
    pub fee: f64,
    /// Size in bytes.
    #[serde(alias = "vsize")]
    pub size: u64,
    /// Chain height when the transaction entered the mempool.
    pub height: u64,
    #[serde(rename = "startingpriority", default)]
    pub starting_priority: f64,
}

/// One input of a verbose raw transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct TxInput {
    #[serde(default)]
    pub txid: Option<Txid>,
    #[serde(default)]
    pub vout: u32,
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub txinwitness: Vec<String>,
}

impl TxInput {
    pub fn is_coinbase(&self) -> bool {
        self.coinbase.is_some()
    }

    pub fn has_witness(&self) -> bool {
        !self.txinwitness.is_empty()
    }
}

/// One output of a verbose raw transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct TxOutput {
    /// Value in BTC.
    pub value: f64,
}

/// `getrawtransaction` with `verbose=true`, reduced to the fields the fee
/// computation needs.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTransaction {
    pub txid: Txid,
    pub size: u64,
    pub vin: Vec<TxInput>,
    pub vout: Vec<TxOutput>,
}

/// `getblock` at verbosity 2: header fields plus fully decoded transactions.
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseBlock {
    pub hash: BlockHash,
    pub height: u64,
    /// Header timestamp, seconds since epoch.
    pub time: i64,
    pub tx: Vec<RawTransaction>,
}

/// `estimatesmartfee` result.
#[derive(Debug, Clone, Deserialize)]
pub struct SmartFeeResult {
    /// Estimate in BTC/kvB; absent when the node has no answer.
    #[serde(rename = "feerate", default)]
    pub fee_rate: Option<f64>,
    pub blocks: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}
