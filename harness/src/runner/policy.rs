use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Txid;
use estimator::{BlockPolicyEstimator, MempoolTx, COIN};
use rpc::{CachedRpcClient, VerboseBlock};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::error::HarnessError;
use crate::mempool_cache::MempoolCache;
use crate::rate_cache::RateCache;
use crate::scores::PredictionScorer;

use super::{
    BLOCK_COUNT_ECONOMICAL, BLOCK_COUNT_FAST, BLOCK_COUNT_STANDARD, MAX_CATCH_UP, TRI_SLOTS,
};

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Drives the bucketed block-policy estimator: new blocks first, then the
/// current mempool snapshot, then one smart-fee prediction per slot.
pub struct PolicyRunner {
    client: Arc<CachedRpcClient>,
    mempool_cache: Arc<MempoolCache>,
    rate_cache: Arc<RateCache>,
    estimator: BlockPolicyEstimator,
    scorer: PredictionScorer,
    last_seen_height: u64,
}

impl PolicyRunner {
    pub fn new(
        client: Arc<CachedRpcClient>,
        mempool_cache: Arc<MempoolCache>,
        rate_cache: Arc<RateCache>,
        output_dir: PathBuf,
    ) -> Self {
        PolicyRunner {
            client,
            mempool_cache,
            rate_cache,
            estimator: BlockPolicyEstimator::new(),
            scorer: PredictionScorer::new("policy", TRI_SLOTS, output_dir),
            last_seen_height: 0,
        }
    }

    pub async fn run(mut self) -> Result<(), HarnessError> {
        let mut ticker = interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                if err.is_transient() {
                    warn!(%err, "policy tick skipped");
                } else {
                    return Err(err);
                }
            }
        }
    }

    async fn tick(&mut self) -> Result<(), HarnessError> {
        let info = self.client.get_blockchain_info().await?;

        // Blocks must be processed before new mempool transactions: only txs
        // entering at the freshly seen height are accepted for tracking.
        if self.last_seen_height < info.blocks {
            if self.last_seen_height != 0 && info.blocks > self.last_seen_height + 1 {
                let missed = info.blocks - self.last_seen_height;
                if missed < MAX_CATCH_UP {
                    info!(missed, "processing missed blocks");
                    for height in (self.last_seen_height + 1)..info.blocks {
                        let hash = self.client.get_block_hash(height).await?;
                        let block = self.client.get_block(&hash).await?;
                        self.apply_block(&block);
                    }
                } else {
                    error!(
                        last_seen = self.last_seen_height,
                        current = info.blocks,
                        "too many blocks missed"
                    );
                }
            }

            let block = self.client.get_block(&info.best_block_hash).await?;
            self.apply_block(&block);
            self.last_seen_height = info.blocks;
        }

        let pool = self.mempool_cache.get_cache_at(info.blocks).await?;
        for (txid, entry) in &pool {
            self.estimator.process_transaction(
                &MempoolTx {
                    txid: *txid,
                    height: entry.height,
                    fee_sat: entry.fee * COIN,
                    size: entry.size,
                },
                true,
            );
        }

        let Some(economical) = self
            .estimator
            .estimate_smart_fee(BLOCK_COUNT_ECONOMICAL, false)
        else {
            info!("economical fee could not be estimated yet");
            return Ok(());
        };
        let Some(standard) = self.estimator.estimate_smart_fee(BLOCK_COUNT_STANDARD, false)
        else {
            info!("standard fee could not be estimated yet");
            return Ok(());
        };
        let Some(fast) = self.estimator.estimate_smart_fee(BLOCK_COUNT_FAST, false) else {
            info!("fast fee could not be estimated yet");
            return Ok(());
        };

        info!(
            economical_sat_per_byte = economical.sat_per_byte(),
            standard_sat_per_byte = standard.sat_per_byte(),
            fast_sat_per_byte = fast.sat_per_byte(),
            "estimated policy fees"
        );

        let rates = self.rate_cache.get_fee_rates_for_block(info.blocks).await?;
        self.scorer.add_prediction(
            info.blocks,
            rates,
            vec![
                economical.sat_per_byte(),
                standard.sat_per_byte(),
                fast.sat_per_byte(),
            ],
        );
        self.scorer.score_and_flush()
    }

    fn apply_block(&mut self, block: &VerboseBlock) {
        let txids: Vec<Txid> = block.tx.iter().map(|tx| tx.txid).collect();
        self.estimator.process_block(block.height, &txids);
    }
}
