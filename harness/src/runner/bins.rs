use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Txid;
use estimator::bins::{DEFAULT_MAX_ROLLBACK, DEFAULT_MIN_REGISTERED_BLOCKS};
use estimator::{BinFeeEstimator, ConfirmedBlock, COIN};
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

const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Drives the bin-based rolling estimator: mempool observations first, then
/// any newly arrived blocks, then one estimate per slot.
pub struct BinRunner {
    client: Arc<CachedRpcClient>,
    mempool_cache: Arc<MempoolCache>,
    rate_cache: Arc<RateCache>,
    estimator: BinFeeEstimator,
    scorer: PredictionScorer,
    last_seen_height: u64,
}

impl BinRunner {
    pub fn new(
        client: Arc<CachedRpcClient>,
        mempool_cache: Arc<MempoolCache>,
        rate_cache: Arc<RateCache>,
        output_dir: PathBuf,
    ) -> Self {
        BinRunner {
            client,
            mempool_cache,
            rate_cache,
            estimator: BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, DEFAULT_MIN_REGISTERED_BLOCKS),
            scorer: PredictionScorer::new("btcutil", TRI_SLOTS, output_dir),
            last_seen_height: 0,
        }
    }

    pub async fn run(mut self) -> Result<(), HarnessError> {
        let mut ticker = interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                if err.is_transient() {
                    warn!(%err, "bin tick skipped");
                } else {
                    return Err(err);
                }
            }
        }
    }

    async fn tick(&mut self) -> Result<(), HarnessError> {
        let info = self.client.get_blockchain_info().await?;

        let pool = self.mempool_cache.get_cache_at(info.blocks).await?;
        for (txid, entry) in &pool {
            self.estimator
                .observe_transaction(*txid, entry.fee * COIN, entry.size, entry.height);
        }

        if self.last_seen_height < info.blocks {
            if self.last_seen_height != 0 && info.blocks != self.last_seen_height + 1 {
                let missed = info.blocks - self.last_seen_height;
                if missed < MAX_CATCH_UP {
                    info!(missed, "registering missed blocks");
                    for height in (self.last_seen_height + 1)..info.blocks {
                        let hash = self.client.get_block_hash(height).await?;
                        let block = self.client.get_block(&hash).await?;
                        if let Err(err) = self.register(&block) {
                            error!(%err, height, "block could not be registered");
                            return Ok(());
                        }
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
            if let Err(err) = self.register(&block) {
                error!(%err, height = info.blocks, "block could not be registered");
                return Ok(());
            }
            self.last_seen_height = info.blocks;
        }

        let economical = match self.estimator.estimate_fee(BLOCK_COUNT_ECONOMICAL as usize) {
            Ok(rate) => rate,
            Err(err) => {
                info!(%err, "economical fee could not be estimated");
                return Ok(());
            }
        };
        let standard = match self.estimator.estimate_fee(BLOCK_COUNT_STANDARD as usize) {
            Ok(rate) => rate,
            Err(err) => {
                info!(%err, "standard fee could not be estimated");
                return Ok(());
            }
        };
        let fast = match self.estimator.estimate_fee(BLOCK_COUNT_FAST as usize) {
            Ok(rate) => rate,
            Err(err) => {
                info!(%err, "fast fee could not be estimated");
                return Ok(());
            }
        };

        info!(
            economical_sat_per_byte = economical.sat_per_byte(),
            standard_sat_per_byte = standard.sat_per_byte(),
            fast_sat_per_byte = fast.sat_per_byte(),
            "estimated bin fees"
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

    fn register(&mut self, block: &VerboseBlock) -> Result<(), estimator::EstimateError> {
        let txids: Vec<Txid> = block.tx.iter().map(|tx| tx.txid).collect();
        self.estimator.register_block(&ConfirmedBlock {
            hash: block.hash,
            height: block.height,
            txids,
        })
    }
}
