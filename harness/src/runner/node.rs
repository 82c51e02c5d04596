use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use estimator::COIN;
use rpc::CachedRpcClient;
use tokio::time::interval;
use tracing::{info, warn};

use crate::error::HarnessError;
use crate::rate_cache::RateCache;
use crate::scores::PredictionScorer;

use super::{BLOCK_COUNT_ECONOMICAL, BLOCK_COUNT_FAST, BLOCK_COUNT_STANDARD, TRI_SLOTS};

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Scores the node's own `estimatesmartfee` answers, as a baseline for the
/// in-process estimators.
pub struct NodeRunner {
    client: Arc<CachedRpcClient>,
    rate_cache: Arc<RateCache>,
    scorer: PredictionScorer,
    last_observed_height: u64,
}

impl NodeRunner {
    pub fn new(
        client: Arc<CachedRpcClient>,
        rate_cache: Arc<RateCache>,
        output_dir: PathBuf,
    ) -> Self {
        NodeRunner {
            client,
            rate_cache,
            scorer: PredictionScorer::new("core", TRI_SLOTS, output_dir),
            last_observed_height: 0,
        }
    }

    pub async fn run(mut self) -> Result<(), HarnessError> {
        let mut ticker = interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                if err.is_transient() {
                    warn!(%err, "node tick skipped");
                } else {
                    return Err(err);
                }
            }
        }
    }

    async fn tick(&mut self) -> Result<(), HarnessError> {
        let info = self.client.get_blockchain_info().await?;

        let economical = self.smart_fee(BLOCK_COUNT_ECONOMICAL).await?;
        let standard = self.smart_fee(BLOCK_COUNT_STANDARD).await?;
        let fast = self.smart_fee(BLOCK_COUNT_FAST).await?;
        info!(economical, standard, fast, "got node smart rates");

        if self.last_observed_height < info.blocks {
            let rates = self.rate_cache.get_fee_rates_for_block(info.blocks).await?;
            self.last_observed_height = info.blocks;
            self.scorer
                .add_prediction(info.blocks, rates, vec![economical, standard, fast]);
            self.scorer.score_and_flush()?;
        }

        Ok(())
    }

    /// The node's estimate converted from BTC/kvB to sat/B; zero when the
    /// node has no answer yet.
    async fn smart_fee(&self, conf_target: u64) -> Result<f64, HarnessError> {
        let result = self.client.estimate_smart_fee(conf_target).await?;
        match result.fee_rate {
            Some(btc_per_kvb) => Ok(btc_per_kvb / 1000.0 * COIN),
            None => {
                warn!(
                    conf_target,
                    errors = ?result.errors,
                    "node returned no smart fee estimate"
                );
                Ok(0.0)
            }
        }
    }
}
