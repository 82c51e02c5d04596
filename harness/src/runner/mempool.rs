use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use estimator::COIN;
use rpc::CachedRpcClient;
use tokio::time::interval;
use tracing::{info, warn};

use crate::error::HarnessError;
use crate::mempool_cache::MempoolCache;
use crate::rate_cache::RateCache;
use crate::scores::PredictionScorer;

use super::SINGLE_SLOT;

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Blocks averaged to approximate the next block's transaction count.
const BLOCK_SAMPLE: u64 = 5;

/// Starting percentile of the block-sized window of pool rates; it drops by
/// `PERCENTILE_RANGE` as the expected block interval elapses.
const PERCENTILE: f64 = 80.0;
const PERCENTILE_RANGE: f64 = 60.0;

/// Expected block interval.
const TARGET_BLOCK_SECS: f64 = 600.0;

/// Estimate from the mempool window expected to fit into the next block.
///
/// The longer the current block has been worked on, the sooner the next one
/// is expected, and the lower the percentile needed to get in.
pub(crate) fn window_estimate(
    sorted_rates: &[f64],
    avg_block_txs: usize,
    pow_progress: f64,
) -> Option<f64> {
    if sorted_rates.is_empty() {
        return None;
    }
    let start = sorted_rates.len().saturating_sub(avg_block_txs);
    let window = &sorted_rates[start..];
    let percentile = PERCENTILE - PERCENTILE_RANGE * pow_progress;
    Some(window[(window.len() - 1) * percentile as usize / 100])
}

/// Predicts fees from the current mempool composition alone.
pub struct MempoolRunner {
    client: Arc<CachedRpcClient>,
    mempool_cache: Arc<MempoolCache>,
    rate_cache: Arc<RateCache>,
    scorer: PredictionScorer,
}

impl MempoolRunner {
    pub fn new(
        client: Arc<CachedRpcClient>,
        mempool_cache: Arc<MempoolCache>,
        rate_cache: Arc<RateCache>,
        output_dir: PathBuf,
    ) -> Self {
        MempoolRunner {
            client,
            mempool_cache,
            rate_cache,
            scorer: PredictionScorer::new("mempool", SINGLE_SLOT, output_dir),
        }
    }

    pub async fn run(mut self) -> Result<(), HarnessError> {
        let mut ticker = interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                if err.is_transient() {
                    warn!(%err, "mempool tick skipped");
                } else {
                    return Err(err);
                }
            }
        }
    }

    async fn tick(&mut self) -> Result<(), HarnessError> {
        let info = self.client.get_blockchain_info().await?;
        let pool = self.mempool_cache.get_cache_at(info.blocks).await?;

        let (avg_block_txs, last_mined_unix) = self.average_block_txs(info.blocks).await?;
        let elapsed = (Utc::now().timestamp() - last_mined_unix).max(0) as f64;
        let pow_progress = (elapsed / TARGET_BLOCK_SECS).min(1.0);

        let mut pool_rates: Vec<f64> = pool
            .values()
            .map(|entry| entry.fee * COIN / entry.size as f64)
            .collect();
        pool_rates.sort_by(|a, b| a.partial_cmp(b).expect("feerates are finite"));

        let Some(estimate) = window_estimate(&pool_rates, avg_block_txs, pow_progress) else {
            info!(height = info.blocks, "mempool is empty, nothing to estimate");
            return Ok(());
        };
        info!(
            rate = estimate,
            pow_progress,
            window_txs = avg_block_txs,
            "estimated mempool rate"
        );

        let rates = self.rate_cache.get_fee_rates_for_block(info.blocks).await?;
        self.scorer.add_prediction(info.blocks, rates, vec![estimate]);
        self.scorer.score_and_flush()
    }

    /// Average transaction count over the last `BLOCK_SAMPLE` blocks and the
    /// timestamp of the newest one.
    async fn average_block_txs(&self, height: u64) -> Result<(usize, i64), HarnessError> {
        let mut total_txs = 0usize;
        let mut newest_time = 0i64;
        for offset in 0..BLOCK_SAMPLE.min(height) {
            let hash = self.client.get_block_hash(height - offset).await?;
            let block = self.client.get_block(&hash).await?;
            if offset == 0 {
                newest_time = block.time;
            }
            total_txs += block.tx.len();
        }
        Ok((total_txs / BLOCK_SAMPLE as usize, newest_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_block_takes_high_percentile() {
        let rates: Vec<f64> = (1..=100).map(|n| n as f64).collect();
        // Window of the top 50 rates, 80th percentile within it.
        let estimate = window_estimate(&rates, 50, 0.0).unwrap();
        assert_eq!(estimate, 90.0);
    }

    #[test]
    fn overdue_block_drops_to_low_percentile() {
        let rates: Vec<f64> = (1..=100).map(|n| n as f64).collect();
        let estimate = window_estimate(&rates, 50, 1.0).unwrap();
        // 80 - 60 = 20th percentile of the top window.
        assert_eq!(estimate, 60.0);
    }

    #[test]
    fn window_larger_than_pool_uses_everything() {
        let rates = vec![1.0, 2.0, 3.0];
        let estimate = window_estimate(&rates, 10, 0.0).unwrap();
        assert_eq!(estimate, 2.0);
    }

    #[test]
    fn empty_pool_has_no_estimate() {
        assert!(window_estimate(&[], 10, 0.5).is_none());
    }
}
