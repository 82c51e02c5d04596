use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rpc::CachedRpcClient;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::HarnessError;
use crate::rate_cache::RateCache;
use crate::scores::PredictionScorer;

use super::SINGLE_SLOT;

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Position in the sorted distribution where the fee is suggested; 50 would
/// be the median, 60 leans slightly above it.
const PERCENTILE: usize = 60;

/// Upper bound for suggested fees, in satoshi per byte.
pub const MAX_FEE_RATE: f64 = 500.0;

/// Suggested fee rate in sat/B from a sorted distribution of observed rates.
pub fn suggest_fee_rate(sorted_rates: &[f64]) -> f64 {
    if sorted_rates.is_empty() {
        return 0.0;
    }
    let rate = sorted_rates[(sorted_rates.len() - 1) * PERCENTILE / 100];
    rate.min(MAX_FEE_RATE)
}

/// Predicts the next block's fee from a percentile of the best block's
/// actual feerate distribution.
pub struct NaiveRunner {
    client: Arc<CachedRpcClient>,
    rate_cache: Arc<RateCache>,
    scorer: PredictionScorer,
    last_observed_height: u64,
}

impl NaiveRunner {
    pub fn new(
        client: Arc<CachedRpcClient>,
        rate_cache: Arc<RateCache>,
        output_dir: PathBuf,
    ) -> Self {
        NaiveRunner {
            client,
            rate_cache,
            scorer: PredictionScorer::new("naive", SINGLE_SLOT, output_dir),
            last_observed_height: 0,
        }
    }

    pub async fn run(mut self) -> Result<(), HarnessError> {
        let mut ticker = interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                if err.is_transient() {
                    warn!(%err, "naive tick skipped");
                } else {
                    return Err(err);
                }
            }
        }
    }

    async fn tick(&mut self) -> Result<(), HarnessError> {
        let info = self.client.get_blockchain_info().await?;
        if info.blocks <= self.last_observed_height {
            debug!(height = info.blocks, "already estimated");
            return Ok(());
        }

        let rates = self.rate_cache.get_fee_rates_for_block(info.blocks).await?;
        self.last_observed_height = info.blocks;

        let rate = suggest_fee_rate(&rates.rates);
        info!(rate, height = info.blocks, "estimated naive rate");

        self.scorer.add_prediction(info.blocks, rates, vec![rate]);
        self.scorer.score_and_flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggests_percentile_of_sorted_rates() {
        let rates: Vec<f64> = (1..=11).map(|n| n as f64).collect();
        // (11 - 1) * 60 / 100 = index 6.
        assert_eq!(suggest_fee_rate(&rates), 7.0);
    }

    #[test]
    fn caps_at_max_fee_rate() {
        let rates = vec![100.0, 900.0, 1000.0];
        assert_eq!(suggest_fee_rate(&rates), MAX_FEE_RATE);
    }

    #[test]
    fn empty_distribution_suggests_zero() {
        assert_eq!(suggest_fee_rate(&[]), 0.0);
    }
}
