use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::Txid;
use tracing::{debug, warn};

use crate::buckets::BucketTable;
use crate::conf_stats::{EstimationResult, TxConfirmStats};
use crate::fee_rate::FeeRate;

/// Track confirm delays up to 12 blocks for the short horizon.
pub const SHORT_BLOCK_PERIODS: usize = 12;
pub const SHORT_SCALE: u32 = 1;
/// Track confirm delays up to 48 blocks for the medium horizon.
pub const MED_BLOCK_PERIODS: usize = 24;
pub const MED_SCALE: u32 = 2;
/// Track confirm delays up to 1008 blocks for the long horizon.
pub const LONG_BLOCK_PERIODS: usize = 42;
pub const LONG_SCALE: u32 = 24;

/// Decay of .962 is a half-life of 18 blocks, about 3 hours.
pub const SHORT_DECAY: f64 = 0.962;
/// Decay of .9952 is a half-life of 144 blocks, about 1 day.
pub const MED_DECAY: f64 = 0.9952;
/// Decay of .99931 is a half-life of 1008 blocks, about 1 week.
pub const LONG_DECAY: f64 = 0.99931;

/// Require greater than 60% of X feerate transactions confirmed within Y/2 blocks.
pub const HALF_SUCCESS_PCT: f64 = 0.6;
/// Require greater than 85% of X feerate transactions confirmed within Y blocks.
pub const SUCCESS_PCT: f64 = 0.85;
/// Require greater than 95% of X feerate transactions confirmed within 2*Y blocks.
pub const DOUBLE_SUCCESS_PCT: f64 = 0.95;

/// Require an avg of 0.1 tx per block in a combined bucket range for statistical significance.
pub const SUFFICIENT_FEE_TXS: f64 = 0.1;
/// Require an avg of 0.5 tx with the short decay since fewer blocks are considered.
pub const SUFFICIENT_TXS_SHORT: f64 = 0.5;

/// Historical estimates older than this are not usable.
pub const OLDEST_ESTIMATE_HISTORY: u64 = 6 * 1008;

pub const MIN_BUCKET_FEE_RATE: f64 = 1000.0;
pub const MAX_BUCKET_FEE_RATE: f64 = 1e7;
pub const FEE_SPACING: f64 = 1.05;

/// A mempool transaction as observed by the harness.
#[derive(Debug, Clone)]
pub struct MempoolTx {
    pub txid: Txid,
    /// Best-known chain height when the transaction entered the mempool.
    pub height: u64,
    pub fee_sat: f64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct TxStatsInfo {
    entry_height: u64,
    bucket_index: usize,
    fee_rate: FeeRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeHorizon {
    Short,
    Medium,
    Long,
}

/// Estimates the feerate needed for a transaction to confirm within a target
/// number of blocks.
///
/// Transactions are grouped into feerate buckets on mempool entry; when a
/// block arrives we record how many blocks each confirmed transaction took,
/// in three data sets with different decay horizons. Estimation walks the
/// buckets from the most expensive downwards, stopping at the last range
/// whose confirmation rate within the target still clears the success
/// threshold.
pub struct BlockPolicyEstimator {
    best_seen_height: u64,
    first_recorded_height: u64,
    historical_first: u64,
    historical_best: u64,
    tracked: HashMap<Txid, TxStatsInfo>,

    /// Medium horizon.
    fee_stats: TxConfirmStats,
    short_stats: TxConfirmStats,
    long_stats: TxConfirmStats,

    tracked_txs: u64,
    untracked_txs: u64,

    buckets: Arc<BucketTable>,
}

impl Default for BlockPolicyEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockPolicyEstimator {
    pub fn new() -> Self {
        let buckets = Arc::new(BucketTable::new(
            MIN_BUCKET_FEE_RATE,
            MAX_BUCKET_FEE_RATE,
            FEE_SPACING,
        ));
        BlockPolicyEstimator {
            best_seen_height: 0,
            first_recorded_height: 0,
            historical_first: 0,
            historical_best: 0,
            tracked: HashMap::new(),
            fee_stats: TxConfirmStats::new(buckets.clone(), MED_BLOCK_PERIODS, MED_DECAY, MED_SCALE),
            short_stats: TxConfirmStats::new(
                buckets.clone(),
                SHORT_BLOCK_PERIODS,
                SHORT_DECAY,
                SHORT_SCALE,
            ),
            long_stats: TxConfirmStats::new(
                buckets.clone(),
                LONG_BLOCK_PERIODS,
                LONG_DECAY,
                LONG_SCALE,
            ),
            tracked_txs: 0,
            untracked_txs: 0,
            buckets,
        }
    }

    pub fn best_seen_height(&self) -> u64 {
        self.best_seen_height
    }

    /// Start tracking a transaction that entered the mempool.
    ///
    /// Transactions whose entry height differs from the best seen height are
    /// ignored: they come from side chains, reorgs, or ticks where the
    /// estimator is behind the chain tip, and will be picked up once a block
    /// is processed.
    pub fn process_transaction(&mut self, entry: &MempoolTx, valid_fee_estimate: bool) {
        if self.tracked.contains_key(&entry.txid) {
            warn!(txid = %entry.txid, "mempool tx already being tracked");
            return;
        }

        if entry.height != self.best_seen_height {
            return;
        }

        // Only update estimates when the chain view is synced, otherwise the
        // blocks-to-confirm accounting would be skewed.
        if !valid_fee_estimate {
            self.untracked_txs += 1;
            return;
        }
        self.tracked_txs += 1;

        let fee_rate = FeeRate::new(entry.fee_sat, entry.size);
        let bucket_index = self.fee_stats.add_tx(entry.height, fee_rate);
        let short_index = self.short_stats.add_tx(entry.height, fee_rate);
        let long_index = self.long_stats.add_tx(entry.height, fee_rate);
        assert!(
            bucket_index == short_index && bucket_index == long_index,
            "horizons disagree on bucket index for feerate {}",
            fee_rate.sat_per_kvb()
        );

        self.tracked.insert(
            entry.txid,
            TxStatsInfo {
                entry_height: entry.height,
                bucket_index,
                fee_rate,
            },
        );
    }

    /// Stop tracking a transaction. Returns false if it was unknown.
    pub fn remove_tx(&mut self, txid: &Txid, in_block: bool) -> bool {
        let Some(info) = self.tracked.remove(txid) else {
            return false;
        };
        self.fee_stats.remove_tx(
            info.entry_height,
            self.best_seen_height,
            info.bucket_index,
            in_block,
        );
        self.short_stats.remove_tx(
            info.entry_height,
            self.best_seen_height,
            info.bucket_index,
            in_block,
        );
        self.long_stats.remove_tx(
            info.entry_height,
            self.best_seen_height,
            info.bucket_index,
            in_block,
        );
        true
    }

    fn process_block_tx(&mut self, block_height: u64, txid: &Txid) -> bool {
        let Some(info) = self.tracked.get(txid).copied() else {
            return false;
        };
        if !self.remove_tx(txid, true) {
            return false;
        }

        // blocks_to_confirm is 1-based: a tx included in the earliest
        // possible block confirmed in 1 block. Entry heights never exceed
        // the previous best height, so this cannot be zero.
        assert!(
            block_height > info.entry_height,
            "tx {txid} has non-positive blocks to confirm ({} -> {})",
            info.entry_height,
            block_height
        );
        let blocks_to_confirm = block_height - info.entry_height;

        self.fee_stats.record(blocks_to_confirm, info.fee_rate);
        self.short_stats.record(blocks_to_confirm, info.fee_rate);
        self.long_stats.record(blocks_to_confirm, info.fee_rate);
        true
    }

    /// Process a newly connected block and the txids it confirmed.
    ///
    /// Stale or repeated heights are ignored: reorgs are assumed random and
    /// are not allowed to skew the estimates. The per-block aging of the
    /// unconfirmed buffer happens before the decay so evicted observations
    /// enter the aging window for exactly one block.
    pub fn process_block(&mut self, block_height: u64, txids: &[Txid]) {
        if block_height <= self.best_seen_height {
            return;
        }

        // Must update best_seen_height in sync with clear_current so that
        // removals triggered below compute unconfirmed ages correctly.
        self.best_seen_height = block_height;

        self.fee_stats.clear_current(block_height);
        self.short_stats.clear_current(block_height);
        self.long_stats.clear_current(block_height);

        self.fee_stats.update_moving_averages();
        self.short_stats.update_moving_averages();
        self.long_stats.update_moving_averages();

        let mut counted_txs = 0u64;
        for txid in txids {
            if self.process_block_tx(block_height, txid) {
                counted_txs += 1;
            }
        }

        if self.first_recorded_height == 0 && counted_txs > 0 {
            self.first_recorded_height = self.best_seen_height;
            debug!(
                height = self.first_recorded_height,
                "block policy first recorded height"
            );
        }

        debug!(
            height = block_height,
            counted_txs,
            tracked = self.tracked_txs,
            untracked = self.untracked_txs,
            mempool_map = self.tracked.len(),
            max_target = self.max_usable_estimate(),
            "block policy estimates updated"
        );

        self.tracked_txs = 0;
        self.untracked_txs = 0;
    }

    pub fn block_span(&self) -> u64 {
        if self.first_recorded_height == 0 {
            return 0;
        }
        assert!(
            self.best_seen_height >= self.first_recorded_height,
            "first recorded height above best seen height"
        );
        self.best_seen_height - self.first_recorded_height
    }

    pub fn historical_block_span(&self) -> u64 {
        if self.historical_first == 0 {
            return 0;
        }
        assert!(
            self.historical_best >= self.historical_first,
            "historical window inverted"
        );
        if self.best_seen_height - self.historical_best > OLDEST_ESTIMATE_HISTORY {
            return 0;
        }
        self.historical_best - self.historical_first
    }

    /// Block spans are halved to make sure enough potential failing data
    /// points back any estimate.
    pub fn max_usable_estimate(&self) -> u64 {
        self.long_stats
            .max_confirms()
            .min(self.block_span().max(self.historical_block_span()) / 2)
    }

    /// Single-horizon estimate at an explicit success threshold.
    pub fn estimate_raw_fee(
        &self,
        conf_target: u64,
        success_threshold: f64,
        horizon: FeeHorizon,
    ) -> Option<FeeRate> {
        let (stats, sufficient_txs) = match horizon {
            FeeHorizon::Short => (&self.short_stats, SUFFICIENT_TXS_SHORT),
            FeeHorizon::Medium => (&self.fee_stats, SUFFICIENT_FEE_TXS),
            FeeHorizon::Long => (&self.long_stats, SUFFICIENT_FEE_TXS),
        };

        if conf_target == 0 || conf_target > stats.max_confirms() {
            return None;
        }
        if success_threshold > 1.0 {
            return None;
        }

        let (median, _result) = stats.estimate_median_val(
            conf_target,
            sufficient_txs,
            success_threshold,
            true,
            self.best_seen_height,
        );
        if median < 0.0 {
            return None;
        }
        Some(FeeRate::from_sat_per_kvb(median))
    }

    /// Estimate at `success_threshold` from the shortest horizon tracking
    /// `conf_target`. If `check_shorter_horizon` is set, shorter horizons
    /// queried at their own maximum may lower the answer; a lower target
    /// must never be quoted a higher feerate than a longer one.
    fn estimate_combined_fee(
        &self,
        conf_target: u64,
        success_threshold: f64,
        check_shorter_horizon: bool,
    ) -> (f64, Option<EstimationResult>) {
        let mut estimate = -1.0f64;
        let mut result = None;

        if conf_target >= 1 && conf_target <= self.long_stats.max_confirms() {
            // Find the estimate from the shortest time horizon possible.
            let (median, res) = if conf_target <= self.short_stats.max_confirms() {
                self.short_stats.estimate_median_val(
                    conf_target,
                    SUFFICIENT_TXS_SHORT,
                    success_threshold,
                    true,
                    self.best_seen_height,
                )
            } else if conf_target <= self.fee_stats.max_confirms() {
                self.fee_stats.estimate_median_val(
                    conf_target,
                    SUFFICIENT_FEE_TXS,
                    success_threshold,
                    true,
                    self.best_seen_height,
                )
            } else {
                self.long_stats.estimate_median_val(
                    conf_target,
                    SUFFICIENT_FEE_TXS,
                    success_threshold,
                    true,
                    self.best_seen_height,
                )
            };
            estimate = median;
            result = Some(res);

            if check_shorter_horizon {
                // If a lower target from a more recent horizon gives a lower
                // answer, use it.
                if conf_target > self.fee_stats.max_confirms() {
                    let (med_max, res) = self.fee_stats.estimate_median_val(
                        self.fee_stats.max_confirms(),
                        SUFFICIENT_FEE_TXS,
                        success_threshold,
                        true,
                        self.best_seen_height,
                    );
                    if med_max > 0.0 && (estimate == -1.0 || med_max < estimate) {
                        estimate = med_max;
                        result = Some(res);
                    }
                }
                if conf_target > self.short_stats.max_confirms() {
                    let (short_max, res) = self.short_stats.estimate_median_val(
                        self.short_stats.max_confirms(),
                        SUFFICIENT_TXS_SHORT,
                        success_threshold,
                        true,
                        self.best_seen_height,
                    );
                    if short_max > 0.0 && (estimate == -1.0 || short_max < estimate) {
                        estimate = short_max;
                        result = Some(res);
                    }
                }
            }
        }

        (estimate, result)
    }

    /// For a conservative estimate the double-success threshold must also be
    /// met at 2*target on the longer horizons; the pointwise max resists
    /// short-term dips.
    fn estimate_conservative_fee(&self, double_target: u64) -> (f64, Option<EstimationResult>) {
        let mut estimate = -1.0f64;
        let mut result = None;

        if double_target <= self.short_stats.max_confirms() {
            let (median, res) = self.fee_stats.estimate_median_val(
                double_target,
                SUFFICIENT_FEE_TXS,
                DOUBLE_SUCCESS_PCT,
                true,
                self.best_seen_height,
            );
            estimate = median;
            result = Some(res);
        }
        if double_target <= self.fee_stats.max_confirms() {
            let (long_estimate, res) = self.long_stats.estimate_median_val(
                double_target,
                SUFFICIENT_FEE_TXS,
                DOUBLE_SUCCESS_PCT,
                true,
                self.best_seen_height,
            );
            if long_estimate > estimate {
                estimate = long_estimate;
                result = Some(res);
            }
        }

        (estimate, result)
    }

    /// The max of the feerates calculated with a 60% threshold at target/2,
    /// an 85% threshold at target and a 95% threshold at 2*target, each from
    /// the shortest horizon tracking the required target. Conservative
    /// estimates additionally require the 95% threshold at 2*target on
    /// longer horizons.
    pub fn estimate_smart_fee(&self, conf_target: u64, conservative: bool) -> Option<FeeRate> {
        if conf_target == 0 || conf_target > self.long_stats.max_confirms() {
            return None;
        }

        // It's not possible to get reasonable estimates for a target of 1.
        let mut target = conf_target.max(2);

        let max_usable = self.max_usable_estimate();
        if target > max_usable {
            target = max_usable;
        }
        if target <= 1 {
            debug!(
                conf_target,
                max_usable, "target too small or not enough data for a smart estimate"
            );
            return None;
        }

        // target/2 and target check the shorter horizons so the published
        // curve stays monotonically increasing. Conservative mode skips the
        // shorter-horizon check at 2*target: it takes the max over all
        // horizons anyway, and its purpose is to keep short-term
        // fluctuations from lowering the answer.
        let mut reason = "half";
        let (half_est, _) = self.estimate_combined_fee(target / 2, HALF_SUCCESS_PCT, true);
        let mut median = half_est;

        let (actual_est, _) = self.estimate_combined_fee(target, SUCCESS_PCT, true);
        if actual_est > median {
            median = actual_est;
            reason = "full";
        }

        let (double_est, _) = self.estimate_combined_fee(2 * target, DOUBLE_SUCCESS_PCT, !conservative);
        if double_est > median {
            median = double_est;
            reason = "double";
        }

        if conservative || median == -1.0 {
            let (cons_est, _) = self.estimate_conservative_fee(2 * target);
            if cons_est > median {
                median = cons_est;
                reason = "conservative";
            }
        }

        debug!(conf_target, target, conservative, median, reason, "smart fee estimate");

        if median < 0.0 {
            return None;
        }
        Some(FeeRate::from_sat_per_kvb(median))
    }

    pub fn bucket_table(&self) -> &Arc<BucketTable> {
        &self.buckets
    }
}
