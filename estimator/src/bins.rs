use std::collections::{HashMap, VecDeque};

use bitcoin::{BlockHash, Txid};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::error::EstimateError;
use crate::fee_rate::FeeRate;

/// Maximum number of blocks before confirmation that we track.
pub const ESTIMATE_FEE_DEPTH: usize = 25;

/// Number of transactions stored in each bin.
const ESTIMATE_FEE_BIN_SIZE: usize = 100;

/// Maximum insertions into a single bin from the transactions of one block.
const ESTIMATE_FEE_MAX_REPLACEMENTS: usize = 10;

/// Default number of rollbacks allowed for orphaned blocks.
pub const DEFAULT_MAX_ROLLBACK: usize = 2;

/// Default minimum number of observed blocks before estimates are produced.
pub const DEFAULT_MIN_REGISTERED_BLOCKS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
struct ObservedTx {
    txid: Txid,
    fee_rate: FeeRate,
    /// Block height when first seen in the mempool.
    observed: u64,
    /// Height of the block that mined it; `None` while unmined.
    mined: Option<u64>,
}

/// Transactions a registered block displaced from the bins, kept so the
/// block's effect can be reversed on a reorg.
#[derive(Debug)]
struct RegisteredBlock {
    hash: BlockHash,
    dropped: Vec<ObservedTx>,
}

/// A confirmed block handed to the estimator.
#[derive(Debug, Clone)]
pub struct ConfirmedBlock {
    pub hash: BlockHash,
    pub height: u64,
    pub txids: Vec<Txid>,
}

/// Rolling fee estimator over lag-indexed bins.
///
/// Mempool observations are reconciled when blocks arrive: a transaction
/// confirmed with lag `L` blocks lands in `bin[L]`, displacing a random
/// earlier entry once the bin is full. Entries inserted by the current block
/// occupy a protected tail of the bin so a block can never evict its own
/// observations. A bounded stack of displaced entries allows registered
/// blocks to be rolled back when orphaned.
pub struct BinFeeEstimator {
    max_rollback: usize,
    min_registered_blocks: u32,

    last_known_height: Option<u64>,
    num_blocks_registered: u32,

    /// Unmined observations, by txid.
    observed: HashMap<Txid, ObservedTx>,
    bins: Vec<Vec<ObservedTx>>,

    /// Sorted estimates per target, invalidated on every block.
    cached: Option<Vec<FeeRate>>,

    /// Rollback stack, oldest first.
    dropped: VecDeque<RegisteredBlock>,
}

impl BinFeeEstimator {
    pub fn new(max_rollback: usize, min_registered_blocks: u32) -> Self {
        BinFeeEstimator {
            max_rollback,
            min_registered_blocks,
            last_known_height: None,
            num_blocks_registered: 0,
            observed: HashMap::new(),
            bins: vec![Vec::new(); ESTIMATE_FEE_DEPTH],
            cached: None,
            dropped: VecDeque::with_capacity(max_rollback),
        }
    }

    pub fn last_known_height(&self) -> Option<u64> {
        self.last_known_height
    }

    pub fn num_blocks_registered(&self) -> u32 {
        self.num_blocks_registered
    }

    /// Called when a new transaction is observed in the mempool.
    ///
    /// Observations made before any block has been registered are dropped:
    /// without a height reference we cannot tell when they arrived.
    pub fn observe_transaction(&mut self, txid: Txid, fee_sat: f64, size: u64, height: u64) {
        if self.last_known_height.is_none() {
            return;
        }
        self.observed.entry(txid).or_insert_with(|| ObservedTx {
            txid,
            fee_rate: FeeRate::new(fee_sat, size),
            observed: height,
            mined: None,
        });
    }

    /// Take a new block into account.
    ///
    /// Heights must arrive consecutively; a skipped or decreasing height is
    /// reported as [`EstimateError::StaleBlock`] so the caller can fetch the
    /// missing blocks and retry.
    pub fn register_block(&mut self, block: &ConfirmedBlock) -> Result<(), EstimateError> {
        // The previous sorted estimates are invalid either way.
        self.cached = None;

        if let Some(last) = self.last_known_height {
            if block.height != last + 1 {
                return Err(EstimateError::StaleBlock {
                    last_known: last,
                    got: block.height,
                });
            }
        }

        self.last_known_height = Some(block.height);
        self.num_blocks_registered += 1;

        let mut rng = rand::thread_rng();
        let mut txids = block.txids.clone();
        txids.shuffle(&mut rng);

        // Insertions per bin from this block, bounding replacements and
        // delimiting the protected tail.
        let mut replacement_counts = [0usize; ESTIMATE_FEE_DEPTH];

        let mut dropped_block = RegisteredBlock {
            hash: block.hash,
            dropped: Vec::new(),
        };

        for txid in &txids {
            let Some(tx) = self.observed.get(txid) else {
                continue;
            };

            // Lag 0 means mined in the first block after observation.
            let lag = block.height as i64 - tx.observed as i64 - 1;
            if !(0..ESTIMATE_FEE_DEPTH as i64).contains(&lag) {
                continue;
            }
            let lag = lag as usize;
            if replacement_counts[lag] == ESTIMATE_FEE_MAX_REPLACEMENTS {
                continue;
            }

            let mut tx = self.observed.remove(txid).expect("checked above");
            tx.mined = Some(block.height);
            replacement_counts[lag] += 1;

            let bin = &mut self.bins[lag];
            if bin.len() == ESTIMATE_FEE_BIN_SIZE {
                // Replace a random entry outside the protected tail, moving
                // the tail boundary entry into its slot.
                let limit = ESTIMATE_FEE_BIN_SIZE - replacement_counts[lag];
                let drop = rng.gen_range(0..limit);
                dropped_block.dropped.push(bin[drop].clone());
                bin[drop] = bin[limit - 1].clone();
                bin[limit - 1] = tx;
            } else {
                bin.push(tx);
            }
        }

        // Forget observations that have been unmined for too long.
        let height = block.height;
        self.observed
            .retain(|_, tx| tx.mined.is_some() || height - tx.observed < ESTIMATE_FEE_DEPTH as u64);

        if self.max_rollback == 0 {
            return Ok(());
        }
        if self.dropped.len() == self.max_rollback {
            self.dropped.pop_front();
        }
        self.dropped.push_back(dropped_block);

        Ok(())
    }

    /// Reverse the effect of a recently registered block (and of any block
    /// registered after it).
    ///
    /// Observations evicted purely by age cannot be restored, so the result
    /// is close to, but not always identical with, the state had the block
    /// never been registered.
    pub fn rollback(&mut self, hash: &BlockHash) -> Result<(), EstimateError> {
        let depth = self
            .dropped
            .iter()
            .rev()
            .position(|rb| rb.hash == *hash)
            .ok_or(EstimateError::UnknownRollbackBlock)?;

        for _ in 0..=depth {
            self.rollback_last();
        }
        Ok(())
    }

    fn rollback_last(&mut self) {
        self.cached = None;

        let Some(registered) = self.dropped.pop_back() else {
            return;
        };
        let last = self
            .last_known_height
            .expect("rollback with no registered block");

        // Where we are in each bin as we swap dropped entries back in.
        let mut counters = [0usize; ESTIMATE_FEE_DEPTH];

        for tx in registered.dropped {
            let mined = tx.mined.expect("dropped entries were mined");
            let lag = (mined - tx.observed - 1) as usize;
            let bin = &mut self.bins[lag];
            let mut counter = counters[lag];

            // Find the next entry this block inserted and give its slot back
            // to the entry it displaced.
            loop {
                assert!(
                    counter < bin.len(),
                    "illegal state: cannot roll back dropped transaction"
                );
                if bin[counter].mined == Some(last) {
                    let mut inserted = std::mem::replace(&mut bin[counter], tx);
                    inserted.mined = None;
                    self.observed.insert(inserted.txid, inserted);
                    counter += 1;
                    break;
                }
                counter += 1;
            }
            counters[lag] = counter;
        }

        // Remove the block's remaining insertions, the ones that displaced
        // nobody; they become plain unmined observations again.
        for (lag, counter) in counters.iter().enumerate() {
            let bin = &mut self.bins[lag];
            let mut j = *counter;
            while j < bin.len() {
                if bin[j].mined == Some(last) {
                    let mut tx = bin.remove(j);
                    tx.mined = None;
                    self.observed.insert(tx.txid, tx);
                } else {
                    j += 1;
                }
            }
        }

        self.num_blocks_registered -= 1;
        self.last_known_height = if last > 0 { Some(last - 1) } else { None };
    }

    /// Estimated feerate, in BTC per kvB via [`FeeRate`], to confirm within
    /// `num_blocks` blocks from now.
    pub fn estimate_fee(&mut self, num_blocks: usize) -> Result<FeeRate, EstimateError> {
        if self.num_blocks_registered < self.min_registered_blocks {
            return Err(EstimateError::NotReady {
                registered: self.num_blocks_registered,
                required: self.min_registered_blocks,
            });
        }
        if num_blocks == 0 || num_blocks > ESTIMATE_FEE_DEPTH {
            return Err(EstimateError::TargetOutOfRange {
                target: num_blocks as u64,
                max: ESTIMATE_FEE_DEPTH as u64,
            });
        }

        if self.cached.is_none() {
            self.cached = Some(self.estimates());
            debug!("rebuilt cached bin estimates");
        }
        Ok(self.cached.as_ref().expect("just built")[num_blocks - 1])
    }

    /// All estimates from 1 to [`ESTIMATE_FEE_DEPTH`] confirmations.
    fn estimates(&self) -> Vec<FeeRate> {
        let set = EstimateFeeSet::new(&self.bins);
        (1..=ESTIMATE_FEE_DEPTH)
            .map(|n| set.estimate_fee(n))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn is_observing(&self, txid: &Txid) -> bool {
        self.observed.contains_key(txid)
    }

    #[cfg(test)]
    pub(crate) fn bin_txids(&self) -> Vec<Vec<Txid>> {
        self.bins
            .iter()
            .map(|bin| bin.iter().map(|tx| tx.txid).collect())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn set_last_known_height(&mut self, height: u64) {
        self.last_known_height = Some(height);
    }
}

/// Flattened bin contents sorted by feerate, for quantile lookups.
struct EstimateFeeSet {
    /// Descending by feerate.
    fee_rates: Vec<FeeRate>,
    bin_sizes: [usize; ESTIMATE_FEE_DEPTH],
}

impl EstimateFeeSet {
    fn new(bins: &[Vec<ObservedTx>]) -> Self {
        let mut bin_sizes = [0usize; ESTIMATE_FEE_DEPTH];
        let mut fee_rates = Vec::with_capacity(bins.iter().map(Vec::len).sum());
        for (i, bin) in bins.iter().enumerate() {
            bin_sizes[i] = bin.len();
            fee_rates.extend(bin.iter().map(|tx| tx.fee_rate));
        }
        fee_rates.sort_by(|a, b| b.partial_cmp(a).expect("feerates are finite"));
        EstimateFeeSet {
            fee_rates,
            bin_sizes,
        }
    }

    /// Estimated feerate to confirm within `confirmations` blocks given the
    /// collected data: the midpoint of bin `confirmations - 1` within the
    /// sorted sequence.
    fn estimate_fee(&self, confirmations: usize) -> FeeRate {
        if confirmations == 0 {
            return FeeRate::from_sat_per_kvb(f64::INFINITY);
        }
        if confirmations > ESTIMATE_FEE_DEPTH || self.fee_rates.is_empty() {
            return FeeRate::from_sat_per_kvb(0.0);
        }

        let min: usize = self.bin_sizes[..confirmations - 1].iter().sum();
        let max = min + self.bin_sizes[confirmations - 1].saturating_sub(1);
        let max = max.max(min);
        let fee_index = ((min + max) / 2).min(self.fee_rates.len() - 1);
        self.fee_rates[fee_index]
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;

    fn txid(n: u64) -> Txid {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_le_bytes());
        Txid::from_byte_array(bytes)
    }

    fn block_hash(n: u64) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_le_bytes());
        BlockHash::from_byte_array(bytes)
    }

    fn block(height: u64, txids: &[Txid]) -> ConfirmedBlock {
        ConfirmedBlock {
            hash: block_hash(height),
            height,
            txids: txids.to_vec(),
        }
    }

    #[test]
    fn not_ready_until_minimum_blocks() {
        let mut est = BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, 3);
        est.set_last_known_height(0);
        assert_eq!(
            est.estimate_fee(1),
            Err(EstimateError::NotReady {
                registered: 0,
                required: 3
            })
        );
        est.register_block(&block(1, &[])).unwrap();
        est.register_block(&block(2, &[])).unwrap();
        assert!(matches!(
            est.estimate_fee(1),
            Err(EstimateError::NotReady { .. })
        ));
        est.register_block(&block(3, &[])).unwrap();
        assert!(est.estimate_fee(1).is_ok());
    }

    #[test]
    fn target_bounds_are_enforced() {
        let mut est = BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, 0);
        est.set_last_known_height(0);
        assert!(matches!(
            est.estimate_fee(0),
            Err(EstimateError::TargetOutOfRange { .. })
        ));
        assert!(matches!(
            est.estimate_fee(ESTIMATE_FEE_DEPTH + 1),
            Err(EstimateError::TargetOutOfRange { .. })
        ));
    }

    #[test]
    fn observations_before_any_block_are_dropped() {
        let mut est = BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, 1);
        est.observe_transaction(txid(1), 1000.0, 250, 0);
        assert!(!est.is_observing(&txid(1)));
    }

    #[test]
    fn skipped_heights_are_stale() {
        let mut est = BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, 1);
        est.register_block(&block(10, &[])).unwrap();
        assert_eq!(
            est.register_block(&block(12, &[])),
            Err(EstimateError::StaleBlock {
                last_known: 10,
                got: 12
            })
        );
        assert_eq!(
            est.register_block(&block(9, &[])),
            Err(EstimateError::StaleBlock {
                last_known: 10,
                got: 9
            })
        );
    }

    #[test]
    fn single_observation_dominates_all_targets() {
        // Tx A observed at height 0, confirmed at height 2, then 24 empty
        // blocks. B stays unmined and is evicted by age.
        let mut est = BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, 1);
        est.set_last_known_height(0);

        est.observe_transaction(txid(1), 1000.0, 100, 0);
        est.register_block(&block(1, &[])).unwrap();
        est.observe_transaction(txid(2), 300.0, 100, 1);
        est.register_block(&block(2, &[txid(1)])).unwrap();
        for h in 3..=26 {
            est.register_block(&block(h, &[])).unwrap();
        }

        let rate_a = FeeRate::new(1000.0, 100);
        assert_eq!(est.estimate_fee(1).unwrap(), rate_a);
        assert_eq!(est.estimate_fee(25).unwrap(), rate_a);
        // B has now been unmined for 25 blocks.
        assert!(!est.is_observing(&txid(2)));
    }

    #[test]
    fn confirmation_beyond_depth_is_ignored_and_rolls_back_clean() {
        let mut est = BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, 1);
        est.set_last_known_height(0);

        est.observe_transaction(txid(1), 1000.0, 100, 0);
        est.register_block(&block(1, &[])).unwrap();
        est.observe_transaction(txid(2), 300.0, 100, 1);
        est.register_block(&block(2, &[txid(1)])).unwrap();
        for h in 3..=26 {
            est.register_block(&block(h, &[])).unwrap();
        }

        let bins_before = est.bin_txids();

        // B would land beyond the tracked depth even if it were still
        // observed; the block registers as empty of matches.
        est.register_block(&block(27, &[txid(2)])).unwrap();
        assert_eq!(est.bin_txids(), bins_before);

        est.rollback(&block_hash(27)).unwrap();
        assert_eq!(est.bin_txids(), bins_before);
        assert_eq!(est.last_known_height(), Some(26));
        assert_eq!(
            est.estimate_fee(1).unwrap(),
            FeeRate::new(1000.0, 100)
        );
    }

    #[test]
    fn rollback_restores_pre_block_state() {
        let mut est = BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, 1);
        est.set_last_known_height(0);

        // Observe a handful of txs, confirm some in block 2.
        for n in 0..6 {
            est.observe_transaction(txid(n), 500.0 + n as f64 * 100.0, 100, 0);
        }
        est.register_block(&block(1, &[])).unwrap();
        est.register_block(&block(2, &[txid(0), txid(1), txid(2)]))
            .unwrap();

        let bins_before = est.bin_txids();
        let observed_before: Vec<bool> = (0..6).map(|n| est.is_observing(&txid(n))).collect();

        est.register_block(&block(3, &[txid(3), txid(4)])).unwrap();
        assert!(!est.is_observing(&txid(3)));

        est.rollback(&block_hash(3)).unwrap();

        let mut bins_after = est.bin_txids();
        // Bin order within a bin is irrelevant to the estimates; compare as sets.
        for (before, after) in bins_before.iter().zip(bins_after.iter_mut()) {
            let mut before = before.clone();
            before.sort();
            after.sort();
            assert_eq!(&before, after);
        }
        for (n, was_observed) in observed_before.iter().enumerate() {
            assert_eq!(est.is_observing(&txid(n as u64)), *was_observed);
        }
        assert_eq!(est.last_known_height(), Some(2));
        assert_eq!(est.num_blocks_registered(), 2);
    }

    #[test]
    fn rollback_of_unknown_block_fails() {
        let mut est = BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, 1);
        est.register_block(&block(1, &[])).unwrap();
        assert_eq!(
            est.rollback(&block_hash(99)),
            Err(EstimateError::UnknownRollbackBlock)
        );
    }

    #[test]
    fn rollback_stack_is_bounded() {
        let mut est = BinFeeEstimator::new(2, 1);
        est.register_block(&block(1, &[])).unwrap();
        est.register_block(&block(2, &[])).unwrap();
        est.register_block(&block(3, &[])).unwrap();
        // Block 1 has been pushed out of the rollback window.
        assert_eq!(
            est.rollback(&block_hash(1)),
            Err(EstimateError::UnknownRollbackBlock)
        );
        est.rollback(&block_hash(2)).unwrap();
        assert_eq!(est.last_known_height(), Some(1));
    }

    #[test]
    fn full_bin_keeps_protected_tail() {
        let mut est = BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, 1);
        est.set_last_known_height(0);
        est.register_block(&block(1, &[])).unwrap();

        // Fill bin 0 over successive blocks.
        let mut next = 0u64;
        for h in 2..=3 {
            let mut confirmed = Vec::new();
            for _ in 0..ESTIMATE_FEE_MAX_REPLACEMENTS {
                est.observe_transaction(txid(next), 1000.0, 100, h - 1);
                confirmed.push(txid(next));
                next += 1;
            }
            est.register_block(&block(h, &confirmed)).unwrap();
        }
        assert_eq!(est.bin_txids()[0].len(), 2 * ESTIMATE_FEE_MAX_REPLACEMENTS);

        // One block cannot put more than MAX_REPLACEMENTS txs into a bin.
        let mut confirmed = Vec::new();
        for _ in 0..(2 * ESTIMATE_FEE_MAX_REPLACEMENTS) {
            est.observe_transaction(txid(next), 1000.0, 100, 3);
            confirmed.push(txid(next));
            next += 1;
        }
        est.register_block(&block(4, &confirmed)).unwrap();
        assert_eq!(est.bin_txids()[0].len(), 3 * ESTIMATE_FEE_MAX_REPLACEMENTS);
        // The overflow stays observed for a later block.
        let still_observed = confirmed
            .iter()
            .filter(|id| est.is_observing(id))
            .count();
        assert_eq!(still_observed, ESTIMATE_FEE_MAX_REPLACEMENTS);
    }

    #[test]
    fn replacement_in_full_bin_preserves_capacity_and_rolls_back() {
        let mut est = BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, 1);
        est.set_last_known_height(0);
        est.register_block(&block(1, &[])).unwrap();

        // Fill bin 0 to capacity: 10 blocks of 10 lag-0 confirmations.
        let mut next = 0u64;
        for h in 2..=11 {
            let mut confirmed = Vec::new();
            for _ in 0..ESTIMATE_FEE_MAX_REPLACEMENTS {
                est.observe_transaction(txid(next), 1000.0, 100, h - 1);
                confirmed.push(txid(next));
                next += 1;
            }
            est.register_block(&block(h, &confirmed)).unwrap();
        }
        assert_eq!(est.bin_txids()[0].len(), ESTIMATE_FEE_BIN_SIZE);
        let full_bin: Vec<Txid> = est.bin_txids()[0].clone();

        // The next block's confirmations must displace old entries, never
        // each other, and never grow the bin.
        let mut confirmed = Vec::new();
        for _ in 0..5 {
            est.observe_transaction(txid(next), 2000.0, 100, 11);
            confirmed.push(txid(next));
            next += 1;
        }
        est.register_block(&block(12, &confirmed)).unwrap();

        let bin = est.bin_txids()[0].clone();
        assert_eq!(bin.len(), ESTIMATE_FEE_BIN_SIZE);
        for id in &confirmed {
            assert!(bin.contains(id), "freshly inserted tx missing from bin");
        }

        est.rollback(&block_hash(12)).unwrap();
        let mut restored = est.bin_txids()[0].clone();
        let mut expected = full_bin;
        restored.sort();
        expected.sort();
        assert_eq!(restored, expected);
        // The displacing txs are unmined observations again.
        for id in &confirmed {
            assert!(est.is_observing(id));
        }
    }

    #[test]
    fn estimates_come_from_sorted_bins() {
        let mut est = BinFeeEstimator::new(DEFAULT_MAX_ROLLBACK, 1);
        est.set_last_known_height(0);

        // One tx confirming with lag 0 at a high rate, one with lag 1 at a
        // low rate.
        est.observe_transaction(txid(1), 5000.0, 100, 0);
        est.register_block(&block(1, &[txid(1)])).unwrap();
        est.observe_transaction(txid(2), 1000.0, 100, 1);
        est.register_block(&block(2, &[])).unwrap();
        est.register_block(&block(3, &[txid(2)])).unwrap();

        assert_eq!(est.estimate_fee(1).unwrap(), FeeRate::new(5000.0, 100));
        assert_eq!(est.estimate_fee(2).unwrap(), FeeRate::new(1000.0, 100));
        // Beyond the data, the cheapest known rate keeps being quoted.
        assert_eq!(est.estimate_fee(25).unwrap(), FeeRate::new(1000.0, 100));
    }
}
