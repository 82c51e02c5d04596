use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use estimator::COIN;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rpc::{CachedRpcClient, RawTransaction, RpcError};
use tracing::{debug, info, warn};

use crate::error::HarnessError;

const MAX_RETRY: u32 = 200;
const BASE_DELAY: Duration = Duration::from_millis(1);
const MAX_DELAY: Duration = Duration::from_secs(1000);
const BACKOFF_FACTOR: f64 = 1.3;
const JITTER: f64 = 0.2;

/// Concurrent input-resolution fetches per block.
const FETCH_CONCURRENCY: usize = 8;

/// Actual feerate distribution of one block, in satoshi per byte, sorted
/// ascending. `number_of_txs` counts all block transactions, including those
/// whose fee could not be derived.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeRates {
    pub rates: Vec<f64>,
    pub number_of_txs: usize,
}

/// Caches the per-block actual feerates used for scoring.
///
/// Computing a block's distribution resolves the funding transaction of
/// every input over RPC, so concurrent requests for the same height are
/// serialized through a per-height lock acquired with bounded retries;
/// exhausting the retries surfaces as a transient error and the caller's
/// next tick retries.
pub struct RateCache {
    client: Arc<CachedRpcClient>,
    cache: RwLock<HashMap<u64, Arc<FeeRates>>>,
    in_flight: Mutex<HashSet<u64>>,
}

impl RateCache {
    pub fn new(client: Arc<CachedRpcClient>) -> Self {
        RateCache {
            client,
            cache: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Feerates of the block at `height`, computed on first request.
    pub async fn get_fee_rates_for_block(
        &self,
        height: u64,
    ) -> Result<Arc<FeeRates>, HarnessError> {
        if let Some(rates) = self.cache.read().get(&height) {
            debug!(height, "rates already cached");
            return Ok(rates.clone());
        }

        let _guard = self.lock_height(height).await?;
        // Another fetcher may have filled the entry while we waited.
        if let Some(rates) = self.cache.read().get(&height) {
            return Ok(rates.clone());
        }

        info!(height, "computing fee rates for block");
        let rates = Arc::new(self.fetch_fee_rates(height).await?);
        self.cache.write().insert(height, rates.clone());
        Ok(rates)
    }

    async fn lock_height(&self, height: u64) -> Result<HeightGuard<'_>, HarnessError> {
        let mut delay = BASE_DELAY;
        for _ in 0..MAX_RETRY {
            if self.in_flight.lock().insert(height) {
                return Ok(HeightGuard {
                    cache: self,
                    height,
                });
            }
            let jitter = 1.0 + JITTER * rand::thread_rng().gen_range(-1.0..1.0);
            tokio::time::sleep(delay.mul_f64(jitter)).await;
            delay = Duration::from_secs_f64(
                (delay.as_secs_f64() * BACKOFF_FACTOR).min(MAX_DELAY.as_secs_f64()),
            );
        }
        Err(HarnessError::RateLockBusy { height })
    }

    async fn fetch_fee_rates(&self, height: u64) -> Result<FeeRates, HarnessError> {
        let hash = self.client.get_block_hash(height).await?;
        let block = self.client.get_block(&hash).await?;

        let fee_rate_futures: Vec<_> = block.tx.iter().map(|tx| self.tx_fee_rate(tx)).collect();
        let mut rates: Vec<f64> = stream::iter(fee_rate_futures)
            .buffer_unordered(FETCH_CONCURRENCY)
            .filter_map(|result| async move {
                match result {
                    Ok(rate) => rate,
                    Err(err) => {
                        warn!(%err, "skipping tx while computing block rates");
                        None
                    }
                }
            })
            .collect()
            .await;
        rates.sort_by(|a, b| a.partial_cmp(b).expect("feerates are finite"));

        Ok(FeeRates {
            rates,
            number_of_txs: block.tx.len(),
        })
    }

    /// Feerate of one block transaction in sat/B, or `None` for coinbase and
    /// witness-bearing transactions.
    fn tx_fee_rate<'a>(
        &'a self,
        tx: &'a RawTransaction,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<f64>, HarnessError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut input_sum = 0f64;
            for input in &tx.vin {
                if input.is_coinbase() {
                    return Ok(None);
                }
                if input.has_witness() {
                    // The reported size includes witness data, which would skew
                    // the rate; segwit spends are left out of the distribution.
                    return Ok(None);
                }
                let Some(funding_txid) = input.txid else {
                    return Ok(None);
                };
                let funding = self.client.get_raw_transaction_verbose(&funding_txid).await?;
                let output = funding
                    .vout
                    .get(input.vout as usize)
                    .ok_or(RpcError::MissingOutput {
                        txid: funding_txid,
                        vout: input.vout,
                    })?;
                input_sum += output.value;
            }

            let output_sum: f64 = tx.vout.iter().map(|out| out.value).sum();
            if tx.size == 0 {
                return Ok(None);
            }
            let fee_sat = (input_sum - output_sum) * COIN;
            let rate = fee_sat / tx.size as f64;
            Ok((rate > 0.0).then_some(rate))
        })
    }
}

struct HeightGuard<'a> {
    cache: &'a RateCache,
    height: u64,
}

impl Drop for HeightGuard<'_> {
    fn drop(&mut self) {
        self.cache.in_flight.lock().remove(&self.height);
    }
}
