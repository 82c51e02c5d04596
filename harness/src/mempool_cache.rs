use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Txid;
use estimator::COIN;
use rpc::{CachedRpcClient, MempoolEntry};
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{info, warn};

use crate::error::HarnessError;

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct CacheInner {
    /// height -> snapshot of the mempool while that height was the tip.
    snapshots: BTreeMap<u64, HashMap<Txid, MempoolEntry>>,
    last_recorded_height: u64,
}

/// Caches the mempool per observed chain height.
///
/// A single writer task refreshes the cache every 30 seconds, merging newly
/// appeared transactions into the snapshot of the current height; consumers
/// copy snapshots out. The mutex is deliberately held for the whole refresh
/// so readers never see a half-merged snapshot.
pub struct MempoolCache {
    client: Arc<CachedRpcClient>,
    output_dir: PathBuf,
    inner: Mutex<CacheInner>,
}

impl MempoolCache {
    pub fn new(client: Arc<CachedRpcClient>, output_dir: PathBuf) -> Self {
        MempoolCache {
            client,
            output_dir,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Snapshot of the mempool as seen while `height` was the best height.
    pub async fn get_cache_at(
        &self,
        height: u64,
    ) -> Result<HashMap<Txid, MempoolEntry>, HarnessError> {
        let inner = self.inner.lock().await;
        if height > inner.last_recorded_height {
            return Err(HarnessError::CacheNotRecorded { height });
        }
        match inner.snapshots.get(&height) {
            Some(snapshot) => {
                info!(
                    unconfirmed_txs = snapshot.len(),
                    height, "using cached mempool"
                );
                Ok(snapshot.clone())
            }
            None => Err(HarnessError::CacheNotRecorded { height }),
        }
    }

    /// Snapshot refresh loop; runs until an unrecoverable error.
    pub async fn run(&self) -> Result<(), HarnessError> {
        let mut ticker = interval(REFRESH_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = self.refresh().await {
                if err.is_transient() {
                    warn!(%err, "mempool cache refresh skipped");
                } else {
                    return Err(err);
                }
            }
        }
    }

    async fn refresh(&self) -> Result<(), HarnessError> {
        let mut inner = self.inner.lock().await;

        let info = self.client.get_blockchain_info().await?;
        let pool = self.client.get_raw_mempool_verbose().await?;
        info!(
            unconfirmed_txs = pool.len(),
            height = info.blocks,
            "updating mempool cache"
        );

        inner.last_recorded_height = info.blocks;
        let snapshot = inner.snapshots.entry(info.blocks).or_default();
        for (txid, entry) in pool {
            snapshot.entry(txid).or_insert(entry);
        }

        self.flush(&inner, info.blocks)
    }

    /// Dump every recorded snapshot as per-tx feerates (sat/B).
    fn flush(&self, inner: &CacheInner, best_height: u64) -> Result<(), HarnessError> {
        let dir = self.output_dir.join("mempool");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("mempoolcache{best_height}.csv"));
        let mut out = BufWriter::new(File::create(path)?);

        writeln!(out, "block_number,rates")?;
        for (height, pool) in &inner.snapshots {
            let mut record = vec![height.to_string()];
            for entry in pool.values() {
                let rate = entry.fee * COIN / entry.size as f64;
                record.push(format!("{rate:.3}"));
            }
            writeln!(out, "{}", record.join(","))?;
        }
        out.flush()?;
        Ok(())
    }
}
