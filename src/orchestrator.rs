use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use harness::runner::{BinRunner, MempoolRunner, NaiveRunner, NodeRunner, PolicyRunner};
use harness::{HarnessError, MempoolCache, RateCache};
use rpc::CachedRpcClient;

/// Configuration for one harness run.
pub struct HarnessConfig {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub output_dir: PathBuf,
    pub algorithms: Vec<Algorithm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Policy,
    Bin,
    Naive,
    Mempool,
    Node,
}

impl Algorithm {
    fn needs_mempool_cache(self) -> bool {
        matches!(self, Algorithm::Policy | Algorithm::Bin | Algorithm::Mempool)
    }
}

/// Wires the shared caches to the selected runner tasks.
pub struct Orchestrator {
    config: HarnessConfig,
    client: Arc<CachedRpcClient>,
    mempool_cache: Arc<MempoolCache>,
    rate_cache: Arc<RateCache>,
}

impl Orchestrator {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        let client = Arc::new(
            CachedRpcClient::new(&config.rpc_url, &config.rpc_user, &config.rpc_password)
                .context("Failed to create RPC client")?,
        );
        let mempool_cache = Arc::new(MempoolCache::new(
            client.clone(),
            config.output_dir.clone(),
        ));
        let rate_cache = Arc::new(RateCache::new(client.clone()));

        Ok(Orchestrator {
            config,
            client,
            mempool_cache,
            rate_cache,
        })
    }

    /// Spawn the snapshotter and the selected runners, then wait for the
    /// first unrecoverable error.
    pub async fn start(self) -> Result<()> {
        std::fs::create_dir_all(&self.config.output_dir)
            .context("Failed to create output directory")?;

        let (err_tx, mut err_rx) = mpsc::channel::<HarnessError>(8);

        if self
            .config
            .algorithms
            .iter()
            .any(|a| a.needs_mempool_cache())
        {
            info!("Starting mempool snapshotter...");
            let cache = self.mempool_cache.clone();
            let err_tx = err_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = cache.run().await {
                    let _ = err_tx.send(err).await;
                }
            });
        }

        for algorithm in &self.config.algorithms {
            info!("Starting {:?} estimator...", algorithm);
            let err_tx = err_tx.clone();
            let output_dir = self.config.output_dir.clone();
            match algorithm {
                Algorithm::Policy => {
                    let runner = PolicyRunner::new(
                        self.client.clone(),
                        self.mempool_cache.clone(),
                        self.rate_cache.clone(),
                        output_dir,
                    );
                    tokio::spawn(async move {
                        if let Err(err) = runner.run().await {
                            let _ = err_tx.send(err).await;
                        }
                    });
                }
                Algorithm::Bin => {
                    let runner = BinRunner::new(
                        self.client.clone(),
                        self.mempool_cache.clone(),
                        self.rate_cache.clone(),
                        output_dir,
                    );
                    tokio::spawn(async move {
                        if let Err(err) = runner.run().await {
                            let _ = err_tx.send(err).await;
                        }
                    });
                }
                Algorithm::Naive => {
                    let runner =
                        NaiveRunner::new(self.client.clone(), self.rate_cache.clone(), output_dir);
                    tokio::spawn(async move {
                        if let Err(err) = runner.run().await {
                            let _ = err_tx.send(err).await;
                        }
                    });
                }
                Algorithm::Mempool => {
                    let runner = MempoolRunner::new(
                        self.client.clone(),
                        self.mempool_cache.clone(),
                        self.rate_cache.clone(),
                        output_dir,
                    );
                    tokio::spawn(async move {
                        if let Err(err) = runner.run().await {
                            let _ = err_tx.send(err).await;
                        }
                    });
                }
                Algorithm::Node => {
                    let runner =
                        NodeRunner::new(self.client.clone(), self.rate_cache.clone(), output_dir);
                    tokio::spawn(async move {
                        if let Err(err) = runner.run().await {
                            let _ = err_tx.send(err).await;
                        }
                    });
                }
            }
        }
        drop(err_tx);

        match err_rx.recv().await {
            Some(err) => {
                error!(%err, "estimator task failed");
                Err(err.into())
            }
            None => Ok(()),
        }
    }
}
