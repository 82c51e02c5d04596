use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose, Engine as _};
use bitcoin::{BlockHash, Txid};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::RpcError;
use crate::types::{BlockchainInfo, MempoolEntry, RawTransaction, SmartFeeResult, VerboseBlock};

/// How long cached raw transactions stay valid.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(5 * 3600);

/// How often expired cache items are swept out.
const JANITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct CacheItem {
    tx: Arc<RawTransaction>,
    expires_at: Instant,
}

/// JSON-RPC client with an expiring raw-transaction cache.
///
/// The rate cache fetches the funding transaction of every input of every
/// block transaction; without this cache the same transactions would be
/// re-fetched for every height scored against them.
pub struct CachedRpcClient {
    http: HttpClient,
    raw_tx_cache: Arc<RwLock<HashMap<Txid, CacheItem>>>,
    janitor: JoinHandle<()>,
}

impl CachedRpcClient {
    /// Connect to the node. Must be called within a tokio runtime: the cache
    /// janitor is spawned here.
    pub fn new(url: &str, user: &str, password: &str) -> Result<Self, RpcError> {
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("http://{url}")
        };

        let mut headers = HeaderMap::new();
        if !user.is_empty() || !password.is_empty() {
            let token = general_purpose::STANDARD.encode(format!("{user}:{password}"));
            let value = HeaderValue::from_str(&format!("Basic {token}"))
                .map_err(|e| RpcError::InvalidCredentials(e.to_string()))?;
            headers.insert("authorization", value);
        }

        let http = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(REQUEST_TIMEOUT)
            .build(&url)?;

        let raw_tx_cache: Arc<RwLock<HashMap<Txid, CacheItem>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let janitor = {
            let cache = Arc::downgrade(&raw_tx_cache);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(cache) = cache.upgrade() else {
                        break;
                    };
                    let now = Instant::now();
                    let mut cache = cache.write();
                    let before = cache.len();
                    cache.retain(|_, item| item.expires_at > now);
                    debug!(
                        expired = before - cache.len(),
                        remaining = cache.len(),
                        "swept raw transaction cache"
                    );
                }
            })
        };

        Ok(CachedRpcClient {
            http,
            raw_tx_cache,
            janitor,
        })
    }

    pub async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        Ok(self.http.request("getblockchaininfo", rpc_params![]).await?)
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<BlockHash, RpcError> {
        Ok(self.http.request("getblockhash", rpc_params![height]).await?)
    }

    /// Fetch a block with fully decoded transactions (verbosity 2).
    pub async fn get_block(&self, hash: &BlockHash) -> Result<VerboseBlock, RpcError> {
        Ok(self
            .http
            .request("getblock", rpc_params![hash.to_string(), 2])
            .await?)
    }

    /// Fetch a verbose raw transaction, served from the cache when possible.
    pub async fn get_raw_transaction_verbose(
        &self,
        txid: &Txid,
    ) -> Result<Arc<RawTransaction>, RpcError> {
        if let Some(tx) = self.cache_get(txid) {
            trace!(%txid, "raw transaction cache hit");
            return Ok(tx);
        }

        let tx: RawTransaction = self
            .http
            .request("getrawtransaction", rpc_params![txid.to_string(), true])
            .await?;
        let tx = Arc::new(tx);
        self.cache_set(tx.clone());
        Ok(tx)
    }

    pub async fn get_raw_mempool_verbose(&self) -> Result<HashMap<Txid, MempoolEntry>, RpcError> {
        Ok(self.http.request("getrawmempool", rpc_params![true]).await?)
    }

    /// The node's own estimate, used only for cross-comparison scoring.
    pub async fn estimate_smart_fee(&self, conf_target: u64) -> Result<SmartFeeResult, RpcError> {
        Ok(self
            .http
            .request("estimatesmartfee", rpc_params![conf_target])
            .await?)
    }

    fn cache_get(&self, txid: &Txid) -> Option<Arc<RawTransaction>> {
        let cache = self.raw_tx_cache.read();
        cache.get(txid).map(|item| item.tx.clone())
    }

    fn cache_set(&self, tx: Arc<RawTransaction>) {
        let mut cache = self.raw_tx_cache.write();
        cache.insert(
            tx.txid,
            CacheItem {
                tx,
                expires_at: Instant::now() + DEFAULT_EXPIRATION,
            },
        );
    }
}

impl Drop for CachedRpcClient {
    fn drop(&mut self) {
        self.janitor.abort();
    }
}
