use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relay_common::config::{RelayConfig, MAX_DOWNLOAD_RANGES, MIN_DOWNLOAD_RANGES};
use relay_common::protocol::error::{RelayError, Result};
use relay_common::protocol::JsonObject;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::rpc_source::RpcSource;
use crate::source::{LedgerResponse, Source, SourceStatus};

/// Pause after a full pass over the pool without success.
pub const FULL_PASS_DELAY: Duration = Duration::from_secs(2);

/// Spreads ledger fetches and forwarded requests across a fixed pool of
/// upstream sources.
///
/// # Selection
///
/// Every call starts at a random source and walks the pool in order,
/// wrapping around. The random generator lives for the whole lifetime of the
/// balancer and is never reseeded.
///
/// # Failover
///
/// Ledger-addressed operations ([`fetch_ledger`](Self::fetch_ledger),
/// [`load_initial_ledger`](Self::load_initial_ledger)) retry until a source
/// succeeds, pausing [`FULL_PASS_DELAY`] after each full pass. They never give
/// up on their own: wrap them in `tokio::time::timeout` or `select!` to bound
/// the wait. Forwarded requests try each source at most once.
pub struct LoadBalancer {
    sources: Vec<Arc<dyn Source>>,
    download_ranges: u32,
    rng: Mutex<StdRng>,
}

impl LoadBalancer {
    /// Creates a balancer over an already-running set of sources.
    ///
    /// # Errors
    /// [`RelayError::NoSources`] if `sources` is empty.
    pub fn new(sources: Vec<Arc<dyn Source>>, download_ranges: u32) -> Result<Self> {
        Self::with_rng(sources, download_ranges, StdRng::from_entropy())
    }

    /// Same as [`new`](Self::new) with an explicit random generator.
    pub fn with_rng(
        sources: Vec<Arc<dyn Source>>,
        download_ranges: u32,
        rng: StdRng,
    ) -> Result<Self> {
        if sources.is_empty() {
            return Err(RelayError::NoSources);
        }

        Ok(Self {
            sources,
            download_ranges: download_ranges.clamp(MIN_DOWNLOAD_RANGES, MAX_DOWNLOAD_RANGES),
            rng: Mutex::new(rng),
        })
    }

    /// Builds one [`RpcSource`] per configured upstream and starts each of
    /// them.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &RelayConfig, has_ledger_history: bool) -> Result<Self> {
        let mut sources: Vec<Arc<dyn Source>> = Vec::with_capacity(config.etl_sources.len());

        for entry in &config.etl_sources {
            let source = Arc::new(RpcSource::new(entry, &config.source_retry)?);
            info!("Added etl source - {}", source.describe());
            Arc::clone(&source).run();
            sources.push(source);
        }

        Self::new(sources, config.download_ranges(has_ledger_history))
    }

    /// Number of sources in the pool.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Parallelism hint passed to sources for the initial download.
    pub fn download_ranges(&self) -> u32 {
        self.download_ranges
    }

    fn random_start(&self) -> usize {
        self.rng.lock().gen_range(0..self.sources.len())
    }

    /// Runs `worker` against sources that have `sequence` until one succeeds.
    ///
    /// The worker returns `Some` on success. Sources without the ledger are
    /// skipped; a failing worker moves on to the next source. After every full
    /// pass without success the calling task sleeps for [`FULL_PASS_DELAY`].
    ///
    /// # Errors
    /// [`RelayError::NoSources`] if the pool is empty. There is no other
    /// error: the loop runs until a source succeeds or the caller drops it.
    pub async fn fetch_with_failover<T, F, Fut>(&self, sequence: u32, mut worker: F) -> Result<T>
    where
        F: FnMut(Arc<dyn Source>) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        if self.sources.is_empty() {
            return Err(RelayError::NoSources);
        }

        let pool_size = self.sources.len();
        let mut index = self.random_start();
        let mut attempts: usize = 0;

        loop {
            let source = &self.sources[index];
            debug!(sequence, source = %source.describe(), "Attempting to execute func");

            if source.has_ledger(sequence) {
                if let Some(value) = worker(Arc::clone(source)).await {
                    debug!(sequence, source = %source.describe(), "Successfully executed func");
                    return Ok(value);
                }
                warn!(sequence, source = %source.describe(), "Failed to execute func");
            } else {
                warn!(sequence, source = %source.describe(), "Ledger not present at source");
            }

            index = (index + 1) % pool_size;
            attempts += 1;
            if attempts % pool_size == 0 {
                info!(
                    sequence,
                    "Ledger is not yet available from any configured sources, sleeping and trying again"
                );
                tokio::time::sleep(FULL_PASS_DELAY).await;
            }
        }
    }

    /// Fetches a validated ledger from any source that has it.
    pub async fn fetch_ledger(
        &self,
        sequence: u32,
        get_objects: bool,
        get_object_neighbors: bool,
    ) -> Result<LedgerResponse> {
        self.fetch_with_failover(sequence, |source| async move {
            match source
                .fetch_ledger(sequence, get_objects, get_object_neighbors)
                .await
            {
                Ok(response) if response.validated => {
                    info!(sequence, source = %source.describe(), "Successfully fetched ledger");
                    Some(response)
                }
                Ok(_) => {
                    warn!(sequence, source = %source.describe(), "Fetched ledger is not validated");
                    None
                }
                Err(e) => {
                    warn!(sequence, source = %source.describe(), "Could not fetch ledger: {}", e);
                    None
                }
            }
        })
        .await
    }

    /// Downloads the full state of ledger `sequence` from any source that has
    /// it, using [`download_ranges`](Self::download_ranges) cursors.
    pub async fn load_initial_ledger(&self, sequence: u32, cache_only: bool) -> Result<Vec<String>> {
        let download_ranges = self.download_ranges;

        self.fetch_with_failover(sequence, |source| async move {
            match source
                .load_initial_ledger(sequence, download_ranges, cache_only)
                .await
            {
                Ok(records) => Some(records),
                Err(e) => {
                    error!(
                        sequence,
                        source = %source.describe(),
                        "Failed to download initial ledger: {}",
                        e
                    );
                    None
                }
            }
        })
        .await
    }

    /// Forwards a client request to the first source that answers.
    ///
    /// Each source is tried at most once, starting from a random one.
    pub async fn forward_request(&self, request: &JsonObject, client_ip: &str) -> Option<JsonObject> {
        let pool_size = self.sources.len();
        if pool_size == 0 {
            return None;
        }

        let start = self.random_start();
        for offset in 0..pool_size {
            let source = &self.sources[(start + offset) % pool_size];
            if let Some(response) = source.forward_request(request, client_ip).await {
                return Some(response);
            }
            debug!(source = %source.describe(), "Forwarding failed, trying next source");
        }

        warn!(client_ip, "No source could forward the request");
        None
    }

    /// Whether `candidate` is the source whose live stream should be
    /// propagated.
    ///
    /// The first connected source in pool order wins. When nothing is
    /// connected every source may propagate.
    pub fn should_propagate_live_updates(&self, candidate: &dyn Source) -> bool {
        match self.sources.iter().find(|source| source.is_connected()) {
            Some(leader) => std::ptr::addr_eq(Arc::as_ptr(leader), candidate as *const dyn Source),
            None => true,
        }
    }

    /// Status of every source, in pool order.
    pub fn snapshot(&self) -> Vec<SourceStatus> {
        self.sources.iter().map(|source| source.status()).collect()
    }

    /// Stops the background loops of all sources.
    pub fn stop(&self) {
        for source in &self.sources {
            source.stop();
        }
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        self.stop();
    }
}
