//! Pipeline tunables. Every knob that shapes batching, probing or retrying
//! lives here with its default, so the CLI is the only place that loads them.
use std::time::Duration;

/// Groups need strictly more lines than this to be enriched.
pub const DEFAULT_THRESHOLD: usize = 100;
/// Groups enriched concurrently per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// HTTP probes in flight across the whole run.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 10;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Extra attempts when a probe cannot establish a connection.
pub const DEFAULT_CONNECT_RETRIES: usize = 1;
pub const DEFAULT_MAX_REDIRECTS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub threshold: usize,
    pub batch_size: usize,
    pub probe_concurrency: usize,
    pub probe_timeout: Duration,
    pub connect_retries: usize,
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: concat!("leakscope/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl PipelineConfig {
    /// Clamp zero-sized limits up to one so batching and the probe semaphore
    /// always make progress.
    pub fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.probe_concurrency = self.probe_concurrency.max(1);
        self
    }
}
