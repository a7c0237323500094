//! Pipeline: classifies a leak dump, groups it by address, and walks the
//! populous groups in fixed-size batches, enriching each batch concurrently
//! and persisting it before the next one starts.
//!
//! Typical usage:
//!
//! ```no_run
//! use std::sync::Arc;
//! use leakscope::config::PipelineConfig;
//! use leakscope::pipeline::Pipeline;
//! use leakscope::resolve::SystemResolver;
//! use leakscope::store::SqliteStore;
//! # async fn run() -> anyhow::Result<()> {
//! let store = SqliteStore::open("sqlite://leaks.db").await?;
//! let pipeline = Pipeline::new(
//!     PipelineConfig::default(),
//!     Arc::new(SystemResolver),
//!     Arc::new(store),
//! )?;
//! let dump = "http://a.com:user:pass".to_string();
//! let summary = pipeline.process_file("dump.txt", dump).await?;
//! println!("{}", leakscope::report::render_run_summary(&summary));
//! # Ok(())
//! # }
//! ```
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;

use log::{error, info};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::classify::{ClassifyStats, classify_contents, try_classify_lines};
use crate::config::PipelineConfig;
use crate::credential::CredentialRecord;
use crate::enrich::Enricher;
use crate::group::{AddressGroup, AddressGroups};
use crate::probe::{ProbeError, Prober};
use crate::resolve::Resolve;
use crate::store::{RecordStore, StoreError};

/// Addresses listed in a run summary.
pub const TOP_ADDRESSES: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reading input failed: {0}")]
    Read(#[from] io::Error),
    #[error("pipeline task failed: {0}")]
    Task(#[from] JoinError),
}

/// Outcome of dispatching groups through enrichment and persistence.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub groups_enriched: usize,
    pub batches: usize,
    pub records_stored: u64,
    /// Number of groups carrying each tag.
    pub tag_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub file_name: String,
    pub classify: ClassifyStats,
    pub addresses_seen: usize,
    /// Largest retained groups as `(address, population)`.
    pub top_addresses: Vec<(String, usize)>,
    pub dispatch: DispatchSummary,
}

/// Run context: the enricher (resolver plus the shared prober) and the store,
/// built once and shared by every run.
#[derive(Clone)]
pub struct Pipeline {
    enricher: Arc<Enricher>,
    store: Arc<dyn RecordStore>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        resolver: Arc<dyn Resolve>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, ProbeError> {
        let config = config.normalized();
        let prober = Arc::new(Prober::new(&config)?);
        Ok(Self {
            enricher: Arc::new(Enricher::new(resolver, prober)),
            store,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process a whole dump held in memory. Classification runs on the
    /// blocking pool so the scheduler thread stays free.
    pub async fn process_file(
        &self,
        file_name: &str,
        contents: String,
    ) -> Result<RunSummary, PipelineError> {
        let name = file_name.to_owned();
        let (records, stats) =
            tokio::task::spawn_blocking(move || classify_contents(&name, &contents)).await?;
        self.run(file_name, records, stats).await
    }

    /// Process a dump from any fallible line source, e.g.
    /// [`crate::io::iter_lines_auto`]. A source error aborts the run before
    /// anything is enriched.
    pub async fn process_lines<I, S>(
        &self,
        file_name: &str,
        lines: I,
    ) -> Result<RunSummary, PipelineError>
    where
        I: IntoIterator<Item = io::Result<S>>,
        S: AsRef<str>,
    {
        let (records, stats) = try_classify_lines(file_name, lines)?;
        self.run(file_name, records, stats).await
    }

    /// Accept a dump and process it in the background. Failures surface only
    /// through the returned handle and the log.
    pub fn submit(
        &self,
        file_name: String,
        contents: String,
    ) -> JoinHandle<Result<RunSummary, PipelineError>> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let result = pipeline.process_file(&file_name, contents).await;
            if let Err(e) = &result {
                error!("processing {} failed: {}", file_name, e);
            }
            result
        })
    }

    async fn run(
        &self,
        file_name: &str,
        records: Vec<CredentialRecord>,
        classify: ClassifyStats,
    ) -> Result<RunSummary, PipelineError> {
        let groups = AddressGroups::from_records(records);
        let addresses_seen = groups.len();
        let pending = groups.retain_populous(self.config.threshold);
        info!(
            "{}: {} of {} lines accepted, {} addresses, {} above threshold {}",
            file_name,
            classify.accepted,
            classify.lines_total,
            addresses_seen,
            pending.len(),
            self.config.threshold
        );
        let top_addresses = pending
            .iter()
            .take(TOP_ADDRESSES)
            .map(|g| (g.address.clone(), g.len()))
            .collect();
        let dispatch = self.dispatch(pending).await?;
        Ok(RunSummary {
            file_name: file_name.to_string(),
            classify,
            addresses_seen,
            top_addresses,
            dispatch,
        })
    }

    /// Enrich and persist `groups` in order, `batch_size` at a time. A batch
    /// is fully enriched and stored before the next one starts; the first
    /// fatal error aborts the remaining work.
    pub async fn dispatch(
        &self,
        groups: Vec<AddressGroup>,
    ) -> Result<DispatchSummary, PipelineError> {
        let mut summary = DispatchSummary::default();
        let mut pending = VecDeque::from(groups);
        while !pending.is_empty() {
            let take = self.config.batch_size.min(pending.len());
            let mut tasks = JoinSet::new();
            for group in pending.drain(..take) {
                let enricher = Arc::clone(&self.enricher);
                tasks.spawn(async move { enricher.enrich(group).await });
            }

            let mut completed = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let records = joined??;
                if let Some(first) = records.first() {
                    for tag in &first.tags {
                        *summary.tag_counts.entry(tag.clone()).or_default() += 1;
                    }
                }
                summary.groups_enriched += 1;
                completed.extend(records);
            }

            summary.batches += 1;
            let stored = self.store.insert_many(completed).await?;
            summary.records_stored += stored;
            info!(
                "batch {}: {} groups enriched, {} records stored, {} groups pending",
                summary.batches,
                take,
                stored,
                pending.len()
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::OutputRecord;
    use crate::resolve::Resolution;
    use crate::resolve::fixtures::{CountingResolver, FixedResolver};
    use crate::store::{Page, RecordFilter, StoredEntry};
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Keeps every inserted batch in memory.
    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<Vec<OutputRecord>>>,
        fail: bool,
    }

    impl RecordingStore {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn records(&self) -> Vec<OutputRecord> {
            self.batches.lock().unwrap().concat()
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl RecordStore for RecordingStore {
        async fn insert_many(&self, records: Vec<OutputRecord>) -> Result<u64, StoreError> {
            if self.fail {
                return Err(StoreError::Database(sqlx::Error::PoolClosed));
            }
            let n = records.len() as u64;
            self.batches.lock().unwrap().push(records);
            Ok(n)
        }

        async fn count(&self, _filter: &RecordFilter) -> Result<u64, StoreError> {
            Ok(self.records().len() as u64)
        }

        async fn search(
            &self,
            _filter: &RecordFilter,
            page: Page,
        ) -> Result<Vec<StoredEntry>, StoreError> {
            Ok(self
                .records()
                .into_iter()
                .enumerate()
                .skip(page.offset as usize)
                .take(page.limit as usize)
                .map(|(i, record)| StoredEntry {
                    id: i as i64 + 1,
                    record,
                })
                .collect())
        }
    }

    /// Records when each request arrives and answers after `delay`.
    struct ArrivalLog {
        arrivals: Arc<Mutex<Vec<Instant>>>,
        delay: Duration,
    }

    impl Respond for ArrivalLog {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.arrivals.lock().unwrap().push(Instant::now());
            ResponseTemplate::new(200)
                .set_body_string("<title>slow</title>")
                .set_delay(self.delay)
        }
    }

    fn localhost() -> Arc<dyn Resolve> {
        Arc::new(FixedResolver(Resolution::Resolved(IpAddr::V4(
            Ipv4Addr::LOCALHOST,
        ))))
    }

    fn pipeline(
        config: PipelineConfig,
        resolver: Arc<dyn Resolve>,
        store: Arc<RecordingStore>,
    ) -> Pipeline {
        Pipeline::new(config, resolver, store).unwrap()
    }

    fn repeated_dump(occurrences: usize) -> String {
        (0..occurrences)
            .map(|i| format!("http://a.com:user{}:pass{}", i % 2 + 1, i % 2 + 1))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn single_line_groups(n: usize) -> Vec<AddressGroup> {
        (0..n)
            .map(|i| {
                let address = format!("http://host{:02}.test", i);
                AddressGroup {
                    records: vec![CredentialRecord::new("f", i, address.clone(), "u", "p")],
                    address,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn unresolved_address_yields_unresolved_records() {
        let store = Arc::new(RecordingStore::default());
        let p = pipeline(
            PipelineConfig::default(),
            Arc::new(FixedResolver(Resolution::Unresolved)),
            Arc::clone(&store),
        );
        let summary = p
            .process_file("dump.txt", repeated_dump(101))
            .await
            .unwrap();

        let records = store.records();
        assert_eq!(records.len(), 101);
        assert_eq!(summary.dispatch.records_stored, 101);
        assert_eq!(summary.dispatch.tag_counts.get("unresolved"), Some(&1));
        assert_eq!(summary.top_addresses, vec![("http://a.com".to_string(), 101)]);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.address, "http://a.com");
            assert_eq!(r.tags, vec!["unresolved"]);
            assert_eq!(r.ip_address, None);
            assert_eq!(r.port, None);
            assert_eq!(r.scheme, None);
            assert_eq!(r.title, None);
            assert_eq!(r.file_name, "dump.txt");
            assert_eq!(r.line_number, i);
        }
        assert_eq!(records[0].username, "user1");
        assert_eq!(records[1].password, "pass2");
    }

    #[tokio::test]
    async fn groups_at_threshold_are_skipped() {
        let mut dump = repeated_dump(100);
        dump.push('\n');
        dump.push_str(&repeated_dump(101).replace("a.com", "b.com"));
        let store = Arc::new(RecordingStore::default());
        let p = pipeline(
            PipelineConfig::default(),
            Arc::new(FixedResolver(Resolution::Unresolved)),
            Arc::clone(&store),
        );
        let summary = p.process_file("f", dump).await.unwrap();
        assert_eq!(summary.addresses_seen, 2);
        assert_eq!(summary.dispatch.groups_enriched, 1);
        let records = store.records();
        assert_eq!(records.len(), 101);
        assert!(records.iter().all(|r| r.address == "http://b.com"));
        assert_eq!(records[0].line_number, 100);
    }

    #[tokio::test]
    async fn nothing_above_threshold_stores_nothing() {
        let store = Arc::new(RecordingStore::default());
        let p = pipeline(
            PipelineConfig::default(),
            Arc::new(FixedResolver(Resolution::Unresolved)),
            Arc::clone(&store),
        );
        let summary = p
            .process_lines("f", ["http://a.com:u:p", "junk"].map(Ok::<_, io::Error>))
            .await
            .unwrap();
        assert_eq!(summary.classify.accepted, 1);
        assert_eq!(summary.dispatch, DispatchSummary::default());
        assert!(store.batch_sizes().is_empty());
    }

    #[tokio::test]
    async fn batches_are_bounded_and_sequential() {
        let store = Arc::new(RecordingStore::default());
        let resolver = Arc::new(CountingResolver::default());
        let p = pipeline(
            PipelineConfig::default(),
            Arc::clone(&resolver) as Arc<dyn Resolve>,
            Arc::clone(&store),
        );
        let summary = p.dispatch(single_line_groups(25)).await.unwrap();

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.groups_enriched, 25);
        assert_eq!(store.batch_sizes(), vec![10, 10, 5]);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 25);
        let peak = resolver.peak.load(Ordering::SeqCst);
        assert!(peak <= 10, "peak concurrency {}", peak);
        assert!(peak > 1, "groups in a batch should overlap");
    }

    #[tokio::test]
    async fn batch_order_follows_group_order() {
        let store = Arc::new(RecordingStore::default());
        let config = PipelineConfig {
            batch_size: 2,
            ..PipelineConfig::default()
        };
        let p = pipeline(
            config,
            Arc::new(FixedResolver(Resolution::Unresolved)),
            Arc::clone(&store),
        );
        p.dispatch(single_line_groups(5)).await.unwrap();
        let batches = store.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 3);
        let mut first: Vec<&str> = batches[0].iter().map(|r| r.address.as_str()).collect();
        first.sort();
        assert_eq!(first, vec!["http://host00.test", "http://host01.test"]);
        assert_eq!(batches[2][0].address, "http://host04.test");
    }

    #[tokio::test]
    async fn live_address_is_tagged_from_the_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<title>Example</title>"))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let p = pipeline(
            PipelineConfig::default(),
            localhost(),
            Arc::clone(&store),
        );
        let address = server.uri();
        let group = AddressGroup {
            records: (0..3)
                .map(|i| CredentialRecord::new("f", i, address.clone(), "u", "p"))
                .collect(),
            address,
        };
        let summary = p.dispatch(vec![group]).await.unwrap();
        assert_eq!(summary.records_stored, 3);
        for r in store.records() {
            assert_eq!(r.title.as_deref(), Some("Example"));
            assert_eq!(r.tags, vec!["resolved", "success", "active"]);
            assert!(!r.tags.iter().any(|t| t == "login"));
        }
    }

    #[tokio::test]
    async fn fatal_probe_error_aborts_the_run() {
        let store = Arc::new(RecordingStore::default());
        let p = pipeline(
            PipelineConfig::default(),
            localhost(),
            Arc::clone(&store),
        );
        let broken = AddressGroup {
            address: "http://".into(),
            records: vec![CredentialRecord::new("f", 0, "http://".into(), "u", "p")],
        };
        let err = p.dispatch(vec![broken]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Probe(ProbeError::InvalidUrl(_))));
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn store_failure_is_fatal() {
        let p = pipeline(
            PipelineConfig::default(),
            Arc::new(FixedResolver(Resolution::Unresolved)),
            Arc::new(RecordingStore::failing()),
        );
        let err = p.dispatch(single_line_groups(3)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));
    }

    #[tokio::test]
    async fn submit_runs_in_background() {
        let store = Arc::new(RecordingStore::default());
        let p = pipeline(
            PipelineConfig::default(),
            Arc::new(FixedResolver(Resolution::Unresolved)),
            Arc::clone(&store),
        );
        let handle = p.submit("bg.txt".into(), repeated_dump(150));
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.file_name, "bg.txt");
        assert_eq!(summary.dispatch.records_stored, 150);
        assert_eq!(store.count(&RecordFilter::default()).await.unwrap(), 150);
        let page = store
            .search(&RecordFilter::default(), Page { offset: 148, limit: 10 })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn read_error_aborts_before_enrichment() {
        let store = Arc::new(RecordingStore::default());
        let p = pipeline(
            PipelineConfig {
                threshold: 0,
                ..PipelineConfig::default()
            },
            Arc::new(FixedResolver(Resolution::Unresolved)),
            Arc::clone(&store),
        );
        let lines = vec![
            Ok("http://a.com:u:p".to_string()),
            Err(io::Error::other("truncated read")),
        ];
        let err = p.process_lines("f", lines).await.unwrap_err();
        assert!(matches!(err, PipelineError::Read(_)));
        assert!(store.batch_sizes().is_empty());
    }

    #[tokio::test]
    async fn request_limit_spans_the_whole_batch() {
        let delay = Duration::from_millis(300);
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ArrivalLog {
                arrivals: Arc::clone(&arrivals),
                delay,
            })
            .expect(6)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let config = PipelineConfig {
            batch_size: 6,
            probe_concurrency: 2,
            ..PipelineConfig::default()
        };
        let p = pipeline(config, localhost(), Arc::clone(&store));
        let groups: Vec<AddressGroup> = (0..6)
            .map(|i| {
                let address = server.uri();
                AddressGroup {
                    records: vec![CredentialRecord::new("f", i, address.clone(), "u", "p")],
                    address,
                }
            })
            .collect();

        let started = Instant::now();
        let summary = p.dispatch(groups).await.unwrap();
        let elapsed = started.elapsed();
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.records_stored, 6);

        // A third request can only arrive once an earlier response, held
        // back for `delay`, has been delivered and its permit released.
        let arrivals = arrivals.lock().unwrap().clone();
        assert_eq!(arrivals.len(), 6);
        let window = delay * 3 / 4;
        let peak = arrivals
            .iter()
            .map(|start| {
                arrivals
                    .iter()
                    .filter(|t| **t >= *start && t.duration_since(*start) < window)
                    .count()
            })
            .max()
            .unwrap();
        assert!(peak <= 2, "{} requests in flight at once", peak);
        assert!(elapsed >= delay * 2, "finished in {:?}", elapsed);
    }
}
