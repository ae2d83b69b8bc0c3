//! Deduplication & ingestion loop: one collection cycle at a time walks
//! COLLECTING -> FILTERING -> INGESTING and returns to IDLE, handing each
//! surviving listing to the sink with pacing and a bounded error budget.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use qjr_core::{composite_key, CycleSummary, RawListing};
use qjr_enrich::{EnrichConfig, EnrichmentEngine};
use qjr_scrape::JobScraper;
use qjr_storage::{
    BackoffPolicy, CreatedRecord, HttpClientConfig, HttpFetcher, JsonlSink, RecordSink, SinkError,
};
use tokio::time::sleep;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "qjr-sync";

/// Item failures tolerated per cycle; one more aborts the remainder.
const MAX_ITEM_FAILURES: usize = 5;

const SEARCH_BASE_URL: &str = "https://www.linkedin.com/jobs/search/";

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub keywords: String,
    pub geo_id: String,
    pub request_delay: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub data_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub workspace_root: PathBuf,
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        Self {
            keywords: std::env::var("JOB_KEYWORDS").unwrap_or_else(|_| "quant (remote)".to_string()),
            geo_id: std::env::var("JOB_GEO_ID").unwrap_or_else(|_| "104187078".to_string()),
            request_delay: Duration::from_millis(
                std::env::var("REQUEST_DELAY")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3000),
            ),
            http_timeout: Duration::from_secs(
                std::env::var("QJR_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            user_agent: std::env::var("QJR_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"
                    .to_string()
            }),
            data_file: std::env::var("QJR_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/jobs.jsonl")),
            scheduler_enabled: std::env::var("QJR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 */2 * * *".to_string()),
            workspace_root: PathBuf::from("."),
        }
    }

    /// Search-results URL for the configured keywords and region.
    pub fn search_url(&self) -> Result<String> {
        let url = Url::parse_with_params(
            SEARCH_BASE_URL,
            &[
                ("keywords", self.keywords.as_str()),
                ("geoId", self.geo_id.as_str()),
                ("origin", "JOB_SEARCH_PAGE_SEARCH_BUTTON"),
                ("refresh", "true"),
            ],
        )
        .context("building search url")?;
        Ok(url.into())
    }
}

/// Cycle state. Owned and transitioned only by the pipeline; everyone else
/// gets a read-only view through [`JobPipeline::phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Collecting,
    Filtering,
    Ingesting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleSummary),
    /// A cycle was already running; the trigger was a logged no-op.
    Skipped,
}

pub struct JobPipeline {
    scraper: JobScraper,
    sink: Arc<dyn RecordSink>,
    engine: EnrichmentEngine,
    request_delay: Duration,
    phase: Mutex<CyclePhase>,
    last_summary: Mutex<Option<CycleSummary>>,
}

impl JobPipeline {
    pub fn new(
        scraper: JobScraper,
        sink: Arc<dyn RecordSink>,
        engine: EnrichmentEngine,
        request_delay: Duration,
    ) -> Self {
        Self {
            scraper,
            sink,
            engine,
            request_delay,
            phase: Mutex::new(CyclePhase::Idle),
            last_summary: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock().expect("phase lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.phase() != CyclePhase::Idle
    }

    pub fn last_summary(&self) -> Option<CycleSummary> {
        self.last_summary
            .lock()
            .expect("summary lock poisoned")
            .clone()
    }

    fn set_phase(&self, next: CyclePhase) {
        *self.phase.lock().expect("phase lock poisoned") = next;
    }

    /// Claim the cycle. Fails (without blocking) when a cycle is running;
    /// triggers are rejected rather than queued, so no backlog forms.
    fn begin_cycle(&self) -> bool {
        let mut phase = self.phase.lock().expect("phase lock poisoned");
        if *phase != CyclePhase::Idle {
            return false;
        }
        *phase = CyclePhase::Collecting;
        true
    }

    /// Run one collection cycle against the given search-results URL.
    /// Returns [`CycleOutcome::Skipped`] immediately when a cycle is
    /// already in flight.
    pub async fn run_cycle(&self, search_url: &str) -> Result<CycleOutcome> {
        if !self.begin_cycle() {
            warn!("collection cycle already in progress, skipping trigger");
            return Ok(CycleOutcome::Skipped);
        }

        let result = self.run_cycle_inner(search_url).await;
        self.set_phase(CyclePhase::Idle);

        match result {
            Ok(summary) => {
                info!(
                    total_scraped = summary.total_scraped,
                    new_listings = summary.new_listings,
                    processed = summary.processed,
                    errors = summary.errors,
                    "collection cycle completed"
                );
                *self
                    .last_summary
                    .lock()
                    .expect("summary lock poisoned") = Some(summary.clone());
                Ok(CycleOutcome::Completed(summary))
            }
            Err(err) => {
                error!(%err, "collection cycle failed");
                Err(err)
            }
        }
    }

    async fn run_cycle_inner(&self, search_url: &str) -> Result<CycleSummary> {
        // COLLECTING: snapshot once, then scrape. The snapshot is never
        // refreshed mid-cycle.
        let mut known = self
            .sink
            .known_records()
            .await
            .context("loading known-record snapshot from sink")?;
        info!(existing = known.len(), "loaded known records from sink");

        let scraped = self.scraper.collect_listings(search_url).await;
        let total_scraped = scraped.len();

        self.set_phase(CyclePhase::Filtering);
        let surviving: Vec<RawListing> = scraped
            .into_iter()
            .filter(|listing| {
                if known.matches(listing) {
                    info!(
                        title = %listing.title,
                        company = %listing.company,
                        "skipping duplicate listing"
                    );
                    false
                } else {
                    true
                }
            })
            .collect();
        let new_listings = surviving.len();
        info!(new_listings, "listings survived dedup filter");

        self.set_phase(CyclePhase::Ingesting);
        let mut processed = 0usize;
        let mut errors = 0usize;

        for listing in &surviving {
            // The snapshot grows as records land, which also suppresses
            // duplicates among the newly scraped batch itself.
            if known.matches(listing) {
                info!(title = %listing.title, "suppressing intra-cycle duplicate");
                continue;
            }

            match self.ingest(listing).await {
                Ok(created) => {
                    processed += 1;
                    known.insert(
                        &listing.url,
                        &composite_key(&listing.company, &listing.title, &listing.location),
                    );
                    if created.is_none() {
                        info!(title = %listing.title, "sink rejected record as duplicate");
                    }
                }
                Err(err) => {
                    errors += 1;
                    error!(
                        title = %listing.title,
                        url = %listing.url,
                        %err,
                        "failed to ingest listing"
                    );
                    if errors > MAX_ITEM_FAILURES {
                        warn!("too many errors, aborting remaining items in this cycle");
                        break;
                    }
                }
            }

            sleep(self.request_delay).await;
        }

        Ok(CycleSummary {
            total_scraped,
            new_listings,
            processed,
            errors,
            finished_at: Utc::now(),
        })
    }

    async fn ingest(&self, listing: &RawListing) -> Result<Option<CreatedRecord>, SinkError> {
        let detail = self.scraper.fetch_detail(&listing.url).await;
        let record = self.engine.enrich(listing, &detail, Utc::now());
        self.sink.create(&record).await
    }
}

/// Wire the default pipeline: HTTP fetcher, JSON-lines sink, and the rules
/// from the workspace `rules/` directory.
pub fn pipeline_from_config(config: &CollectorConfig) -> Result<JobPipeline> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
        backoff: BackoffPolicy::default(),
    })?;
    let scraper = JobScraper::new(Arc::new(fetcher));
    let sink = Arc::new(JsonlSink::new(&config.data_file));
    let engine = EnrichmentEngine::from_rules_dir(
        config.workspace_root.join("rules"),
        EnrichConfig::default(),
    )?;
    Ok(JobPipeline::new(scraper, sink, engine, config.request_delay))
}

pub async fn run_cycle_once_from_env() -> Result<CycleOutcome> {
    let config = CollectorConfig::from_env();
    let pipeline = pipeline_from_config(&config)?;
    pipeline.run_cycle(&config.search_url()?).await
}

/// Cron-driven trigger. Re-entrancy is the pipeline's problem: a tick that
/// lands while a cycle is running resolves to a skipped outcome.
pub async fn build_scheduler(
    pipeline: Arc<JobPipeline>,
    cron: &str,
    search_url: String,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_pipeline = pipeline.clone();
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = job_pipeline.clone();
        let search_url = search_url.clone();
        Box::pin(async move {
            if let Err(err) = pipeline.run_cycle(&search_url).await {
                warn!(%err, "scheduled collection cycle failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qjr_core::{EnrichedRecord, KnownRecords};
    use qjr_enrich::EnrichmentRules;
    use qjr_storage::{FetchError, MemorySink, PageFetcher};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn engine() -> EnrichmentEngine {
        let rules = EnrichmentRules::from_rules_dir(workspace_root().join("rules"))
            .expect("load rules");
        EnrichmentEngine::new(rules, EnrichConfig::default())
    }

    fn card(title: &str, company: &str, location: &str, path: &str) -> String {
        format!(
            r#"<div class="job-search-card">
                 <h3 class="base-search-card__title">{title}</h3>
                 <div class="base-search-card__subtitle">{company}</div>
                 <span class="job-search-card__location">{location}</span>
                 <a class="base-card__full-link" href="{path}"></a>
               </div>"#
        )
    }

    const SEARCH_URL: &str = "https://www.linkedin.com/jobs/search/?keywords=test";

    /// Serves a canned search page; every other URL (detail pages) fails,
    /// which exercises the empty-detail degradation path.
    struct ScriptedFetcher {
        pages: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn with_search_page(cards: &[String]) -> Self {
            let page = format!("<ul>{}</ul>", cards.join("\n"));
            let mut pages = HashMap::new();
            pages.insert(SEARCH_URL.to_string(), page);
            Self {
                pages,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                })
        }
    }

    struct FailingSink {
        create_calls: AtomicUsize,
    }

    impl FailingSink {
        fn new() -> Self {
            Self {
                create_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RecordSink for FailingSink {
        async fn known_records(&self) -> Result<KnownRecords, SinkError> {
            Ok(KnownRecords::default())
        }

        async fn create(
            &self,
            _record: &EnrichedRecord,
        ) -> Result<Option<CreatedRecord>, SinkError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            Err(SinkError::Message("storage unavailable".to_string()))
        }
    }

    /// Accepts the snapshot but rejects every record as a duplicate.
    struct RejectingSink;

    #[async_trait]
    impl RecordSink for RejectingSink {
        async fn known_records(&self) -> Result<KnownRecords, SinkError> {
            Ok(KnownRecords::default())
        }

        async fn create(
            &self,
            _record: &EnrichedRecord,
        ) -> Result<Option<CreatedRecord>, SinkError> {
            Ok(None)
        }
    }

    fn pipeline_with(
        fetcher: Arc<ScriptedFetcher>,
        sink: Arc<dyn RecordSink>,
    ) -> JobPipeline {
        JobPipeline::new(JobScraper::new(fetcher), sink, engine(), Duration::ZERO)
    }

    fn summary_of(outcome: CycleOutcome) -> CycleSummary {
        match outcome {
            CycleOutcome::Completed(summary) => summary,
            CycleOutcome::Skipped => panic!("cycle unexpectedly skipped"),
        }
    }

    #[tokio::test]
    async fn reentrant_trigger_is_rejected_without_fetching() {
        let fetcher = Arc::new(ScriptedFetcher::with_search_page(&[]));
        let pipeline = pipeline_with(fetcher.clone(), Arc::new(MemorySink::new()));

        assert!(pipeline.begin_cycle());
        assert_eq!(pipeline.phase(), CyclePhase::Collecting);

        let outcome = pipeline.run_cycle(SEARCH_URL).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Skipped);
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn snapshot_match_on_url_or_composite_key_filters_listing() {
        let cards = vec![
            card("Quant Researcher", "Acme Capital", "Taipei City, Taiwan", "/jobs/view/100"),
            card("ML Engineer", "Globex", "Remote", "/jobs/view/200"),
            card("Data Analyst", "Initech", "Taichung City", "/jobs/view/300"),
        ];
        let fetcher = Arc::new(ScriptedFetcher::with_search_page(&cards));

        let sink = Arc::new(MemorySink::new());
        // Known by URL.
        let known_by_url = engine().enrich(
            &RawListing {
                title: "Stale Title".to_string(),
                company: "Stale Co".to_string(),
                location: "Elsewhere".to_string(),
                url: "https://www.linkedin.com/jobs/view/100".to_string(),
                source: "linkedin".to_string(),
                scraped_at: Utc::now(),
                posted_time: None,
                application_status: None,
                job_type: Default::default(),
            },
            &Default::default(),
            Utc::now(),
        );
        // Known by composite key, under a different URL.
        let known_by_key = engine().enrich(
            &RawListing {
                title: "ML Engineer".to_string(),
                company: "Globex".to_string(),
                location: "Remote".to_string(),
                url: "https://www.linkedin.com/jobs/view/999".to_string(),
                source: "linkedin".to_string(),
                scraped_at: Utc::now(),
                posted_time: None,
                application_status: None,
                job_type: Default::default(),
            },
            &Default::default(),
            Utc::now(),
        );
        sink.seed(known_by_url).await;
        sink.seed(known_by_key).await;

        let pipeline = pipeline_with(fetcher, sink.clone());
        let summary = summary_of(pipeline.run_cycle(SEARCH_URL).await.unwrap());

        assert_eq!(summary.total_scraped, 3);
        assert_eq!(summary.new_listings, 1);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.errors, 0);

        let titles: Vec<String> = sink
            .records()
            .await
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert!(titles.contains(&"Data Analyst".to_string()));
        assert!(!titles.contains(&"Quant Researcher".to_string()));
    }

    #[tokio::test]
    async fn intra_cycle_duplicates_are_suppressed() {
        // Same company/title/location reposted under two URLs in one page.
        let cards = vec![
            card("Quant Developer", "Acme Capital", "Taipei City, Taiwan", "/jobs/view/1"),
            card("Quant Developer", "Acme Capital", "Taipei City, Taiwan", "/jobs/view/2"),
        ];
        let fetcher = Arc::new(ScriptedFetcher::with_search_page(&cards));
        let sink = Arc::new(MemorySink::new());

        let pipeline = pipeline_with(fetcher, sink.clone());
        let summary = summary_of(pipeline.run_cycle(SEARCH_URL).await.unwrap());

        assert_eq!(summary.total_scraped, 2);
        assert_eq!(summary.new_listings, 2);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn error_threshold_aborts_remaining_items() {
        let cards: Vec<String> = (0..8)
            .map(|i| {
                card(
                    &format!("Role {i}"),
                    &format!("Company {i}"),
                    "Taipei City",
                    &format!("/jobs/view/{i}"),
                )
            })
            .collect();
        let fetcher = Arc::new(ScriptedFetcher::with_search_page(&cards));
        let sink = Arc::new(FailingSink::new());

        let pipeline = pipeline_with(fetcher, sink.clone());
        let summary = summary_of(pipeline.run_cycle(SEARCH_URL).await.unwrap());

        assert_eq!(summary.total_scraped, 8);
        assert_eq!(summary.new_listings, 8);
        assert_eq!(summary.processed, 0);
        // The sixth failure crosses the threshold and aborts items 7 and 8.
        assert_eq!(summary.errors, 6);
        assert_eq!(sink.create_calls.load(Ordering::SeqCst), 6);
        assert_eq!(pipeline.phase(), CyclePhase::Idle);
    }

    #[tokio::test]
    async fn sink_level_duplicate_rejection_is_not_an_error() {
        let cards = vec![
            card("Quant Researcher", "Acme Capital", "Taipei City", "/jobs/view/1"),
            card("ML Engineer", "Globex", "Remote", "/jobs/view/2"),
        ];
        let fetcher = Arc::new(ScriptedFetcher::with_search_page(&cards));
        let pipeline = pipeline_with(fetcher, Arc::new(RejectingSink));

        let summary = summary_of(pipeline.run_cycle(SEARCH_URL).await.unwrap());
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.errors, 0);
    }

    #[tokio::test]
    async fn failed_search_fetch_completes_with_zero_listings() {
        let fetcher = Arc::new(ScriptedFetcher {
            pages: HashMap::new(),
            calls: AtomicUsize::new(0),
        });
        let pipeline = pipeline_with(fetcher, Arc::new(MemorySink::new()));

        let summary = summary_of(pipeline.run_cycle(SEARCH_URL).await.unwrap());
        assert_eq!(summary.total_scraped, 0);
        assert_eq!(summary.new_listings, 0);
        assert_eq!(summary.processed, 0);
        assert_eq!(pipeline.phase(), CyclePhase::Idle);
        assert!(pipeline.last_summary().is_some());
    }

    #[test]
    fn search_url_is_percent_encoded() {
        let mut config = CollectorConfig::from_env();
        config.keywords = "quant (remote)".to_string();
        config.geo_id = "104187078".to_string();

        let url = config.search_url().unwrap();
        assert!(url.starts_with("https://www.linkedin.com/jobs/search/?"));
        assert!(url.contains("geoId=104187078"));
        assert!(!url.contains("quant (remote)"), "raw spaces must be encoded");
    }
}
