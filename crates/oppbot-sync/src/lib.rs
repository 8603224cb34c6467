//! Digest pipeline orchestration: collect, filter, ingest, dispatch, mark.

pub mod config;
pub mod filter;
pub mod notify;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use oppbot_adapters::{
    adapter_for_kind, collect, AdapterContext, RapidApiCredentials, SourceAdapter, SourceBatch,
};
use oppbot_core::{merge_opportunities, BlockList, Category, StoredOpportunity};
use oppbot_storage::{
    ArtifactStore, HttpClientConfig, HttpFetcher, MemoryOpportunityStore, OpportunityStore,
    PgOpportunityStore, RetryPolicy, DEFAULT_UNPROCESSED_LIMIT,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{
    ConfigError, DigestSettings, SourceConfig, SourceRegistry, StoreSettings, SyncConfig,
};
pub use filter::{
    apply_verdicts, build_prompt, parse_verdicts, Classifier, ClassifierError, FilterReport,
    OpenAiClassifier, RelevanceFilter, VerdictParseError,
};
pub use notify::{
    discord_payload, fit_discord, format_opportunities, Digest, DigestEntry, DigestSection,
    DiscordWebhook, DispatchOutcome, LogNotifier, Notifier, NotifyError, WebhookPayload,
};

pub const CRATE_NAME: &str = "oppbot-sync";

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub kept: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub failed_sources: usize,
    pub dispatched: usize,
    pub delivered: bool,
}

impl RunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            candidates: 0,
            kept: 0,
            inserted: 0,
            skipped: 0,
            failed_sources: 0,
            dispatched: 0,
            delivered: false,
        }
    }
}

pub struct ConfiguredSource {
    pub adapter: Box<dyn SourceAdapter>,
    pub max_results: Option<usize>,
}

impl ConfiguredSource {
    pub fn new(adapter: Box<dyn SourceAdapter>) -> Self {
        Self {
            adapter,
            max_results: None,
        }
    }
}

pub struct DigestPipeline {
    store: Arc<dyn OpportunityStore>,
    notifier: Arc<dyn Notifier>,
    http: HttpFetcher,
    sources: Vec<ConfiguredSource>,
    filter: RelevanceFilter,
    settings: DigestSettings,
    blocklist: Arc<BlockList>,
    artifacts: Option<ArtifactStore>,
    digest_limit: usize,
    max_per_source: usize,
    days_needed: Option<i64>,
    run_lock: Mutex<()>,
}

impl DigestPipeline {
    pub fn new(
        store: Arc<dyn OpportunityStore>,
        notifier: Arc<dyn Notifier>,
        http: HttpFetcher,
    ) -> Self {
        Self {
            store,
            notifier,
            http,
            sources: Vec::new(),
            filter: RelevanceFilter::disabled(),
            settings: DigestSettings::default(),
            blocklist: Arc::new(BlockList::default()),
            artifacts: None,
            digest_limit: DEFAULT_UNPROCESSED_LIMIT,
            max_per_source: oppbot_adapters::DEFAULT_MAX_RESULTS,
            days_needed: None,
            run_lock: Mutex::new(()),
        }
    }

    /// Sources in registry order; that order drives merging and digest sections.
    pub fn with_sources(mut self, sources: Vec<ConfiguredSource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_filter(mut self, filter: RelevanceFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_settings(mut self, settings: DigestSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_blocklist(mut self, blocklist: BlockList) -> Self {
        self.blocklist = Arc::new(blocklist);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Option<ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_limits(mut self, digest_limit: usize, max_per_source: usize) -> Self {
        self.digest_limit = digest_limit;
        self.max_per_source = max_per_source;
        self
    }

    pub fn with_days_needed(mut self, days_needed: Option<i64>) -> Self {
        self.days_needed = days_needed;
        self
    }

    /// Categories with at least one source, in source order.
    pub fn categories(&self) -> Vec<Category> {
        let mut out = Vec::new();
        for source in &self.sources {
            let category = source.adapter.category();
            if !out.contains(&category) {
                out.push(category);
            }
        }
        out
    }

    /// One full run. Concurrent callers wait for the previous run to finish.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("digest_run", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let today = Local::now().date_naive();
        let mut summary = RunSummary::new(run_id, started_at);
        let categories = self.categories();
        info!(sources = self.sources.len(), ?categories, "digest run started");

        for &category in &categories {
            self.ingest_category(run_id, today, category, &mut summary)
                .await?;
        }

        let mut digest = Digest::new(today);
        for &category in &categories {
            let batch = self
                .store
                .list_unprocessed(Some(category), self.digest_limit)
                .await
                .with_context(|| format!("listing unprocessed {category} opportunities"))?;
            digest.push_section(category, batch, self.settings.message_template());
        }

        let pending = digest.len();
        let digest = self.notifier.fit(digest);
        if digest.is_empty() {
            if pending > 0 {
                warn!(pending, "nothing fits in one message; records stay unprocessed");
            } else {
                info!("no new opportunities");
            }
            summary.finished_at = Utc::now();
            return Ok(summary);
        }
        let dispatched: Vec<StoredOpportunity> = digest.records().cloned().collect();
        if dispatched.len() < pending {
            info!(
                sending = dispatched.len(),
                held_back = pending - dispatched.len(),
                "digest trimmed to fit one message"
            );
        }

        summary.dispatched = dispatched.len();
        match self.notifier.dispatch(&digest).await {
            Ok(DispatchOutcome::Delivered) => {
                let marked = self
                    .store
                    .mark_processed(&dispatched)
                    .await
                    .context("marking dispatched opportunities processed")?;
                summary.delivered = true;
                info!(dispatched = dispatched.len(), marked, "digest sent");
            }
            Ok(DispatchOutcome::Rejected { status }) => {
                warn!(status, "digest rejected; records stay unprocessed for the next run");
            }
            Err(err) => {
                warn!(error = %err, "digest dispatch failed; records stay unprocessed for the next run");
            }
        }

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn ingest_category(
        &self,
        run_id: Uuid,
        today: NaiveDate,
        category: Category,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let base_ctx = AdapterContext::new(run_id, today, Arc::clone(&self.blocklist))
            .with_days_needed(self.days_needed);

        let mut lists = Vec::new();
        for source in self
            .sources
            .iter()
            .filter(|s| s.adapter.category() == category)
        {
            let source_id = source.adapter.source_id();
            let ctx = base_ctx
                .clone()
                .with_max_results(source.max_results.unwrap_or(self.max_per_source));
            match collect(source.adapter.as_ref(), &self.http, &ctx).await {
                Ok(batch) => {
                    self.archive(source_id, &batch).await;
                    info!(source_id, found = batch.opportunities.len(), "source collected");
                    lists.push(batch.opportunities);
                }
                Err(err) => {
                    summary.failed_sources += 1;
                    warn!(source_id, error = %err, "source failed; continuing with the others");
                }
            }
        }

        let candidates = merge_opportunities(lists);
        summary.candidates += candidates.len();
        let report = self
            .filter
            .filter(candidates, self.settings.prompt_for(category))
            .await;
        summary.kept += report.kept.len();
        if report.kept.is_empty() {
            return Ok(());
        }

        let ingested = self
            .store
            .ingest(&report.kept)
            .await
            .with_context(|| format!("ingesting {category} opportunities"))?;
        summary.inserted += ingested.inserted;
        summary.skipped += ingested.skipped;
        info!(
            %category,
            inserted = ingested.inserted,
            skipped = ingested.skipped,
            "ingested"
        );
        Ok(())
    }

    async fn archive(&self, source_id: &str, batch: &SourceBatch) {
        let Some(artifacts) = &self.artifacts else {
            return;
        };
        for page in &batch.pages {
            if let Err(err) = artifacts
                .archive_page(page.fetched_at, source_id, &page.content_type, &page.body)
                .await
            {
                warn!(source_id, url = %page.url, error = %err, "failed to archive page");
            }
        }
    }
}

// ----------------- SCHEDULER -----------------

/// Register one job per cron expression. Runs are serialized by the pipeline.
pub async fn build_scheduler(
    pipeline: Arc<DigestPipeline>,
    crons: &[String],
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in crons {
        let pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        dispatched = summary.dispatched,
                        delivered = summary.delivered,
                        "scheduled run finished"
                    ),
                    Err(err) => error!(error = ?err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, "scheduled digest run");
    }
    Ok(sched)
}

// ----------------- WIRING -----------------

pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn OpportunityStore>> {
    match &config.store {
        Some(settings) => {
            let store = PgOpportunityStore::connect(&settings.database_url, &settings.table)
                .await
                .context("connecting to postgres")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("dry run: using in-memory store");
            let store = MemoryOpportunityStore::new();
            store.create_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn load_registry(config: &SyncConfig) -> Result<SourceRegistry> {
    let registry = SourceRegistry::load(&config.sources_path).await?;
    config.check_registry(&registry)?;
    Ok(registry)
}

pub async fn pipeline_from_config(
    config: &SyncConfig,
    registry: &SourceRegistry,
    store: Arc<dyn OpportunityStore>,
    days_needed: Option<i64>,
) -> Result<DigestPipeline> {
    let settings = DigestSettings::load_or_default(&config.digest_path).await?;

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;

    let mut sources = Vec::new();
    for source in registry.enabled() {
        let rapidapi = config
            .rapid_api_key
            .as_ref()
            .map(|key| RapidApiCredentials {
                api_key: key.clone(),
                host: source.rapidapi_host().to_string(),
            });
        let adapter = adapter_for_kind(
            source.kind,
            &source.source_id,
            source.category,
            source.listing_urls.clone(),
            rapidapi,
        )
        .with_context(|| format!("building adapter for {}", source.source_id))?;
        sources.push(ConfiguredSource {
            adapter,
            max_results: source.max_results,
        });
    }

    let filter = match (&config.openai_api_key, config.filter_enabled) {
        (Some(api_key), true) => {
            let classifier = OpenAiClassifier::new(
                http.client().clone(),
                config.openai_base_url.clone(),
                api_key.clone(),
                config.llm_model.clone(),
            );
            RelevanceFilter::new(
                Arc::new(classifier),
                RetryPolicy::new(config.filter_max_attempts, config.filter_retry_delay),
            )
        }
        _ => {
            warn!("relevance filter disabled; every candidate passes");
            RelevanceFilter::disabled()
        }
    };

    let notifier: Arc<dyn Notifier> = match (&config.webhook_url, config.dry_run) {
        (Some(url), false) => Arc::new(DiscordWebhook::new(http.client().clone(), url.clone())),
        _ => Arc::new(LogNotifier),
    };

    Ok(DigestPipeline::new(store, notifier, http)
        .with_sources(sources)
        .with_filter(filter)
        .with_settings(settings)
        .with_blocklist(registry.blocklist())
        .with_artifacts(config.artifacts_dir.clone().map(ArtifactStore::new))
        .with_limits(config.digest_limit, config.max_per_source)
        .with_days_needed(days_needed))
}

/// Registry and credentials are checked before the store is opened.
pub async fn build_pipeline(
    config: &SyncConfig,
    days_needed: Option<i64>,
) -> Result<DigestPipeline> {
    let registry = load_registry(config).await?;
    let store = open_store(config).await?;
    pipeline_from_config(config, &registry, store, days_needed).await
}

pub async fn run_once_from_env(dry_run: bool, days_needed: Option<i64>) -> Result<RunSummary> {
    let config = SyncConfig::from_env(dry_run)?;
    build_pipeline(&config, days_needed).await?.run_once().await
}
