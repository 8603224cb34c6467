use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use oppbot_adapters::{AdapterContext, AdapterError, FetchedPage, SourceAdapter};
use oppbot_core::{Category, Opportunity};
use oppbot_storage::{
    HttpClientConfig, HttpFetcher, MemoryOpportunityStore, OpportunityStore, RetryPolicy,
};
use oppbot_sync::notify::{MAX_EMBED_DESCRIPTION, MAX_EMBED_TOTAL};
use oppbot_sync::{
    discord_payload, fit_discord, Classifier, ClassifierError, ConfiguredSource, Digest,
    DigestPipeline, DispatchOutcome, Notifier, NotifyError, RelevanceFilter,
};
use serde_json::Value;

struct StaticSource {
    id: &'static str,
    category: Category,
    records: Vec<Opportunity>,
    fail: bool,
}

#[async_trait]
impl SourceAdapter for StaticSource {
    fn source_id(&self) -> &str {
        self.id
    }

    fn category(&self) -> Category {
        self.category
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        if self.fail {
            return Err(AdapterError::Parse(format!("{} is down", self.id)));
        }
        Ok(vec![FetchedPage {
            url: format!("memory://{}", self.id),
            content_type: "text/html".into(),
            body: Vec::new(),
            fetched_at: Utc::now(),
        }])
    }

    fn parse(
        &self,
        _page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<Opportunity>, AdapterError> {
        Ok(self
            .records
            .iter()
            .filter(|o| !ctx.blocklist.is_blocked(&o.employer))
            .cloned()
            .collect())
    }
}

/// Keeps every candidate whose title contains "Intern" or "Engineer".
struct KeywordClassifier {
    calls: AtomicUsize,
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, prompt: &str) -> Result<String, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let verdicts: Vec<String> = prompt
            .lines()
            .filter_map(|l| l.strip_prefix("Title: "))
            .map(|t| (t.contains("Intern") || t.contains("Engineer")).to_string())
            .collect();
        Ok(format!("[{}]", verdicts.join(",")))
    }
}

struct RecordingNotifier {
    outcome: DispatchOutcome,
    digests: Mutex<Vec<Digest>>,
}

impl RecordingNotifier {
    fn new(outcome: DispatchOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            digests: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<Digest> {
        self.digests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn dispatch(&self, digest: &Digest) -> Result<DispatchOutcome, NotifyError> {
        self.digests.lock().unwrap().push(digest.clone());
        Ok(self.outcome)
    }
}

fn acme_intern() -> Opportunity {
    Opportunity::new(
        "Acme",
        "SWE Intern",
        "Remote",
        "https://acme.example.com/jobs/1",
        Category::Internship,
    )
}

fn sources() -> Vec<ConfiguredSource> {
    vec![
        ConfiguredSource::new(Box::new(StaticSource {
            id: "github-internships",
            category: Category::Internship,
            records: vec![
                acme_intern(),
                Opportunity::new(
                    "Globex",
                    "Barista",
                    "Springfield",
                    "https://globex.example.com/2",
                    Category::Internship,
                ),
                Opportunity::new(
                    "Patterned Learning AI - Tech Recruitment & Staffing",
                    "SWE Intern",
                    "Remote",
                    "https://spam.example.com",
                    Category::Internship,
                ),
            ],
            fail: false,
        })),
        ConfiguredSource::new(Box::new(StaticSource {
            id: "linkedin-swe",
            category: Category::FullTime,
            records: vec![Opportunity::new(
                "Initech",
                "Software Engineer",
                "Irvine, CA",
                "https://initech.example.com/3",
                Category::FullTime,
            )],
            fail: false,
        })),
        ConfiguredSource::new(Box::new(StaticSource {
            id: "rapidapi-indeed",
            category: Category::FullTime,
            records: Vec::new(),
            fail: true,
        })),
    ]
}

fn build(
    store: Arc<MemoryOpportunityStore>,
    notifier: Arc<RecordingNotifier>,
    classifier: Arc<KeywordClassifier>,
) -> DigestPipeline {
    DigestPipeline::new(
        store,
        notifier,
        HttpFetcher::new(HttpClientConfig::default()).unwrap(),
    )
    .with_sources(sources())
    .with_filter(RelevanceFilter::new(
        classifier,
        RetryPolicy::new(3, Duration::from_millis(1)),
    ))
}

fn classifier() -> Arc<KeywordClassifier> {
    Arc::new(KeywordClassifier {
        calls: AtomicUsize::new(0),
    })
}

#[tokio::test]
async fn delivered_digest_marks_everything_sent() {
    let store = Arc::new(MemoryOpportunityStore::new());
    let notifier = RecordingNotifier::new(DispatchOutcome::Delivered);
    let classifier = classifier();
    let pipeline = build(store.clone(), notifier.clone(), classifier.clone());

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.failed_sources, 1);
    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.kept, 2);
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.dispatched, 2);
    assert!(summary.delivered);
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    let sections: Vec<Category> = sent[0].sections.iter().map(|s| s.category).collect();
    assert_eq!(sections, vec![Category::Internship, Category::FullTime]);
    assert_eq!(
        sent[0].sections[0].body(),
        "[**Acme**](https://acme.example.com/jobs/1): SWE Intern `@Remote`!\n"
    );

    assert!(store.list_unprocessed(None, 15).await.unwrap().is_empty());
    let all = store.list_all().await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|r| r.opportunity.processed));
    assert!(all
        .iter()
        .all(|r| r.opportunity.employer != "Patterned Learning AI - Tech Recruitment & Staffing"));

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(second.dispatched, 0);
    assert_eq!(notifier.sent().len(), 1);
}

#[tokio::test]
async fn rejected_digest_leaves_records_for_next_run() {
    let store = Arc::new(MemoryOpportunityStore::new());
    let notifier = RecordingNotifier::new(DispatchOutcome::Rejected { status: 400 });
    let pipeline = build(store.clone(), notifier.clone(), classifier());

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.dispatched, 2);
    assert!(!summary.delivered);
    assert_eq!(store.list_unprocessed(None, 15).await.unwrap().len(), 2);

    let again = pipeline.run_once().await.unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.dispatched, 2);
    assert_eq!(notifier.sent().len(), 2);
}

#[tokio::test]
async fn ingest_twice_then_mark_empties_the_queue() {
    let store = MemoryOpportunityStore::new();
    store.ingest(&[acme_intern()]).await.unwrap();
    store.ingest(&[acme_intern()]).await.unwrap();

    let pending = store
        .list_unprocessed(Some(Category::Internship), 15)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].opportunity, acme_intern());

    store.mark_processed(&pending).await.unwrap();
    assert!(store
        .list_unprocessed(Some(Category::Internship), 15)
        .await
        .unwrap()
        .is_empty());
}

/// Applies the webhook limits and keeps the JSON it would have posted.
struct DiscordShaped {
    payloads: Mutex<Vec<Value>>,
}

#[async_trait]
impl Notifier for DiscordShaped {
    fn fit(&self, digest: Digest) -> Digest {
        fit_discord(digest)
    }

    async fn dispatch(&self, digest: &Digest) -> Result<DispatchOutcome, NotifyError> {
        let payload = serde_json::to_value(discord_payload(digest)).unwrap();
        self.payloads.lock().unwrap().push(payload);
        Ok(DispatchOutcome::Delivered)
    }
}

fn long_url_source(id: &'static str, category: Category, count: usize) -> ConfiguredSource {
    let records = (0..count)
        .map(|i| {
            Opportunity::new(
                format!("Employer {i}"),
                "SWE Intern",
                "Remote",
                format!("https://jobs.example.com/{i}/{}", "x".repeat(300)),
                category,
            )
        })
        .collect();
    ConfiguredSource::new(Box::new(StaticSource {
        id,
        category,
        records,
        fail: false,
    }))
}

/// Lines shown across section embeds, plus the summed title/description length.
fn shown_and_size(payload: &Value) -> (usize, usize) {
    let embeds = payload["embeds"].as_array().unwrap();
    let mut shown = 0;
    let mut size = 0;
    for embed in embeds {
        size += embed["title"].as_str().unwrap().chars().count();
        if let Some(description) = embed["description"].as_str() {
            assert!(description.chars().count() <= MAX_EMBED_DESCRIPTION);
            size += description.chars().count();
            shown += description.lines().count();
        }
    }
    (shown, size)
}

async fn processed_count(store: &MemoryOpportunityStore) -> usize {
    store
        .list_all()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.opportunity.processed)
        .count()
}

#[tokio::test]
async fn only_records_shown_in_the_webhook_are_marked() {
    let store = Arc::new(MemoryOpportunityStore::new());
    let notifier = Arc::new(DiscordShaped {
        payloads: Mutex::new(Vec::new()),
    });
    let pipeline = DigestPipeline::new(
        store.clone(),
        notifier.clone(),
        HttpFetcher::new(HttpClientConfig::default()).unwrap(),
    )
    .with_sources(vec![long_url_source("github-internships", Category::Internship, 15)]);

    let first = pipeline.run_once().await.unwrap();
    let (shown, size) = shown_and_size(&notifier.payloads.lock().unwrap()[0]);
    assert!(shown > 0 && shown < 15);
    assert!(size <= MAX_EMBED_TOTAL);
    assert_eq!(first.dispatched, shown);
    assert_eq!(processed_count(&store).await, shown);
    assert_eq!(store.list_unprocessed(None, 15).await.unwrap().len(), 15 - shown);

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.dispatched, 15 - shown);
    assert_eq!(processed_count(&store).await, 15);
}

#[tokio::test]
async fn two_full_sections_drain_within_the_message_limit() {
    let store = Arc::new(MemoryOpportunityStore::new());
    let notifier = Arc::new(DiscordShaped {
        payloads: Mutex::new(Vec::new()),
    });
    let pipeline = DigestPipeline::new(
        store.clone(),
        notifier.clone(),
        HttpFetcher::new(HttpClientConfig::default()).unwrap(),
    )
    .with_sources(vec![
        long_url_source("github-internships", Category::Internship, 15),
        long_url_source("linkedin-swe", Category::FullTime, 15),
    ]);

    for _ in 0..10 {
        let summary = pipeline.run_once().await.unwrap();
        if summary.dispatched == 0 {
            break;
        }
        let payloads = notifier.payloads.lock().unwrap();
        let (shown, size) = shown_and_size(payloads.last().unwrap());
        assert!(size <= MAX_EMBED_TOTAL);
        assert_eq!(summary.dispatched, shown);
    }
    assert_eq!(processed_count(&store).await, 30);
    assert!(store.list_unprocessed(None, 15).await.unwrap().is_empty());
}
