//! Source adapter contract plus the LinkedIn, GitHub table and RapidAPI Indeed adapters.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use oppbot_core::{BlockList, Category, Opportunity};
use oppbot_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppbot-adapters";

pub const DEFAULT_MAX_RESULTS: usize = 15;

/// Marker a GitHub internship table puts in the link cell of closed postings.
pub const CLOSED_POSTING_MARKER: &str = "🔒";

/// Continuation marker: the row belongs to the employer of the row above.
const SAME_EMPLOYER_MARKER: &str = "↳";

pub const DEFAULT_RAPIDAPI_HOST: &str = "indeed12.p.rapidapi.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Linkedin,
    GithubTable,
    RapidapiIndeed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub today: NaiveDate,
    /// Maximum posting age in days. `None` keeps everything.
    pub days_needed: Option<i64>,
    pub max_results: usize,
    pub blocklist: Arc<BlockList>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, today: NaiveDate, blocklist: Arc<BlockList>) -> Self {
        Self {
            run_id,
            today,
            days_needed: None,
            max_results: DEFAULT_MAX_RESULTS,
            blocklist,
        }
    }

    pub fn with_days_needed(mut self, days_needed: Option<i64>) -> Self {
        self.days_needed = days_needed;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    /// Unknown ages pass.
    pub fn accepts_age(&self, age_days: Option<i64>) -> bool {
        match (self.days_needed, age_days) {
            (Some(limit), Some(age)) => age <= limit,
            _ => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("{0}")]
    Parse(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn category(&self) -> Category;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<FetchedPage>, AdapterError>;

    fn parse(&self, page: &FetchedPage, ctx: &AdapterContext)
        -> Result<Vec<Opportunity>, AdapterError>;
}

#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub pages: Vec<FetchedPage>,
    pub opportunities: Vec<Opportunity>,
}

/// Fetch then parse every page. The cap applies across pages.
pub async fn collect(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    ctx: &AdapterContext,
) -> Result<SourceBatch, AdapterError> {
    let pages = adapter.fetch(http, ctx).await?;
    let mut opportunities = Vec::new();
    for page in &pages {
        if opportunities.len() >= ctx.max_results {
            break;
        }
        let parsed = adapter.parse(page, ctx)?;
        debug!(
            source_id = adapter.source_id(),
            url = %page.url,
            parsed = parsed.len(),
            "parsed page"
        );
        opportunities.extend(parsed);
    }
    opportunities.truncate(ctx.max_results);
    Ok(SourceBatch {
        pages,
        opportunities,
    })
}

async fn fetch_pages(
    http: &HttpFetcher,
    ctx: &AdapterContext,
    source_id: &str,
    urls: &[String],
    headers: &[(&str, &str)],
) -> Result<Vec<FetchedPage>, AdapterError> {
    let mut pages = Vec::with_capacity(urls.len());
    for url in urls {
        let resp = http
            .fetch_bytes(ctx.run_id, source_id, url, headers)
            .await
            .map_err(|source| AdapterError::Fetch {
                url: url.clone(),
                source,
            })?;
        pages.push(FetchedPage {
            url: resp.final_url,
            content_type: resp.content_type,
            body: resp.body,
            fetched_at: Utc::now(),
        });
    }
    Ok(pages)
}

// ----------------- EXTRACTION HELPERS -----------------

/// Applies block-list, age filter and cap, in that order.
struct Extracted<'a> {
    ctx: &'a AdapterContext,
    category: Category,
    out: Vec<Opportunity>,
}

impl<'a> Extracted<'a> {
    fn new(ctx: &'a AdapterContext, category: Category) -> Self {
        Self {
            ctx,
            category,
            out: Vec::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.out.len() >= self.ctx.max_results
    }

    fn is_blocked(&self, employer: &str) -> bool {
        self.ctx.blocklist.is_blocked(employer)
    }

    fn offer(
        &mut self,
        employer: String,
        title: String,
        location: String,
        url: String,
        age_days: Option<i64>,
    ) {
        if self.is_full() || self.is_blocked(&employer) || !self.ctx.accepts_age(age_days) {
            return;
        }
        self.out
            .push(Opportunity::new(employer, title, location, url, self.category));
    }

    fn finish(self) -> Vec<Opportunity> {
        self.out
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(format!("invalid selector `{css}`: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn element_text(el: ElementRef<'_>, sep: &str) -> Option<String> {
    let parts: Vec<&str> = el
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    text_or_none(parts.join(sep))
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).next().and_then(|n| element_text(n, " "))
}

fn first_attr<'a>(scope: ElementRef<'a>, sel: &Selector, attr: &str) -> Option<&'a str> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

/// First run of ASCII digits in `text`, e.g. `30` in "30+ days ago".
fn first_integer(text: &str) -> Option<i64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

// ----------------- LINKEDIN -----------------

#[derive(Debug, Clone)]
pub struct LinkedInAdapter {
    source_id: String,
    category: Category,
    listing_urls: Vec<String>,
}

pub fn linkedin_adapter(
    source_id: impl Into<String>,
    category: Category,
    listing_urls: Vec<String>,
) -> LinkedInAdapter {
    LinkedInAdapter {
        source_id: source_id.into(),
        category,
        listing_urls,
    }
}

pub fn parse_linkedin_listing(
    html: &str,
    category: Category,
    ctx: &AdapterContext,
) -> Result<Vec<Opportunity>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = selector("div.job-search-card")?;
    let employer_sel = selector(".hidden-nested-link")?;
    let title_sel = selector(".base-search-card__title")?;
    let location_sel = selector(".job-search-card__location")?;
    let link_sel = selector("a.base-card__full-link")?;
    let date_sel = selector("time[datetime]")?;

    let mut extracted = Extracted::new(ctx, category);
    for card in document.select(&card_sel) {
        if extracted.is_full() {
            break;
        }
        let Some(employer) = first_text(card, &employer_sel) else {
            continue;
        };
        if extracted.is_blocked(&employer) {
            continue;
        }
        let (Some(title), Some(location), Some(href)) = (
            first_text(card, &title_sel),
            first_text(card, &location_sel),
            first_attr(card, &link_sel, "href"),
        ) else {
            debug!(%employer, "skipping incomplete job card");
            continue;
        };
        let age_days = first_attr(card, &date_sel, "datetime")
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
            .map(|posted| (ctx.today - posted).num_days());
        extracted.offer(
            employer,
            title,
            location,
            strip_query(href).to_string(),
            age_days,
        );
    }
    Ok(extracted.finish())
}

#[async_trait]
impl SourceAdapter for LinkedInAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn category(&self) -> Category {
        self.category
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        fetch_pages(http, ctx, &self.source_id, &self.listing_urls, &[]).await
    }

    fn parse(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<Opportunity>, AdapterError> {
        parse_linkedin_listing(&page.text(), self.category, ctx)
    }
}

// ----------------- GITHUB TABLE -----------------

#[derive(Debug, Clone)]
pub struct GithubTableAdapter {
    source_id: String,
    category: Category,
    listing_urls: Vec<String>,
}

pub fn github_table_adapter(
    source_id: impl Into<String>,
    category: Category,
    listing_urls: Vec<String>,
) -> GithubTableAdapter {
    GithubTableAdapter {
        source_id: source_id.into(),
        category,
        listing_urls,
    }
}

/// Rows are `employer | title | location | link | ...`. Posting age is not filtered here.
pub fn parse_github_table(
    html: &str,
    category: Category,
    ctx: &AdapterContext,
) -> Result<Vec<Opportunity>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a[href]")?;

    let mut extracted = Extracted::new(ctx, category);
    let mut previous_employer: Option<String> = None;
    for row in document.select(&row_sel) {
        if extracted.is_full() {
            break;
        }
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        if cells.len() < 4 {
            continue;
        }
        let employer = match element_text(cells[0], " ") {
            Some(name) if name == SAME_EMPLOYER_MARKER => previous_employer.clone(),
            other => other,
        };
        previous_employer = employer.clone();
        let Some(employer) = employer else {
            continue;
        };
        if extracted.is_blocked(&employer) {
            continue;
        }

        let link_cell = cells[3];
        if link_cell.text().any(|t| t.contains(CLOSED_POSTING_MARKER)) {
            continue;
        }
        let Some(href) = first_attr(link_cell, &link_sel, "href") else {
            continue;
        };
        let (Some(title), Some(location)) =
            (element_text(cells[1], " "), element_text(cells[2], ", "))
        else {
            continue;
        };
        extracted.offer(employer, title, location, href.to_string(), None);
    }
    Ok(extracted.finish())
}

#[async_trait]
impl SourceAdapter for GithubTableAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn category(&self) -> Category {
        self.category
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        fetch_pages(http, ctx, &self.source_id, &self.listing_urls, &[]).await
    }

    fn parse(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<Opportunity>, AdapterError> {
        parse_github_table(&page.text(), self.category, ctx)
    }
}

// ----------------- RAPIDAPI INDEED -----------------

#[derive(Debug, Clone)]
pub struct RapidApiCredentials {
    pub api_key: String,
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct RapidApiIndeedAdapter {
    source_id: String,
    category: Category,
    listing_urls: Vec<String>,
    credentials: RapidApiCredentials,
}

pub fn rapidapi_indeed_adapter(
    source_id: impl Into<String>,
    category: Category,
    listing_urls: Vec<String>,
    credentials: RapidApiCredentials,
) -> RapidApiIndeedAdapter {
    RapidApiIndeedAdapter {
        source_id: source_id.into(),
        category,
        listing_urls,
        credentials,
    }
}

#[derive(Debug, Deserialize)]
struct IndeedSearch {
    #[serde(default)]
    hits: Vec<IndeedHit>,
}

#[derive(Debug, Deserialize)]
struct IndeedHit {
    id: String,
    #[serde(default)]
    company_name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    formatted_relative_time: Option<String>,
}

pub fn indeed_view_url(job_id: &str) -> String {
    format!("https://www.indeed.com/viewjob?jk={job_id}&locality=us")
}

pub fn parse_indeed_hits(
    json: &str,
    category: Category,
    ctx: &AdapterContext,
) -> Result<Vec<Opportunity>, AdapterError> {
    let search: IndeedSearch = serde_json::from_str(json)
        .map_err(|e| AdapterError::Parse(format!("invalid indeed search response: {e}")))?;

    let mut extracted = Extracted::new(ctx, category);
    for hit in search.hits {
        if extracted.is_full() {
            break;
        }
        let (Some(employer), Some(title), Some(location)) = (
            text_or_none(hit.company_name),
            text_or_none(hit.title),
            text_or_none(hit.location),
        ) else {
            continue;
        };
        let age_days = hit
            .formatted_relative_time
            .as_deref()
            .and_then(first_integer)
            .unwrap_or(0);
        extracted.offer(
            employer,
            title,
            location,
            indeed_view_url(hit.id.trim()),
            Some(age_days),
        );
    }
    Ok(extracted.finish())
}

#[async_trait]
impl SourceAdapter for RapidApiIndeedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn category(&self) -> Category {
        self.category
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let headers = [
            ("X-RapidAPI-Key", self.credentials.api_key.as_str()),
            ("X-RapidAPI-Host", self.credentials.host.as_str()),
        ];
        fetch_pages(http, ctx, &self.source_id, &self.listing_urls, &headers).await
    }

    fn parse(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<Opportunity>, AdapterError> {
        parse_indeed_hits(&page.text(), self.category, ctx)
    }
}

// ----------------- FACTORY -----------------

/// Build the adapter for a configured source. RapidAPI sources need credentials.
pub fn adapter_for_kind(
    kind: SourceKind,
    source_id: &str,
    category: Category,
    listing_urls: Vec<String>,
    rapidapi: Option<RapidApiCredentials>,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    if listing_urls.is_empty() {
        warn!(source_id, "source has no listing urls");
    }
    Ok(match kind {
        SourceKind::Linkedin => Box::new(linkedin_adapter(source_id, category, listing_urls)),
        SourceKind::GithubTable => {
            Box::new(github_table_adapter(source_id, category, listing_urls))
        }
        SourceKind::RapidapiIndeed => {
            let credentials = rapidapi.ok_or_else(|| {
                anyhow::anyhow!("source {source_id} needs RapidAPI credentials")
            })?;
            Box::new(rapidapi_indeed_adapter(
                source_id,
                category,
                listing_urls,
                credentials,
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AdapterContext {
        AdapterContext::new(
            Uuid::nil(),
            NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            Arc::new(BlockList::default()),
        )
    }

    fn card(employer: &str, title: &str, href: &str, posted: &str) -> String {
        format!(
            r#"<div class="base-card job-search-card">
                 <a class="base-card__full-link" href="{href}"></a>
                 <h3 class="base-search-card__title">{title}</h3>
                 <a class="hidden-nested-link">{employer}</a>
                 <span class="job-search-card__location">Remote</span>
                 <time datetime="{posted}"></time>
               </div>"#
        )
    }

    #[test]
    fn linkedin_strips_tracking_query_from_urls() {
        let html = card("Acme", "SWE", "https://www.linkedin.com/jobs/view/1?refId=x&trk=y", "2026-10-19");
        let out = parse_linkedin_listing(&html, Category::FullTime, &ctx()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].url, "https://www.linkedin.com/jobs/view/1");
        assert_eq!(out[0].category, Category::FullTime);
        assert!(!out[0].processed);
    }

    #[test]
    fn cap_limits_output_per_page() {
        let html: String = (0..20)
            .map(|n| card(&format!("Employer {n}"), "SWE", "https://x.example/1", "2026-10-19"))
            .collect();
        let out = parse_linkedin_listing(&html, Category::FullTime, &ctx()).unwrap();
        assert_eq!(out.len(), DEFAULT_MAX_RESULTS);
        assert_eq!(out[0].employer, "Employer 0");
        assert_eq!(out[14].employer, "Employer 14");
    }

    #[test]
    fn age_filter_is_inclusive() {
        let html = [
            card("Fresh", "SWE", "https://x.example/1", "2026-10-16"),
            card("Stale", "SWE", "https://x.example/2", "2026-10-15"),
        ]
        .concat();
        let out = parse_linkedin_listing(
            &html,
            Category::FullTime,
            &ctx().with_days_needed(Some(3)),
        )
        .unwrap();
        let employers: Vec<&str> = out.iter().map(|o| o.employer.as_str()).collect();
        assert_eq!(employers, vec!["Fresh"]);
    }

    #[test]
    fn extra_blocklist_entries_are_honoured() {
        let html = card("Spam Corp", "SWE", "https://x.example/1", "2026-10-19");
        let mut ctx = ctx();
        ctx.blocklist = Arc::new(BlockList::with_extra(["Spam Corp"]));
        assert!(parse_linkedin_listing(&html, Category::FullTime, &ctx)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn first_integer_reads_leading_day_counts() {
        assert_eq!(first_integer("30+ days ago"), Some(30));
        assert_eq!(first_integer("Posted 2 days ago"), Some(2));
        assert_eq!(first_integer("Today"), None);
    }

    #[test]
    fn indeed_rejects_malformed_json() {
        let err = parse_indeed_hits("{not json", Category::FullTime, &ctx()).unwrap_err();
        assert!(matches!(err, AdapterError::Parse(_)));
    }

    #[test]
    fn factory_requires_rapidapi_credentials() {
        let urls = vec!["https://indeed12.p.rapidapi.com/jobs/search?query=swe".to_string()];
        assert!(adapter_for_kind(
            SourceKind::RapidapiIndeed,
            "rapidapi-indeed",
            Category::FullTime,
            urls.clone(),
            None
        )
        .is_err());

        let adapter = adapter_for_kind(
            SourceKind::RapidapiIndeed,
            "rapidapi-indeed",
            Category::FullTime,
            urls,
            Some(RapidApiCredentials {
                api_key: "key".into(),
                host: DEFAULT_RAPIDAPI_HOST.into(),
            }),
        )
        .unwrap();
        assert_eq!(adapter.source_id(), "rapidapi-indeed");
        assert_eq!(adapter.category(), Category::FullTime);
    }

    #[test]
    fn source_kind_uses_snake_case() {
        let kind: SourceKind = serde_json::from_str("\"github_table\"").unwrap();
        assert_eq!(kind, SourceKind::GithubTable);
    }
}
