//! Digest formatting and delivery.

use async_trait::async_trait;
use chrono::NaiveDate;
use oppbot_core::{Category, Opportunity, StoredOpportunity};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const DIGEST_HEADLINE: &str = "# ✨ NEW OPPORTUNITY POSTINGS BELOW! ✨";
pub const SECTION_COLOR: u32 = 0x05A3FF;
const DATE_COLOR: u32 = 0xFFFFFF;
pub const MAX_EMBED_DESCRIPTION: usize = 4096;
/// Discord's cap on the summed titles and descriptions of one message's embeds.
pub const MAX_EMBED_TOTAL: usize = 6000;

fn render_line(template: &str, opp: &Opportunity) -> String {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open..];
        let Some(close) = after.find('}') else {
            rest = after;
            break;
        };
        let value = match &after[1..close] {
            "employer" => Some(opp.employer.as_str()),
            "title" => Some(opp.title.as_str()),
            "location" => Some(opp.location.as_str()),
            "url" => Some(opp.url.as_str()),
            _ => None,
        };
        match value {
            Some(v) => out.push_str(v),
            None => out.push_str(&after[..=close]),
        }
        rest = &after[close + 1..];
    }
    // `rest` is either the tail after the last placeholder or starts at an unclosed `{`
    out.push_str(rest);
    out
}

/// One line per record, input order, each ending in `\n`.
pub fn format_opportunities<'a, I>(records: I, template: &str) -> String
where
    I: IntoIterator<Item = &'a Opportunity>,
{
    let mut out = String::new();
    for opp in records {
        out.push_str(&render_line(template, opp));
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestEntry {
    pub record: StoredOpportunity,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestSection {
    pub category: Category,
    pub entries: Vec<DigestEntry>,
}

impl DigestSection {
    pub fn body(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.line);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Digest {
    pub date: NaiveDate,
    pub sections: Vec<DigestSection>,
}

impl Digest {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            sections: Vec::new(),
        }
    }

    /// Empty batches are dropped.
    pub fn push_section(
        &mut self,
        category: Category,
        records: Vec<StoredOpportunity>,
        template: &str,
    ) {
        if records.is_empty() {
            return;
        }
        let entries = records
            .into_iter()
            .map(|record| {
                let line = render_line(template, &record.opportunity);
                DigestEntry { record, line }
            })
            .collect();
        self.sections.push(DigestSection { category, entries });
    }

    pub fn records(&self) -> impl Iterator<Item = &StoredOpportunity> {
        self.sections
            .iter()
            .flat_map(|s| s.entries.iter().map(|e| &e.record))
    }

    pub fn len(&self) -> usize {
        self.sections.iter().map(|s| s.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    Rejected { status: u16 },
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Trims the digest to what one message can carry. Only records left in the
    /// returned digest are dispatched and marked processed.
    fn fit(&self, digest: Digest) -> Digest {
        digest
    }

    async fn dispatch(&self, digest: &Digest) -> Result<DispatchOutcome, NotifyError>;
}

// ----------------- DISCORD -----------------

#[derive(Debug, Serialize)]
pub struct WebhookPayload {
    content: &'static str,
    tts: bool,
    embeds: Vec<Embed>,
}

#[derive(Debug, Serialize)]
struct Embed {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    color: u32,
}

fn date_title(date: NaiveDate) -> String {
    format!("✧･ﾟ: *✧･ﾟ:* 🎀 {date} 🎀 ✧･ﾟ: *✧･ﾟ:*｡")
}

fn section_title(category: Category) -> String {
    format!("¸„.-•~¹°”ˆ˜¨ {} ¨˜ˆ”°¹~•-.„¸", category.heading())
}

/// Keeps whole lines, in order, while each description stays within
/// [`MAX_EMBED_DESCRIPTION`] and the message within [`MAX_EMBED_TOTAL`].
pub fn fit_discord(mut digest: Digest) -> Digest {
    let mut remaining = MAX_EMBED_TOTAL.saturating_sub(date_title(digest.date).chars().count());
    for section in &mut digest.sections {
        let title = section_title(section.category).chars().count();
        let budget = remaining.saturating_sub(title).min(MAX_EMBED_DESCRIPTION);
        let mut used = 0;
        let keep = section
            .entries
            .iter()
            .take_while(|entry| {
                let len = entry.line.chars().count() + 1;
                if used + len > budget {
                    return false;
                }
                used += len;
                true
            })
            .count();
        if keep < section.entries.len() {
            warn!(
                category = %section.category,
                kept = keep,
                held_back = section.entries.len() - keep,
                "section over discord limits; the rest stays for the next run"
            );
            section.entries.truncate(keep);
        }
        if keep > 0 {
            remaining -= title + used;
        }
    }
    digest.sections.retain(|s| !s.entries.is_empty());
    digest
}

pub fn discord_payload(digest: &Digest) -> WebhookPayload {
    let mut embeds = vec![Embed {
        title: date_title(digest.date),
        description: None,
        color: DATE_COLOR,
    }];
    for section in &digest.sections {
        embeds.push(Embed {
            title: section_title(section.category),
            description: Some(section.body()),
            color: SECTION_COLOR,
        });
    }
    WebhookPayload {
        content: DIGEST_HEADLINE,
        tts: false,
        embeds,
    }
}

#[derive(Debug, Clone)]
pub struct DiscordWebhook {
    client: reqwest::Client,
    url: String,
}

impl DiscordWebhook {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for DiscordWebhook {
    fn fit(&self, digest: Digest) -> Digest {
        fit_discord(digest)
    }

    async fn dispatch(&self, digest: &Digest) -> Result<DispatchOutcome, NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&discord_payload(digest))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            info!(sections = digest.sections.len(), "digest delivered");
            Ok(DispatchOutcome::Delivered)
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, error = %body, "webhook rejected digest");
            Ok(DispatchOutcome::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

/// Dry-run notifier: writes the digest to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn dispatch(&self, digest: &Digest) -> Result<DispatchOutcome, NotifyError> {
        for section in &digest.sections {
            info!(
                date = %digest.date,
                category = %section.category,
                "{}\n{}",
                section.category.heading(),
                section.body()
            );
        }
        Ok(DispatchOutcome::Delivered)
    }
}
