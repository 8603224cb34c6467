//! Core domain model for the opportunity digest bot.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "oppbot-core";

/// Employers excluded from ingestion regardless of what they post.
pub const DEFAULT_BLOCKLISTED_EMPLOYERS: &[&str] = &[
    "Pattern Learning AI - Career & Tech Recruitment Reimagined!",
    "Patterned Learning AI - Tech Recruitment & Staffing",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    FullTime,
    Internship,
    Conference,
    Scholarship,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::FullTime,
        Category::Internship,
        Category::Conference,
        Category::Scholarship,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::FullTime => "full_time",
            Category::Internship => "internship",
            Category::Conference => "conference",
            Category::Scholarship => "scholarship",
        }
    }

    pub fn heading(self) -> &'static str {
        match self {
            Category::FullTime => "JOB OPPORTUNITIES",
            Category::Internship => "INTERNSHIP OPPORTUNITIES",
            Category::Conference => "CONFERENCE OPPORTUNITIES",
            Category::Scholarship => "SCHOLARSHIP OPPORTUNITIES",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown opportunity category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub employer: String,
    pub title: String,
    pub location: String,
    pub url: String,
    #[serde(default)]
    pub processed: bool,
    pub category: Category,
}

impl Opportunity {
    pub fn new(
        employer: impl Into<String>,
        title: impl Into<String>,
        location: impl Into<String>,
        url: impl Into<String>,
        category: Category,
    ) -> Self {
        Self {
            employer: employer.into(),
            title: title.into(),
            location: location.into(),
            url: url.into(),
            processed: false,
            category,
        }
    }

    pub fn identity(&self) -> IdentityKey<'_> {
        IdentityKey {
            employer: &self.employer,
            title: &self.title,
            location: &self.location,
            category: self.category,
        }
    }

    pub fn same_identity(&self, other: &Opportunity) -> bool {
        self.identity() == other.identity()
    }
}

/// Deduplication key. URL and the processed flag are not part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityKey<'a> {
    pub employer: &'a str,
    pub title: &'a str,
    pub location: &'a str,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOpportunity {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub opportunity: Opportunity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockList {
    employers: BTreeSet<String>,
}

impl Default for BlockList {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKLISTED_EMPLOYERS.iter().copied())
    }
}

impl BlockList {
    pub fn new<I, S>(employers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            employers: employers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::default();
        list.employers.extend(extra.into_iter().map(Into::into));
        list
    }

    /// Exact match, no normalization.
    pub fn is_blocked(&self, employer: &str) -> bool {
        self.employers.contains(employer)
    }

    pub fn len(&self) -> usize {
        self.employers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.employers.is_empty()
    }
}

/// Concatenate candidate lists in argument order. Dedup happens at ingestion.
pub fn merge_opportunities<I>(lists: I) -> Vec<Opportunity>
where
    I: IntoIterator<Item = Vec<Opportunity>>,
{
    let mut merged = Vec::new();
    for list in lists {
        merged.extend(list);
    }
    merged
}
