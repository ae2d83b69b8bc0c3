//! Core domain model for QJR: scraped listings, enriched records, and
//! the identity types the dedup pass filters on.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "qjr-core";

/// Work arrangement inferred from the listing-card text. Defaults to
/// on-site when neither remote nor hybrid markers appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Remote,
    Hybrid,
    #[default]
    OnSite,
}

/// Relevance tier derived from the numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// score >= 80 is High, >= 60 Medium, anything below Low.
    pub fn from_score(score: u8) -> Self {
        if score >= 80 {
            Priority::High
        } else if score >= 60 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

/// One listing as pulled off a search-results card. `url` is the natural
/// identity but may be empty when the markup is blocked or malformed; a
/// listing with an empty title or url never leaves the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    pub source: String,
    pub scraped_at: DateTime<Utc>,
    pub posted_time: Option<String>,
    pub application_status: Option<String>,
    pub job_type: JobType,
}

/// Job-criteria block from a detail page, classified by label token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobCriteria {
    pub employment_type: Option<String>,
    pub job_function: Option<String>,
    pub industries: Option<String>,
    pub seniority_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompanyInfo {
    pub name: Option<String>,
    pub industry: Option<String>,
}

/// Everything pulled from a listing's detail page. A failed detail fetch
/// yields the default (all-empty) value rather than an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListingDetail {
    pub description: String,
    pub criteria: JobCriteria,
    pub company_info: CompanyInfo,
}

/// A listing that survived dedup, enriched with derived fields and ready
/// for the sink. Immutable once built; ownership passes on ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    pub source: String,
    pub scraped_at: DateTime<Utc>,
    pub posted_time: Option<String>,
    pub application_status: Option<String>,
    pub job_type: JobType,
    pub description: String,
    pub criteria: JobCriteria,
    pub company_info: CompanyInfo,
    pub summary: String,
    pub category: String,
    pub score: u8,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub requirements: String,
    pub benefits: String,
    pub date_added: DateTime<Utc>,
    pub status: String,
}

impl EnrichedRecord {
    pub fn composite_key(&self) -> String {
        composite_key(&self.company, &self.title, &self.location)
    }
}

/// Secondary dedup identity: URLs drift while the same posting reappears,
/// so `company-title-location` (lowercased, trimmed) backs them up.
pub fn composite_key(company: &str, title: &str, location: &str) -> String {
    format!(
        "{}-{}-{}",
        company.trim().to_lowercase(),
        title.trim().to_lowercase(),
        location.trim().to_lowercase()
    )
}

/// Known-identity snapshot pulled from the sink at cycle start. Not
/// refreshed mid-cycle; the ingestion loop extends it as records land.
#[derive(Debug, Clone, Default)]
pub struct KnownRecords {
    pub urls: HashSet<String>,
    pub composite_keys: HashSet<String>,
}

impl KnownRecords {
    /// OR semantics: either identity matching suppresses the listing.
    pub fn matches(&self, listing: &RawListing) -> bool {
        self.urls.contains(&listing.url)
            || self.composite_keys.contains(&composite_key(
                &listing.company,
                &listing.title,
                &listing.location,
            ))
    }

    pub fn insert(&mut self, url: &str, key: &str) {
        self.urls.insert(url.to_string());
        self.composite_keys.insert(key.to_string());
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.composite_keys.is_empty()
    }
}

/// Outcome counters for one collection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub total_scraped: usize,
    pub new_listings: usize,
    pub processed: usize,
    pub errors: usize,
    pub finished_at: DateTime<Utc>,
}
