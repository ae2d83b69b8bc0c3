//! Listing-card and detail-page extraction for QJR.
//!
//! The target site ships non-semantic, frequently shuffled markup, so every
//! field is resolved through an ordered selector-fallback chain (most
//! specific markup class first, bare tags last) with full-text heuristics
//! as the last resort. A malformed card degrades to "invalid" and is
//! dropped; nothing in here halts a batch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use qjr_core::{CompanyInfo, JobCriteria, JobType, ListingDetail, RawListing};
use qjr_storage::PageFetcher;
use scraper::{ElementRef, Html, Selector};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "qjr-scrape";

pub const SOURCE_ID: &str = "linkedin";
const SITE_ORIGIN: &str = "https://www.linkedin.com";

/// One listing card inside the search-results page.
const CARD_SELECTOR: &str = ".job-search-card";

/// Priority-ordered chains. Order is deliberate: the first entries are the
/// current, most reliable markup classes; the tail entries are older or
/// generic shapes the site falls back to.
const TITLE_SELECTORS: [&str; 9] = [
    ".base-search-card__title a",
    ".base-search-card__title",
    ".job-search-card__title",
    "h3",
    ".job-card-list__title",
    ".job-card-container__job-title",
    ".job-card-list__title-text",
    "[data-test-id=\"job-title\"]",
    ".artdeco-entity-lockup__title",
];

const COMPANY_SELECTORS: [&str; 8] = [
    ".base-search-card__subtitle a",
    ".base-search-card__subtitle",
    ".job-search-card__company-name",
    ".job-card-container__company-name",
    ".job-card-list__company-name",
    ".artdeco-entity-lockup__subtitle",
    ".job-card-container__primary-description",
    ".job-card-list__company-name-text",
];

const LOCATION_SELECTORS: [&str; 6] = [
    ".job-search-card__location",
    ".base-search-card__metadata",
    ".job-card-container__metadata-item",
    ".job-card-list__metadata",
    ".artdeco-entity-lockup__caption",
    ".job-card-container__secondary-description",
];

const URL_SELECTORS: [&str; 6] = [
    ".base-card__full-link",
    ".base-search-card__title a",
    "a[href*=\"/jobs/view/\"]",
    "a[data-test-id=\"job-title\"]",
    ".job-card-list__title a",
    ".artdeco-entity-lockup__title a",
];

const DESCRIPTION_SELECTORS: [&str; 9] = [
    ".jobs-box__html-content .jobs-description-content__text",
    ".jobs-description-content__text",
    ".jobs-box__html-content",
    ".jobs-description__content",
    ".jobs-description-content__text div",
    ".description__text",
    "[data-job-description-container]",
    ".jobs-box-list-container",
    ".jobs-box__html-content div",
];

const CRITERIA_SELECTORS: [&str; 3] = [
    ".jobs-unified-top-card__job-insight",
    ".jobs-box__group",
    ".jobs-unified-top-card__job-insight-view-model",
];

const COMPANY_NAME_SELECTORS: [&str; 3] = [
    ".jobs-unified-top-card__company-name",
    ".jobs-unified-top-card__subtitle-primary",
    ".jobs-company__box .jobs-company__name",
];

const COMPANY_INDUSTRY_SELECTORS: [&str; 2] = [
    ".jobs-unified-top-card__subtitle-secondary",
    ".jobs-company__box .jobs-company__industry",
];

/// Words that mark a text line as temporal/activity metadata rather than a
/// company name.
const COMPANY_REJECT_MARKERS: [&str; 6] = ["ago", "applicant", "hour", "day", "week", "month"];

const POSTED_TIME_MARKERS: [&str; 4] = ["ago", "week", "day", "hour"];
const APPLICATION_MARKERS: [&str; 3] = ["applicant", "Actively Hiring", "early applicant"];
const REGION_MARKERS: [&str; 6] = ["Taiwan", "Taipei", "Remote", "City", "County", "District"];

/// Collapse whitespace runs to single spaces and trim the ends.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_selector(raw: &str) -> Option<Selector> {
    // The chains are static and known-good; an unparseable entry is skipped
    // rather than failing the card.
    Selector::parse(raw).ok()
}

/// Walk the chain; the first selector yielding non-empty trimmed text wins.
fn first_chain_text(scope: ElementRef<'_>, selectors: &[&str]) -> Option<String> {
    first_chain_text_where(scope, selectors, |_| true)
}

fn first_chain_text_where(
    scope: ElementRef<'_>,
    selectors: &[&str],
    accept: impl Fn(&str) -> bool,
) -> Option<String> {
    for raw in selectors {
        let Some(sel) = parse_selector(raw) else {
            continue;
        };
        if let Some(el) = scope.select(&sel).next() {
            let text = normalize_text(&el.text().collect::<String>());
            if !text.is_empty() && accept(&text) {
                return Some(text);
            }
        }
    }
    None
}

fn first_chain_href(scope: ElementRef<'_>, selectors: &[&str]) -> Option<String> {
    for raw in selectors {
        let Some(sel) = parse_selector(raw) else {
            continue;
        };
        if let Some(el) = scope.select(&sel).next() {
            if let Some(href) = el.value().attr("href") {
                let href = href.trim();
                if !href.is_empty() {
                    return Some(href.to_string());
                }
            }
        }
    }
    None
}

/// Visible text of an element split into trimmed, non-empty lines. The
/// heuristic fallbacks key off line positions in this sequence.
fn text_lines(scope: ElementRef<'_>) -> Vec<String> {
    scope
        .text()
        .collect::<String>()
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn plausible_company(line: &str) -> bool {
    let length = line.chars().count();
    length > 2 && length < 100 && !COMPANY_REJECT_MARKERS.iter().any(|m| line.contains(m))
}

fn extract_company(card: ElementRef<'_>, lines: &[String]) -> String {
    if let Some(company) = first_chain_text(card, &COMPANY_SELECTORS) {
        return company;
    }

    // Company is usually the line right after the title; the line after
    // that when a badge sneaks in between.
    for index in [1, 2] {
        if let Some(line) = lines.get(index) {
            if plausible_company(line) {
                return line.clone();
            }
        }
    }

    warn!("could not extract company name from listing card");
    "Unknown Company".to_string()
}

fn extract_location(card: ElementRef<'_>, lines: &[String]) -> String {
    // "ago" in a location slot means the site shifted the posted-time badge
    // into the metadata block; keep walking the chain.
    if let Some(location) =
        first_chain_text_where(card, &LOCATION_SELECTORS, |text| !text.contains("ago"))
    {
        return location;
    }

    for line in lines {
        if REGION_MARKERS.iter().any(|m| line.contains(m)) {
            return line.clone();
        }
    }

    String::new()
}

fn extract_url(card: ElementRef<'_>) -> String {
    match first_chain_href(card, &URL_SELECTORS) {
        Some(href) if href.starts_with('/') => format!("{SITE_ORIGIN}{href}"),
        Some(href) => href,
        None => String::new(),
    }
}

fn job_type_of(full_text: &str) -> JobType {
    let lower = full_text.to_lowercase();
    if lower.contains("remote") {
        JobType::Remote
    } else if lower.contains("hybrid") {
        JobType::Hybrid
    } else {
        JobType::OnSite
    }
}

/// Extract one listing from a search-results card. Returns `None` when the
/// card is invalid (empty title or url) so the collector can drop it.
pub fn extract_listing(card: ElementRef<'_>, scraped_at: DateTime<Utc>) -> Option<RawListing> {
    let lines = text_lines(card);
    let full_text: String = card.text().collect();

    let title = first_chain_text(card, &TITLE_SELECTORS).unwrap_or_default();
    let company = extract_company(card, &lines);
    let location = extract_location(card, &lines);
    let url = extract_url(card);

    // A single line may legitimately carry both marker vocabularies
    // ("2 days ago · 50 applicants"); both fields then hold that line.
    let posted_time = lines
        .iter()
        .find(|line| POSTED_TIME_MARKERS.iter().any(|m| line.contains(m)))
        .cloned();
    let application_status = lines
        .iter()
        .find(|line| APPLICATION_MARKERS.iter().any(|m| line.contains(m)))
        .cloned();

    if title.is_empty() || url.is_empty() {
        return None;
    }

    Some(RawListing {
        title,
        company,
        location,
        url,
        source: SOURCE_ID.to_string(),
        scraped_at,
        posted_time,
        application_status,
        job_type: job_type_of(&full_text),
    })
}

/// Extract every valid listing from a search-results page, in document
/// order.
pub fn extract_search_page(html: &str, scraped_at: DateTime<Utc>) -> Vec<RawListing> {
    let document = Html::parse_document(html);
    let Some(card_sel) = parse_selector(CARD_SELECTOR) else {
        return Vec::new();
    };

    let mut listings = Vec::new();
    let mut cards = 0usize;
    for card in document.select(&card_sel) {
        cards += 1;
        if let Some(listing) = extract_listing(card, scraped_at) {
            listings.push(listing);
        } else {
            warn!(card_index = cards - 1, "dropping invalid listing card");
        }
    }
    info!(cards, kept = listings.len(), "extracted search-results page");
    listings
}

fn classify_criteria(document: &Html, criteria: &mut JobCriteria) {
    for raw in CRITERIA_SELECTORS {
        let Some(sel) = parse_selector(raw) else {
            continue;
        };
        for el in document.select(&sel) {
            let text = normalize_text(&el.text().collect::<String>());
            if text.is_empty() {
                continue;
            }
            // Later matches for the same key overwrite earlier ones.
            if text.contains("Employment type") {
                criteria.employment_type = Some(text);
            } else if text.contains("Job function") {
                criteria.job_function = Some(text);
            } else if text.contains("Industries") {
                criteria.industries = Some(text);
            } else if text.contains("Seniority level") {
                criteria.seniority_level = Some(text);
            }
        }
    }
}

/// Extract description, criteria, and company info from a detail page.
/// Missing sections come back empty; this never fails on odd markup.
pub fn extract_detail(html: &str) -> ListingDetail {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let description = first_chain_text(root, &DESCRIPTION_SELECTORS).unwrap_or_default();

    let mut criteria = JobCriteria::default();
    classify_criteria(&document, &mut criteria);

    // First match wins for both name and industry; one consistent policy
    // across the whole company-info block.
    let company_info = CompanyInfo {
        name: first_chain_text(root, &COMPANY_NAME_SELECTORS),
        industry: first_chain_text(root, &COMPANY_INDUSTRY_SELECTORS),
    };

    ListingDetail {
        description,
        criteria,
        company_info,
    }
}

/// Fetch-and-extract front end over a [`PageFetcher`].
pub struct JobScraper {
    fetcher: Arc<dyn PageFetcher>,
}

impl JobScraper {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self { fetcher }
    }

    /// Fetch one search-results page and return its valid listings. A
    /// failed fetch is reported and yields an empty sequence; the caller's
    /// cycle proceeds with zero scraped listings instead of aborting.
    pub async fn collect_listings(&self, search_url: &str) -> Vec<RawListing> {
        let body = match self.fetcher.fetch_page(search_url).await {
            Ok(body) => body,
            Err(err) => {
                error!(search_url, %err, "search page fetch failed");
                return Vec::new();
            }
        };
        extract_search_page(&body, Utc::now())
    }

    /// Fetch a listing's detail page. Failure degrades to an all-empty
    /// detail so the listing stays enrichable.
    pub async fn fetch_detail(&self, url: &str) -> ListingDetail {
        match self.fetcher.fetch_page(url).await {
            Ok(body) => extract_detail(&body),
            Err(err) => {
                warn!(url, %err, "detail fetch failed, continuing with empty detail");
                ListingDetail::default()
            }
        }
    }
}
