//! Enrichment engine: derives summary, category, score, priority, tags,
//! and requirement/benefit excerpts for listings that survived dedup.
//!
//! All keyword tables live in `rules/*.yaml` at the workspace root so the
//! weights can be tuned without touching code. The functions here are pure
//! over (title, description, company, posted_time, location).

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use qjr_core::{EnrichedRecord, ListingDetail, Priority, RawListing};
use serde::Deserialize;

pub const CRATE_NAME: &str = "qjr-enrich";

const DEFAULT_CATEGORY: &str = "Other";
const EXCERPT_CHAR_BUDGET: usize = 500;
const MIN_SENTENCE_CHARS: usize = 10;

const REQUIREMENT_MARKERS: [&str; 5] =
    ["require", "qualification", "must have", "essential", "mandatory"];
const BENEFIT_MARKERS: [&str; 5] = ["benefit", "offer", "package", "compensation", "perk"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
    Title,
    Description,
    Company,
    PostedTime,
    Location,
}

/// A single substring test against one listing field. Needles and field
/// text are both lowercased before matching.
#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    pub field: RuleField,
    pub contains: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreRule {
    pub weight: i32,
    #[serde(default)]
    pub any: Vec<Condition>,
    #[serde(default)]
    pub all: Vec<Condition>,
    #[serde(default)]
    pub none: Vec<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRule {
    pub name: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagRule {
    pub tag: String,
    pub any: Vec<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    categories: Vec<CategoryRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScoreRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<ScoreRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<TagRule>,
}

#[derive(Debug, Clone)]
pub struct EnrichmentRules {
    pub categories: Vec<CategoryRule>,
    pub score_rules: Vec<ScoreRule>,
    pub tag_rules: Vec<TagRule>,
}

impl EnrichmentRules {
    /// Load `categories.yaml`, `score.yaml`, and `tags.yaml` from a rules
    /// directory.
    pub fn from_rules_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let categories: CategoryRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(dir.join("categories.yaml"))
                .context("reading categories.yaml")?,
        )
        .context("parsing categories.yaml")?;
        let score: ScoreRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(dir.join("score.yaml")).context("reading score.yaml")?,
        )
        .context("parsing score.yaml")?;
        let tags: TagRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(dir.join("tags.yaml")).context("reading tags.yaml")?,
        )
        .context("parsing tags.yaml")?;
        Ok(Self {
            categories: categories.categories,
            score_rules: score.rules,
            tag_rules: tags.rules,
        })
    }
}

/// Summary shape: how many leading sentences to keep and the character
/// budget the joined result is truncated to. Both 2/200 and 3/300 are
/// supported configurations.
#[derive(Debug, Clone, Copy)]
pub struct EnrichConfig {
    pub summary_sentences: usize,
    pub summary_char_budget: usize,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            summary_sentences: 2,
            summary_char_budget: 200,
        }
    }
}

/// Lowercased field texts a rule evaluates against.
struct FieldText {
    title: String,
    description: String,
    company: String,
    posted_time: String,
    location: String,
}

impl FieldText {
    fn new(title: &str, description: &str, company: &str, posted_time: &str, location: &str) -> Self {
        Self {
            title: title.to_lowercase(),
            description: description.to_lowercase(),
            company: company.to_lowercase(),
            posted_time: posted_time.to_lowercase(),
            location: location.to_lowercase(),
        }
    }

    fn get(&self, field: RuleField) -> &str {
        match field {
            RuleField::Title => &self.title,
            RuleField::Description => &self.description,
            RuleField::Company => &self.company,
            RuleField::PostedTime => &self.posted_time,
            RuleField::Location => &self.location,
        }
    }
}

impl Condition {
    fn matches(&self, text: &FieldText) -> bool {
        text.get(self.field).contains(&self.contains.to_lowercase())
    }
}

fn score_rule_matches(rule: &ScoreRule, text: &FieldText) -> bool {
    let any_ok = rule.any.is_empty() || rule.any.iter().any(|c| c.matches(text));
    let all_ok = rule.all.iter().all(|c| c.matches(text));
    let none_ok = !rule.none.iter().any(|c| c.matches(text));
    any_ok && all_ok && none_ok
}

fn truncate_chars(text: &str, budget: usize) -> (String, bool) {
    if text.chars().count() > budget {
        (text.chars().take(budget).collect(), true)
    } else {
        (text.to_string(), false)
    }
}

pub struct EnrichmentEngine {
    rules: EnrichmentRules,
    config: EnrichConfig,
}

impl EnrichmentEngine {
    pub fn new(rules: EnrichmentRules, config: EnrichConfig) -> Self {
        Self { rules, config }
    }

    pub fn from_rules_dir(dir: impl AsRef<Path>, config: EnrichConfig) -> Result<Self> {
        Ok(Self::new(EnrichmentRules::from_rules_dir(dir)?, config))
    }

    /// First N sentences (fragments longer than 10 chars), joined with
    /// ". " and truncated to the character budget with an ellipsis marker.
    pub fn summarize(&self, description: &str) -> String {
        if description.is_empty() {
            return String::new();
        }
        let key_points = description
            .split(['.', '!', '?'])
            .map(str::trim)
            .filter(|s| s.chars().count() > MIN_SENTENCE_CHARS)
            .take(self.config.summary_sentences)
            .collect::<Vec<_>>()
            .join(". ");

        let (truncated, was_cut) = truncate_chars(&key_points, self.config.summary_char_budget);
        if was_cut {
            format!("{truncated}...")
        } else {
            truncated
        }
    }

    /// First category (table order) with any keyword hit; table order is
    /// the priority order, not best-match.
    pub fn categorize(&self, title: &str, description: &str) -> String {
        let text = format!("{title} {description}").to_lowercase();
        for rule in &self.rules.categories {
            if rule
                .keywords
                .iter()
                .any(|keyword| text.contains(&keyword.to_lowercase()))
            {
                return rule.name.clone();
            }
        }
        DEFAULT_CATEGORY.to_string()
    }

    /// Weighted additive relevance score, clamped to [0, 100]. Every
    /// matching rule contributes; none short-circuits another.
    pub fn score(&self, title: &str, description: &str, company: &str, posted_time: &str) -> u8 {
        let text = FieldText::new(title, description, company, posted_time, "");
        let total: i32 = self
            .rules
            .score_rules
            .iter()
            .filter(|rule| score_rule_matches(rule, &text))
            .map(|rule| rule.weight)
            .sum();
        total.clamp(0, 100) as u8
    }

    /// Ordered tag list; rule order is output order and each rule fires at
    /// most once, so duplicates are impossible.
    pub fn tags(&self, title: &str, description: &str, location: &str) -> Vec<String> {
        let text = FieldText::new(title, description, "", "", location);
        self.rules
            .tag_rules
            .iter()
            .filter(|rule| rule.any.iter().any(|c| c.matches(&text)))
            .map(|rule| rule.tag.clone())
            .collect()
    }

    pub fn requirements_excerpt(&self, description: &str) -> String {
        excerpt_lines(description, &REQUIREMENT_MARKERS)
    }

    pub fn benefits_excerpt(&self, description: &str) -> String {
        excerpt_lines(description, &BENEFIT_MARKERS)
    }

    /// Assemble the final record from a surviving listing and its detail.
    pub fn enrich(
        &self,
        listing: &RawListing,
        detail: &ListingDetail,
        date_added: DateTime<Utc>,
    ) -> EnrichedRecord {
        let posted_time = listing.posted_time.as_deref().unwrap_or_default();
        let score = self.score(&listing.title, &detail.description, &listing.company, posted_time);

        EnrichedRecord {
            title: listing.title.clone(),
            company: listing.company.clone(),
            location: listing.location.clone(),
            url: listing.url.clone(),
            source: listing.source.clone(),
            scraped_at: listing.scraped_at,
            posted_time: listing.posted_time.clone(),
            application_status: listing.application_status.clone(),
            job_type: listing.job_type,
            description: detail.description.clone(),
            criteria: detail.criteria.clone(),
            company_info: detail.company_info.clone(),
            summary: self.summarize(&detail.description),
            category: self.categorize(&listing.title, &detail.description),
            score,
            priority: Priority::from_score(score),
            tags: self.tags(&listing.title, &detail.description, &listing.location),
            requirements: self.requirements_excerpt(&detail.description),
            benefits: self.benefits_excerpt(&detail.description),
            date_added,
            status: "new".to_string(),
        }
    }
}

/// Keep description lines containing any marker, joined by newline and
/// truncated to 500 chars (no ellipsis, matching the sink column budget).
fn excerpt_lines(description: &str, markers: &[&str]) -> String {
    if description.is_empty() {
        return String::new();
    }
    let kept = description
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            markers.iter().any(|marker| lower.contains(marker))
        })
        .collect::<Vec<_>>()
        .join("\n");
    truncate_chars(&kept, EXCERPT_CHAR_BUDGET).0
}
