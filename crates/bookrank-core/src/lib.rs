//! Core domain model for bookrank: period windows, job keys, source items and read models.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bookrank-core";

pub type SiteId = Uuid;
pub type CategoryId = Uuid;
pub type SiteCategoryMappingId = Uuid;
pub type BookId = Uuid;
pub type BookSiteMappingId = Uuid;

/// Aggregation period of a ranking as published by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown period type {0:?} (expected daily, weekly or monthly)")]
pub struct UnknownPeriod(pub String);

impl PeriodType {
    pub const ALL: [PeriodType; 3] = [PeriodType::Daily, PeriodType::Weekly, PeriodType::Monthly];

    /// Lenient parse used on the ingestion path: unrecognized labels become `Daily`.
    pub fn from_label_or_default(label: &str) -> Self {
        label.parse().unwrap_or(PeriodType::Daily)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Daily => "daily",
            PeriodType::Weekly => "weekly",
            PeriodType::Monthly => "monthly",
        }
    }

    /// Reporting window ending at `now`.
    pub fn window_ending(self, now: DateTime<Utc>) -> ReportingWindow {
        let date_to = now.date_naive();
        let date_from = match self {
            PeriodType::Daily => date_to.checked_sub_days(Days::new(1)),
            PeriodType::Weekly => date_to.checked_sub_days(Days::new(7)),
            PeriodType::Monthly => date_to.checked_sub_months(Months::new(1)),
        }
        .unwrap_or(date_to);
        ReportingWindow { date_from, date_to }
    }
}

impl FromStr for PeriodType {
    type Err = UnknownPeriod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(PeriodType::Daily),
            "weekly" => Ok(PeriodType::Weekly),
            "monthly" => Ok(PeriodType::Monthly),
            other => Err(UnknownPeriod(other.to_string())),
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive `[date_from, date_to]` interval a ranking fact covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportingWindow {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

/// One schedulable unit of ingestion work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub category_key: String,
    pub period: PeriodType,
}

impl JobKey {
    pub fn new(category_key: impl Into<String>, period: PeriodType) -> Self {
        Self {
            category_key: category_key.into(),
            period,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.category_key, self.period)
    }
}

/// The site a source represents; persisted as a `sites` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteProfile {
    pub name: String,
    pub display_name: String,
    pub base_url: String,
    pub affiliate_id: String,
}

/// One ranked entry as returned by an external source, in source order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub name: String,
    pub item_code: String,
    pub price: f64,
    pub detail_url: String,
    pub shop_name: String,
    pub image_url: Option<String>,
    pub rank: u32,
    pub author: String,
    pub publisher: String,
    pub isbn: String,
    #[serde(default)]
    pub sales_date: Option<String>,
}

/// Result of one source fetch: the items plus the native category id the source answered for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedRanking {
    pub native_category_id: String,
    pub items: Vec<RankedItem>,
}

/// Source-agnostic catalog entry candidate, matched ISBN first then title+author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookCandidate {
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub isbn: String,
    pub publication_date: Option<String>,
    pub image_url: String,
}

impl From<&RankedItem> for BookCandidate {
    fn from(item: &RankedItem) -> Self {
        Self {
            title: item.name.trim().to_string(),
            author: item.author.trim().to_string(),
            publisher: item.publisher.trim().to_string(),
            isbn: item.isbn.trim().to_string(),
            publication_date: item
                .sales_date
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            image_url: item.image_url.clone().unwrap_or_default(),
        }
    }
}

/// Natural key plus mutable rank of a `rankings` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingFact {
    pub book_site_mapping_id: BookSiteMappingId,
    pub category_id: CategoryId,
    pub rank: u32,
    pub period: PeriodType,
    pub window: ReportingWindow,
}

/// Maps logical category keys to the source's native genre identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenreRegistry {
    genres: BTreeMap<String, String>,
}

impl GenreRegistry {
    pub fn new(genres: BTreeMap<String, String>) -> Self {
        Self { genres }
    }

    /// Rakuten Books genres (本・雑誌・コミック and its children).
    pub fn rakuten_books() -> Self {
        let genres = [
            ("all", "200162"),
            ("books", "200163"),
            ("magazine", "200164"),
            ("comics", "200165"),
            ("lightNovel", "200302"),
            ("business", "200166"),
            ("computer", "200167"),
            ("science", "200168"),
            ("humanities", "200169"),
            ("entertainment", "200170"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { genres }
    }

    pub fn resolve(&self, category_key: &str) -> Option<&str> {
        self.genres.get(category_key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.genres.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.genres.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genres.is_empty()
    }
}

impl Default for GenreRegistry {
    fn default() -> Self {
        Self::rakuten_books()
    }
}

/// Row counts per ingested table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub sites: i64,
    pub categories: i64,
    pub site_category_mappings: i64,
    pub books: i64,
    pub book_site_mappings: i64,
    pub rankings: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedBook {
    pub id: BookId,
    pub rank: u32,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub isbn: String,
    pub publication_date: Option<String>,
    pub image_url: String,
    pub price: f64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingPage {
    pub category_id: CategoryId,
    pub category_name: String,
    pub period_type: PeriodType,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub books: Vec<RankedBook>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookDetail {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub isbn: String,
    pub publication_date: Option<String>,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub id: CategoryId,
    pub name: String,
    pub parent_id: Option<CategoryId>,
}
