use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

// -------- Shops and catalog --------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shop {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    /// Spec keys every listing in this category must carry before review.
    #[serde(default)]
    pub required_specs: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CatalogStatus {
    Approved,
    PendingReview,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub id: Uuid,
    pub name: String,
    pub brand: Option<String>,
    pub category_id: Option<Uuid>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Normalized brand + name, unique across the catalog.
    pub match_key: String,
    pub status: CatalogStatus,
    pub created_by_batch: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    #[default]
    New,
    Refurbished,
    UsedLikeNew,
    UsedGood,
    UsedFair,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::New => "NEW",
            Condition::Refurbished => "REFURBISHED",
            Condition::UsedLikeNew => "USED_LIKE_NEW",
            Condition::UsedGood => "USED_GOOD",
            Condition::UsedFair => "USED_FAIR",
        }
    }

    /// Accepts the canonical names plus the spaced/hyphenated spellings
    /// spreadsheet users tend to type ("used - like new").
    pub fn parse(input: &str) -> Option<Self> {
        let folded = input
            .trim()
            .to_uppercase()
            .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        match folded.as_str() {
            "NEW" => Some(Condition::New),
            "REFURBISHED" => Some(Condition::Refurbished),
            "USED_LIKE_NEW" => Some(Condition::UsedLikeNew),
            "USED_GOOD" => Some(Condition::UsedGood),
            "USED_FAIR" => Some(Condition::UsedFair),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingStatus {
    NeedsSpecs,
    NeedsImages,
    PendingReview,
    Active,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopProduct {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub price: Decimal,
    pub stock: u32,
    pub condition: Condition,
    pub images: Vec<String>,
    pub specs: BTreeMap<String, String>,
    pub listing_status: ListingStatus,
    pub is_available: bool,
    pub batch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockAuditEntry {
    pub shop_product_id: Uuid,
    pub delta: i64,
    pub reason: String,
    pub actor_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

// -------- Upload batches --------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Staging,
    Committed,
    Cancelled,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Staging)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BatchStatus::Staging => "STAGING",
            BatchStatus::Committed => "COMMITTED",
            BatchStatus::Cancelled => "CANCELLED",
            BatchStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBatch {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub file_name: String,
    pub total_rows: usize,
    pub valid_rows: usize,
    pub invalid_rows: usize,
    /// Rows held back for disambiguation.
    pub skipped_rows: usize,
    pub committed_rows: usize,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub corrections_downloaded_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl UploadBatch {
    /// Recomputes the per-outcome counts from the staged rows.
    pub fn apply_tally(&mut self, rows: &[StagedRow]) {
        self.total_rows = rows.len();
        self.valid_rows = rows.iter().filter(|row| row.is_valid).count();
        self.invalid_rows = rows.iter().filter(|row| !row.errors.is_empty()).count();
        self.skipped_rows = rows.iter().filter(|row| row.is_ambiguous()).count();
    }
}

/// Cell text exactly as the seller typed it, kept so a corrections file can
/// echo it back untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawRow {
    pub name: String,
    pub brand: String,
    pub sku: String,
    pub price: String,
    pub stock: String,
    pub condition: String,
    pub category: String,
    pub specs: String,
    pub images: String,
}

impl RawRow {
    pub fn is_blank(&self) -> bool {
        self.cells().iter().all(|cell| cell.trim().is_empty())
    }

    pub fn cells(&self) -> [&str; 9] {
        [
            &self.name,
            &self.brand,
            &self.sku,
            &self.price,
            &self.stock,
            &self.condition,
            &self.category,
            &self.specs,
            &self.images,
        ]
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedRow {
    pub row_index: usize,
    pub name: String,
    pub brand: Option<String>,
    pub sku: Option<String>,
    pub price: Decimal,
    pub stock: u32,
    pub condition: Condition,
    pub category: Option<String>,
    pub specs: Option<BTreeMap<String, String>>,
    pub images: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorCode {
    MissingName,
    InvalidPrice,
    InvalidStock,
    InvalidCondition,
    InvalidSpecs,
    InvalidImages,
    TooManyImages,
    UnknownCategory,
    DuplicateInFile,
    DuplicateSku,
    AlreadyInShop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowError {
    pub row_index: usize,
    pub field: String,
    pub code: RowErrorCode,
    pub message: String,
}

impl RowError {
    pub fn new(
        row_index: usize,
        field: &str,
        code: RowErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            row_index,
            field: field.to_string(),
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchKind {
    Exact,
    Fuzzy,
    Ambiguous,
    New,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedRow {
    pub batch_id: Uuid,
    pub row_index: usize,
    pub raw: RawRow,
    pub parsed: Option<ParsedRow>,
    /// `None` on a valid row means a catalog product is created at commit.
    pub resolved_product_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub is_valid: bool,
    pub errors: Vec<RowError>,
    pub match_kind: Option<MatchKind>,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub candidates: Vec<Uuid>,
}

impl StagedRow {
    pub fn is_ambiguous(&self) -> bool {
        self.errors.is_empty() && self.match_kind == Some(MatchKind::Ambiguous)
    }

    /// Rows that end up in the corrections file: hard errors or an
    /// unresolved ambiguous match.
    pub fn needs_correction(&self) -> bool {
        !self.is_valid
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFilter {
    #[default]
    All,
    Valid,
    Invalid,
}

impl RowFilter {
    pub fn accepts(&self, row: &StagedRow) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::Valid => row.is_valid,
            RowFilter::Invalid => !row.is_valid,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CommitSummary {
    pub batch_id: Uuid,
    pub committed: usize,
    pub pending_review: usize,
    pub needs_images: usize,
    pub needs_specs: usize,
    pub skipped_invalid: usize,
    pub catalog_created: usize,
    pub catalog_rematched: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_parse_accepts_spreadsheet_spellings() {
        assert_eq!(Condition::parse("new"), Some(Condition::New));
        assert_eq!(Condition::parse("Used - Like New"), Some(Condition::UsedLikeNew));
        assert_eq!(Condition::parse("used_fair"), Some(Condition::UsedFair));
        assert_eq!(Condition::parse("broken"), None);
    }

    #[test]
    fn only_staging_is_non_terminal() {
        assert!(!BatchStatus::Staging.is_terminal());
        assert!(BatchStatus::Committed.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
    }
}
