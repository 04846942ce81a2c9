//! Winning-store record types shared across the sync pipeline.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Lottery product lines multiplexed behind the same remote search page.
///
/// The site drives both lines through one dropdown; everything downstream
/// (local maxima, dedup keys, checkpoints) is keyed per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum Category {
    /// Lotto 6/45 (site code `lt645`).
    Lotto645,
    /// Pension lottery 720+ (site code `pt720`).
    Pension720,
}

impl Category {
    /// Internal code the remote interface uses for this product line.
    pub fn code(&self) -> &'static str {
        match self {
            Category::Lotto645 => "lt645",
            Category::Pension720 => "pt720",
        }
    }

    /// Human-readable label used in logs and the CSV output.
    pub fn label(&self) -> &'static str {
        match self {
            Category::Lotto645 => "lotto645",
            Category::Pension720 => "pension720",
        }
    }

    /// Resolves a category from its site code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "lt645" => Some(Category::Lotto645),
            "pt720" => Some(Category::Pension720),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One winning store extracted from a unit's listing.
///
/// Records are created only by extraction and never mutated afterwards. A
/// record is meaningless without both `source_id` and `name`; extraction
/// drops candidates missing either instead of emitting them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    /// Draw round the store won in.
    pub unit: u32,
    /// Product line the win belongs to.
    pub category: Category,
    /// Remote-assigned store identifier, stable across rounds.
    pub source_id: String,
    /// Position within the round's listing, when the site shows one.
    pub sequence: Option<u32>,
    /// Store display name.
    pub name: String,
    /// Prize tier label, e.g. `1등` or `보너스`.
    pub rank: String,
    /// Selection method label (automatic / manual / semi-automatic).
    pub method: String,
    /// Region the listing groups the store under.
    pub region: String,
    /// Street address as rendered.
    pub address: String,
    /// Phone number as rendered.
    pub phone: String,
    /// Lottery products the store handles, in listing order.
    pub tags: Vec<String>,
    /// Latitude from the listing's hidden coordinate input, when present.
    pub latitude: Option<f64>,
    /// Longitude from the listing's hidden coordinate input, when present.
    pub longitude: Option<f64>,
    /// When this record was extracted.
    pub extracted_at: DateTime<Utc>,
}

impl StoreRecord {
    /// Deterministic identity of the fact this record states.
    ///
    /// Two records with the same key are the same fact regardless of when
    /// they were extracted; sinks must store at most one of them.
    pub fn dedup_key(&self) -> String {
        dedup_key(
            self.unit,
            self.category,
            &self.source_id,
            &self.rank,
            self.sequence,
        )
    }
}

/// Computes the dedup key from the identifying fields alone.
///
/// Lowercase hex SHA-256 over `unit|category|source_id|rank|sequence`, with
/// a missing sequence encoded as `0`.
pub fn dedup_key(
    unit: u32,
    category: Category,
    source_id: &str,
    rank: &str,
    sequence: Option<u32>,
) -> String {
    let input = format!(
        "{}|{}|{}|{}|{}",
        unit,
        category.code(),
        source_id,
        rank,
        sequence.unwrap_or(0)
    );
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(unit: u32, source_id: &str, rank: &str, sequence: Option<u32>) -> StoreRecord {
        StoreRecord {
            unit,
            category: Category::Lotto645,
            source_id: source_id.to_string(),
            sequence,
            name: "복권명당".to_string(),
            rank: rank.to_string(),
            method: "자동".to_string(),
            region: "서울".to_string(),
            address: "서울 종로구 1".to_string(),
            phone: "02-000-0000".to_string(),
            tags: vec!["로또6/45".to_string()],
            latitude: Some(37.57),
            longitude: Some(126.98),
            extracted_at: Utc::now(),
        }
    }

    #[test]
    fn key_ignores_extraction_time() {
        let a = record(1207, "11110001", "1등", Some(3));
        let mut b = a.clone();
        b.extracted_at = Utc::now();
        b.address = "moved".to_string();
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn key_varies_with_identity_fields() {
        let base = record(1207, "11110001", "1등", Some(3));
        assert_ne!(
            base.dedup_key(),
            record(1208, "11110001", "1등", Some(3)).dedup_key()
        );
        assert_ne!(
            base.dedup_key(),
            record(1207, "11110002", "1등", Some(3)).dedup_key()
        );
        assert_ne!(
            base.dedup_key(),
            record(1207, "11110001", "2등", Some(3)).dedup_key()
        );
        assert_ne!(
            base.dedup_key(),
            record(1207, "11110001", "1등", Some(4)).dedup_key()
        );
    }

    #[test]
    fn missing_sequence_hashes_as_zero() {
        let absent = record(1207, "11110001", "1등", None);
        let zero = record(1207, "11110001", "1등", Some(0));
        assert_eq!(absent.dedup_key(), zero.dedup_key());
    }

    #[test]
    fn categories_have_distinct_codes() {
        assert_eq!(Category::Lotto645.code(), "lt645");
        assert_eq!(Category::Pension720.code(), "pt720");
        assert_eq!(Category::from_code("pt720"), Some(Category::Pension720));
        assert_eq!(Category::from_code("nope"), None);
    }
}
