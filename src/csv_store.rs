//! CSV-backed store: UTF-8 with BOM, header written once, append-only.
//!
//! The output is meant for spreadsheet tooling, so the file starts with a
//! byte-order marker and a single header row; every later write appends
//! data rows only, across process restarts. Reads tolerate a torn trailing
//! row (a crash mid-append) by skipping rows with the wrong field count.

use crate::record::{dedup_key, Category, StoreRecord};
use crate::state::{LocalState, PersistOutcome, Sink, StoreError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const BOM: char = '\u{feff}';
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Stable column order of the output file.
const HEADER: [&str; 14] = [
    "unit",
    "category",
    "sequence",
    "source_id",
    "name",
    "rank",
    "method",
    "region",
    "address",
    "phone",
    "tags",
    "latitude",
    "longitude",
    "extracted_at",
];

#[derive(Default)]
struct Cache {
    loaded: bool,
    keys: HashSet<String>,
    latest: HashMap<Category, u32>,
}

/// File-backed implementation of both [`Sink`] and [`LocalState`].
pub struct CsvStore {
    path: PathBuf,
    cache: Mutex<Cache>,
}

impl CsvStore {
    /// Store backed by the CSV file at `path`; the file is created on the
    /// first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_loaded(&self, cache: &mut Cache) -> Result<(), StoreError> {
        if cache.loaded {
            return Ok(());
        }
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        let text = text.strip_prefix(BOM).unwrap_or(&text);

        let mut rows = parse_rows(text);
        if rows
            .first()
            .and_then(|row| row.first())
            .is_some_and(|cell| cell.as_str() == HEADER[0])
        {
            rows.remove(0);
        }
        for row in &rows {
            let Some((category, unit, key)) = row_identity(row) else {
                continue;
            };
            cache.keys.insert(key);
            let latest = cache.latest.entry(category).or_insert(0);
            *latest = (*latest).max(unit);
        }
        cache.loaded = true;
        Ok(())
    }

    async fn has_content(&self) -> Result<bool, StoreError> {
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len() > 0),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Sink for CsvStore {
    async fn persist(&self, records: &[StoreRecord]) -> Result<PersistOutcome, StoreError> {
        let mut cache = self.cache.lock().await;
        self.ensure_loaded(&mut cache).await?;

        let mut outcome = PersistOutcome::default();
        let mut body = String::new();
        for record in records {
            let key = record.dedup_key();
            if cache.keys.contains(&key) {
                outcome.duplicates += 1;
                continue;
            }
            push_row(&mut body, record_to_row(record).iter().map(String::as_str));
            cache.keys.insert(key);
            let latest = cache.latest.entry(record.category).or_insert(0);
            *latest = (*latest).max(record.unit);
            outcome.written += 1;
        }
        if outcome.written == 0 {
            return Ok(outcome);
        }

        let mut payload = String::new();
        if !self.has_content().await? {
            payload.push(BOM);
            push_row(&mut payload, HEADER.iter().copied());
        }
        payload.push_str(&body);

        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(payload.as_bytes()).await?;
        file.flush().await?;
        Ok(outcome)
    }
}

#[async_trait]
impl LocalState for CsvStore {
    async fn latest_known_unit(&self, category: Category) -> Result<u32, StoreError> {
        let mut cache = self.cache.lock().await;
        self.ensure_loaded(&mut cache).await?;
        Ok(cache.latest.get(&category).copied().unwrap_or(0))
    }

    async fn existing_dedup_keys(
        &self,
        category: Category,
    ) -> Result<HashSet<String>, StoreError> {
        let mut cache = self.cache.lock().await;
        self.ensure_loaded(&mut cache).await?;
        // Keys already incorporate the category, so the full set is a safe
        // superset; callers only ever test membership.
        let _ = category;
        Ok(cache.keys.clone())
    }
}

fn record_to_row(record: &StoreRecord) -> [String; 14] {
    [
        record.unit.to_string(),
        record.category.code().to_string(),
        record
            .sequence
            .map(|sequence| sequence.to_string())
            .unwrap_or_default(),
        record.source_id.clone(),
        record.name.clone(),
        record.rank.clone(),
        record.method.clone(),
        record.region.clone(),
        record.address.clone(),
        record.phone.clone(),
        record.tags.join(", "),
        record
            .latitude
            .map(|value| value.to_string())
            .unwrap_or_default(),
        record
            .longitude
            .map(|value| value.to_string())
            .unwrap_or_default(),
        record.extracted_at.format(TIMESTAMP_FORMAT).to_string(),
    ]
}

/// Recovers the dedup identity from a stored row, `None` for short or
/// unparseable rows (a torn trailing write, a foreign category code).
fn row_identity(row: &[String]) -> Option<(Category, u32, String)> {
    if row.len() != HEADER.len() {
        return None;
    }
    let unit: u32 = row[0].parse().ok()?;
    let category = Category::from_code(&row[1])?;
    let sequence: Option<u32> = if row[2].is_empty() {
        None
    } else {
        Some(row[2].parse().ok()?)
    };
    let key = dedup_key(unit, category, &row[3], &row[5], sequence);
    Some((category, unit, key))
}

/* ---------------- row writing ---------------- */

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

fn push_row<'a, I>(buf: &mut String, fields: I)
where
    I: IntoIterator<Item = &'a str>,
{
    let mut first = true;
    for field in fields {
        if !first {
            buf.push(',');
        }
        first = false;
        if needs_quotes(field) {
            buf.push('"');
            buf.push_str(&field.replace('"', "\"\""));
            buf.push('"');
        } else {
            buf.push_str(field);
        }
    }
    buf.push('\n');
}

/* ---------------- row parsing ---------------- */

/// Minimal quote-aware CSV parser, CRLF tolerant.
fn parse_rows(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes {
                    if matches!(chars.peek(), Some('"')) {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                } else {
                    in_quotes = true;
                }
            }
            ',' if !in_quotes => {
                row.push(std::mem::take(&mut field));
            }
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && matches!(chars.peek(), Some('\n')) {
                    chars.next();
                }
                row.push(std::mem::take(&mut field));
                if !(row.len() == 1 && row[0].is_empty()) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            _ => field.push(ch),
        }
    }

    // Flush a trailing row without a final newline.
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(unit: u32, source_id: &str, name: &str) -> StoreRecord {
        StoreRecord {
            unit,
            category: Category::Lotto645,
            source_id: source_id.to_string(),
            sequence: Some(1),
            name: name.to_string(),
            rank: "1등".to_string(),
            method: "수동".to_string(),
            region: "서울".to_string(),
            address: "서울 마포구 3".to_string(),
            phone: "02-555-1234".to_string(),
            tags: vec!["로또6/45".to_string(), "연금복권720+".to_string()],
            latitude: Some(37.55),
            longitude: Some(126.92),
            extracted_at: Utc::now(),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bom_and_header_written_exactly_once() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stores.csv");

        let store = CsvStore::new(&path);
        store
            .persist(&[record(1207, "a", "첫번째")])
            .await
            .expect("first write");
        store
            .persist(&[record(1208, "b", "두번째")])
            .await
            .expect("second write");

        let text = std::fs::read_to_string(&path).expect("read back");
        assert!(text.starts_with('\u{feff}'), "missing byte-order marker");
        assert_eq!(text.matches("unit,category").count(), 1);
        // Header plus one row per record.
        assert_eq!(text.lines().count(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn header_survives_process_restart() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stores.csv");

        CsvStore::new(&path)
            .persist(&[record(1207, "a", "판매점")])
            .await
            .expect("first process");

        // A fresh store over the same file must append without a second header.
        let reopened = CsvStore::new(&path);
        reopened
            .persist(&[record(1208, "b", "판매점")])
            .await
            .expect("second process");

        let text = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(text.matches("unit,category").count(), 1);
        assert_eq!(
            reopened
                .latest_known_unit(Category::Lotto645)
                .await
                .expect("latest"),
            1208
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn repersisting_identical_facts_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stores.csv");

        let batch = vec![record(1207, "a", "판매점"), record(1207, "b", "다른곳")];
        CsvStore::new(&path).persist(&batch).await.expect("write");

        // Same facts, later extraction timestamps: still duplicates.
        let mut refetched = batch.clone();
        for item in &mut refetched {
            item.extracted_at = Utc::now();
        }
        let reopened = CsvStore::new(&path);
        let outcome = reopened.persist(&refetched).await.expect("rewrite");
        assert_eq!(outcome.written, 0);
        assert_eq!(outcome.duplicates, 2);

        let text = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(text.lines().count(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn torn_trailing_row_is_ignored_on_load() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stores.csv");

        CsvStore::new(&path)
            .persist(&[record(1207, "a", "판매점")])
            .await
            .expect("write");

        // Simulate a crash mid-append: a row with too few fields.
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        write!(file, "9999,lt645,1,zz").expect("torn append");

        let reopened = CsvStore::new(&path);
        assert_eq!(
            reopened
                .latest_known_unit(Category::Lotto645)
                .await
                .expect("latest"),
            1207
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn quoted_fields_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stores.csv");

        let mut tricky = record(1207, "a", "상호, \"명당\"");
        tricky.address = "서울 중구\n지하 1층".to_string();
        CsvStore::new(&path).persist(&[tricky.clone()]).await.expect("write");

        let reopened = CsvStore::new(&path);
        let keys = reopened
            .existing_dedup_keys(Category::Lotto645)
            .await
            .expect("keys");
        assert!(keys.contains(&tricky.dedup_key()));
        let outcome = reopened.persist(&[tricky]).await.expect("rewrite");
        assert_eq!(outcome.duplicates, 1);
    }
}
