//! Structural extraction of winning-store records from a rendered listing.
//!
//! Extraction is pure: it never touches the session and never fails. A
//! candidate missing its required fields is dropped and counted instead of
//! aborting the document.

use crate::record::{Category, StoreRecord};
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};

/// Result of extracting one document.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Records that carried the required identity fields.
    pub records: Vec<StoreRecord>,
    /// Candidates dropped for missing a store id or name.
    pub dropped: usize,
}

struct StoreSelectors {
    store_box: Selector,
    sequence: Selector,
    name: Selector,
    rank: Selector,
    method: Selector,
    region: Selector,
    address: Selector,
    phone: Selector,
    tags: Selector,
    latitude: Selector,
    longitude: Selector,
}

impl StoreSelectors {
    fn new() -> Self {
        Self {
            store_box: Selector::parse("div.store-box").expect("store-box selector"),
            sequence: Selector::parse(".store-num").expect("store-num selector"),
            name: Selector::parse(".store-loc").expect("store-loc selector"),
            rank: Selector::parse(".draw-rank").expect("draw-rank selector"),
            method: Selector::parse(".draw-opt").expect("draw-opt selector"),
            region: Selector::parse(".tit-detail").expect("tit-detail selector"),
            address: Selector::parse(".store-addr").expect("store-addr selector"),
            phone: Selector::parse(".store-tel").expect("store-tel selector"),
            tags: Selector::parse(".txt-bagge").expect("txt-bagge selector"),
            latitude: Selector::parse("input.shpLat").expect("shpLat selector"),
            longitude: Selector::parse("input.shpLot").expect("shpLot selector"),
        }
    }
}

/// Extracts every winning store the document lists for `unit`.
pub fn extract_stores(document: &str, unit: u32, category: Category) -> Extraction {
    let selectors = StoreSelectors::new();
    let html = Html::parse_document(document);
    let extracted_at = Utc::now();

    let mut records = Vec::new();
    let mut dropped = 0usize;

    for store_box in html.select(&selectors.store_box) {
        let source_id = store_box
            .value()
            .attr("data-ltshpid")
            .unwrap_or_default()
            .trim()
            .to_string();
        let name = text_of(store_box, &selectors.name);

        // A record without both identity fields states nothing.
        if source_id.is_empty() || name.is_empty() {
            dropped += 1;
            continue;
        }

        records.push(StoreRecord {
            unit,
            category,
            source_id,
            sequence: text_of(store_box, &selectors.sequence).parse().ok(),
            name,
            rank: text_of(store_box, &selectors.rank),
            method: text_of(store_box, &selectors.method),
            region: region_of(store_box, &selectors.region),
            address: text_of(store_box, &selectors.address),
            phone: text_of(store_box, &selectors.phone),
            tags: store_box
                .select(&selectors.tags)
                .map(collapsed_text)
                .filter(|tag| !tag.is_empty())
                .collect(),
            latitude: value_of(store_box, &selectors.latitude),
            longitude: value_of(store_box, &selectors.longitude),
            extracted_at,
        });
    }

    Extraction { records, dropped }
}

fn collapsed_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn text_of(el: ElementRef<'_>, selector: &Selector) -> String {
    el.select(selector).next().map(collapsed_text).unwrap_or_default()
}

/// Region headings carry a trailing store count, e.g. `서울 (12)`.
fn region_of(el: ElementRef<'_>, selector: &Selector) -> String {
    let raw = text_of(el, selector);
    raw.split('(').next().unwrap_or("").trim().to_string()
}

fn value_of(el: ElementRef<'_>, selector: &Selector) -> Option<f64> {
    el.select(selector)
        .next()
        .and_then(|input| input.value().attr("value"))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_box(id: &str, name: &str) -> String {
        format!(
            r#"<div class="store-box" data-ltshpid="{id}">
                 <span class="store-num">3</span>
                 <strong class="store-loc">{name}</strong>
                 <em class="draw-rank">1등</em>
                 <em class="draw-opt">자동</em>
                 <h3 class="tit-detail">서울 (12)</h3>
                 <p class="store-addr">서울 종로구 세종대로 1</p>
                 <p class="store-tel">02-123-4567</p>
                 <span class="txt-bagge">로또6/45</span>
                 <span class="txt-bagge">연금복권720+</span>
                 <input type="hidden" class="shpLat" value="37.5700"/>
                 <input type="hidden" class="shpLot" value="126.9800"/>
               </div>"#
        )
    }

    #[test]
    fn extracts_full_record() {
        let html = format!(
            "<html><body><div class='store-list'>{}</div></body></html>",
            store_box("11110001", "복권명당")
        );
        let extraction = extract_stores(&html, 1207, Category::Lotto645);
        assert_eq!(extraction.dropped, 0);
        assert_eq!(extraction.records.len(), 1);

        let record = &extraction.records[0];
        assert_eq!(record.unit, 1207);
        assert_eq!(record.source_id, "11110001");
        assert_eq!(record.sequence, Some(3));
        assert_eq!(record.name, "복권명당");
        assert_eq!(record.rank, "1등");
        assert_eq!(record.method, "자동");
        assert_eq!(record.region, "서울");
        assert_eq!(record.address, "서울 종로구 세종대로 1");
        assert_eq!(record.phone, "02-123-4567");
        assert_eq!(record.tags, vec!["로또6/45", "연금복권720+"]);
        assert_eq!(record.latitude, Some(37.57));
        assert_eq!(record.longitude, Some(126.98));
    }

    #[test]
    fn drops_candidates_missing_identity() {
        let html = format!(
            "<html><body>{}{}{}</body></html>",
            store_box("", "이름만"),
            r#"<div class="store-box" data-ltshpid="22220002"></div>"#,
            store_box("33330003", "정상판매점"),
        );
        let extraction = extract_stores(&html, 900, Category::Pension720);
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.records[0].source_id, "33330003");
        assert_eq!(extraction.dropped, 2);
    }

    #[test]
    fn tolerates_missing_optional_fields() {
        let html = r#"<html><body>
            <div class="store-box" data-ltshpid="44440004">
              <strong class="store-loc">간이판매점</strong>
            </div>
        </body></html>"#;
        let extraction = extract_stores(html, 901, Category::Lotto645);
        assert_eq!(extraction.dropped, 0);

        let record = &extraction.records[0];
        assert_eq!(record.sequence, None);
        assert!(record.rank.is_empty());
        assert!(record.tags.is_empty());
        assert_eq!(record.latitude, None);
        assert_eq!(record.longitude, None);
    }

    #[test]
    fn empty_document_yields_nothing() {
        let extraction = extract_stores("<html><body></body></html>", 1, Category::Lotto645);
        assert!(extraction.records.is_empty());
        assert_eq!(extraction.dropped, 0);
    }
}
