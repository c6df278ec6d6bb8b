//! Fixtures and doubles shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{Result, SearchError};
use crate::lookup::VocabularySource;
use crate::sql::BuiltQuery;
use crate::store::{CatalogStore, FacetCountRow, PriceRange, RankedRow};
use crate::vocab::{FacetCategory, SynonymMapping, VocabularyData, VocabularySnapshot, VocabularyTerm};

const TERMS: &[(FacetCategory, &str, &str)] = &[
    (FacetCategory::Brand, "gildan", "Gildan"),
    (FacetCategory::Brand, "fruit-of-the-loom", "Fruit of the Loom"),
    (FacetCategory::Brand, "nike", "Nike"),
    (FacetCategory::ProductType, "polos", "Polos"),
    (FacetCategory::ProductType, "hoodies", "Hoodies"),
    (FacetCategory::ProductType, "t-shirts", "T-Shirts"),
    (FacetCategory::ProductType, "sweatshirts", "Sweatshirts"),
    (FacetCategory::ProductType, "jackets", "Jackets"),
    (FacetCategory::Sport, "golf", "Golf"),
    (FacetCategory::Sport, "football", "Football"),
    (FacetCategory::Sport, "running", "Running"),
    (FacetCategory::Colour, "red", "Red"),
    (FacetCategory::Colour, "navy", "Navy"),
    (FacetCategory::Colour, "navy-blue", "Navy Blue"),
    (FacetCategory::Colour, "black", "Black"),
    (FacetCategory::Colour, "white", "White"),
    (FacetCategory::Colour, "grey", "Grey"),
    (FacetCategory::Fit, "slim-fit", "Slim Fit"),
    (FacetCategory::Fit, "regular-fit", "Regular Fit"),
    (FacetCategory::Sleeve, "long-sleeve", "Long Sleeve"),
    (FacetCategory::Sleeve, "short-sleeve", "Short Sleeve"),
    (FacetCategory::Neckline, "v-neck", "V-Neck"),
    (FacetCategory::Neckline, "crew-neck", "Crew Neck"),
    (FacetCategory::Fabric, "cotton", "Cotton"),
    (FacetCategory::Fabric, "organic-cotton", "Organic Cotton"),
    (FacetCategory::Fabric, "polyester", "Polyester"),
    (FacetCategory::Sector, "hospitality", "Hospitality"),
    (FacetCategory::Sector, "corporate", "Corporate"),
    (FacetCategory::Sector, "golf", "Golf Clubs"),
    (FacetCategory::Feature, "waterproof", "Waterproof"),
    (FacetCategory::Feature, "breathable", "Breathable"),
];

const SYNONYMS: &[(&str, &str, Option<FacetCategory>)] = &[
    ("hoodie", "hoodies", Some(FacetCategory::ProductType)),
    ("hooded sweatshirt", "hoodies", Some(FacetCategory::ProductType)),
    ("tee", "t-shirts", Some(FacetCategory::ProductType)),
    ("polo shirt", "polos", Some(FacetCategory::ProductType)),
    ("footy", "football", Some(FacetCategory::Sport)),
    ("gray", "grey", None),
];

pub fn fixture_data() -> VocabularyData {
    VocabularyData {
        terms: TERMS
            .iter()
            .map(|&(category, slug, name)| VocabularyTerm {
                category,
                slug: slug.to_string(),
                name: name.to_string(),
                source: "fixture".to_string(),
            })
            .collect(),
        synonyms: SYNONYMS
            .iter()
            .map(|&(term, canonical, category)| SynonymMapping {
                term: term.to_string(),
                canonical: canonical.to_string(),
                category,
            })
            .collect(),
    }
}

pub fn fixture_snapshot() -> VocabularySnapshot {
    VocabularySnapshot::build(fixture_data(), 1, None)
}

/// Vocabulary source that replays a fixed script; the last step repeats.
pub struct ScriptedSource {
    steps: Vec<std::result::Result<VocabularyData, ()>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn always(data: VocabularyData) -> Self {
        Self::sequence(vec![Ok(data)])
    }

    pub fn failing() -> Self {
        Self::sequence(vec![Err(())])
    }

    pub fn sequence(steps: Vec<std::result::Result<VocabularyData, ()>>) -> Self {
        Self {
            steps,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VocabularySource for ScriptedSource {
    async fn load_vocabulary(&self) -> Result<VocabularyData> {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = self
            .steps
            .get(idx)
            .or_else(|| self.steps.last())
            .cloned()
            .unwrap_or(Err(()));
        step.map_err(|()| SearchError::VocabularyLoad("scripted failure".into()))
    }
}

struct InFlightGauge<'a>(&'a AtomicUsize);

impl Drop for InFlightGauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory `CatalogStore` returning canned rows and recording every query.
///
/// Operations are keyed `ranked`, `count`, `price_range` and `facet:<category>`.
#[derive(Default)]
pub struct MockStore {
    ranked: Vec<RankedRow>,
    total: i64,
    facets: HashMap<FacetCategory, Vec<FacetCountRow>>,
    price: PriceRange,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    failures: HashSet<String>,
    panics: HashSet<String>,
    recorded: Mutex<Vec<(String, BuiltQuery)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: AtomicUsize,
}

pub fn facet_op(category: FacetCategory) -> String {
    format!("facet:{category}")
}

pub fn ranked_row(id: i64, code: &str, score: f64) -> RankedRow {
    RankedRow {
        id,
        style_code: code.to_string(),
        style_name: format!("Style {code}"),
        brand: Some("gildan".into()),
        product_type: Some("polos".into()),
        primary_colour: Some("Red".into()),
        sell_price: Some(9.5),
        score,
    }
}

pub fn count_row(slug: &str, count: i64) -> FacetCountRow {
    FacetCountRow {
        slug: slug.to_string(),
        name: slug.to_string(),
        count,
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ranked(mut self, rows: Vec<RankedRow>) -> Self {
        self.ranked = rows;
        self
    }

    pub fn with_total(mut self, total: i64) -> Self {
        self.total = total;
        self
    }

    pub fn with_facet(mut self, category: FacetCategory, rows: Vec<FacetCountRow>) -> Self {
        self.facets.insert(category, rows);
        self
    }

    pub fn with_price(mut self, min: f64, max: f64) -> Self {
        self.price = PriceRange {
            min: Some(min),
            max: Some(max),
        };
        self
    }

    pub fn with_delay(mut self, op: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(op.into(), delay);
        self
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn failing(mut self, op: impl Into<String>) -> Self {
        self.failures.insert(op.into());
        self
    }

    /// The operation panics instead of returning, as a crashed task would.
    pub fn panicking(mut self, op: impl Into<String>) -> Self {
        self.panics.insert(op.into());
        self
    }

    pub fn queries(&self, op: &str) -> Vec<BuiltQuery> {
        self.recorded
            .lock()
            .iter()
            .filter(|(recorded, _)| recorded == op)
            .map(|(_, query)| query.clone())
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.recorded.lock().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    async fn call<T>(&self, op: String, query: &BuiltQuery, value: impl FnOnce() -> T) -> Result<T> {
        self.recorded.lock().push((op.clone(), query.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _gauge = InFlightGauge(&self.in_flight);

        let delay = self.delays.get(&op).copied().unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.panics.contains(&op) {
            panic!("{op} panicked");
        }
        if self.failures.contains(&op) {
            return Err(SearchError::store("mock", format!("{op} failed")));
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(value())
    }
}

#[async_trait]
impl CatalogStore for MockStore {
    async fn fetch_ranked(&self, query: &BuiltQuery) -> Result<Vec<RankedRow>> {
        self.call("ranked".into(), query, || self.ranked.clone()).await
    }

    async fn fetch_count(&self, query: &BuiltQuery) -> Result<i64> {
        self.call("count".into(), query, || self.total).await
    }

    async fn fetch_facet_counts(
        &self,
        category: FacetCategory,
        query: &BuiltQuery,
    ) -> Result<Vec<FacetCountRow>> {
        self.call(facet_op(category), query, || {
            self.facets.get(&category).cloned().unwrap_or_default()
        })
        .await
    }

    async fn fetch_price_range(&self, query: &BuiltQuery) -> Result<PriceRange> {
        self.call("price_range".into(), query, || self.price).await
    }
}
