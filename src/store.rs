use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::sql::BuiltQuery;
use crate::vocab::FacetCategory;

/// One scored row of the ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedRow {
    pub id: i64,
    pub style_code: String,
    pub style_name: String,
    pub brand: Option<String>,
    pub product_type: Option<String>,
    pub primary_colour: Option<String>,
    pub sell_price: Option<f64>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCountRow {
    pub slug: String,
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Read access to the product index. Every method executes one prepared statement.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn fetch_ranked(&self, query: &BuiltQuery) -> Result<Vec<RankedRow>>;

    async fn fetch_count(&self, query: &BuiltQuery) -> Result<i64>;

    async fn fetch_facet_counts(
        &self,
        category: FacetCategory,
        query: &BuiltQuery,
    ) -> Result<Vec<FacetCountRow>>;

    async fn fetch_price_range(&self, query: &BuiltQuery) -> Result<PriceRange>;
}

/// Runs a store call and logs its operation name and duration.
pub async fn timed<T, F>(operation: &'static str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let outcome = call.await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &outcome {
        Ok(_) => debug!(operation, elapsed_ms, "store call finished"),
        Err(err) => warn!(operation, elapsed_ms, error = %err, "store call failed"),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SearchError;

    #[tokio::test]
    async fn timed_passes_results_through() {
        let ok = timed("count", async { Ok(3) }).await.unwrap();
        assert_eq!(ok, 3);
        let err = timed::<(), _>("count", async { Err(SearchError::store("count", "boom")) }).await;
        assert!(matches!(err, Err(SearchError::Store { operation: "count", .. })));
    }
}
