//! Request-level entry points: `search` and `facets`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::capabilities::FacetCapabilities;
use crate::classify::{ClassifiedQuery, QueryClassifier};
use crate::clock::Clock;
use crate::conditions::{ConditionBuilder, count_query};
use crate::config::{CacheConfig, SearchConfig};
use crate::error::Result;
use crate::facets::{FacetAggregator, FacetPlan, FacetsResponse, bounded};
use crate::invalidation::Invalidate;
use crate::lookup::LookupCache;
use crate::result_cache::{CacheKey, ResultCache};
use crate::scoring::{ALIAS, SortOrder, ranked_query};
use crate::sql::BuiltQuery;
use crate::store::{CatalogStore, RankedRow};
use crate::vocab::VocabularySnapshot;

/// 1-based page and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, limit: 24 }
    }
}

impl Pagination {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }

    /// Page at least 1; a zero limit takes the configured page size.
    pub fn clamped(self, config: &SearchConfig) -> Self {
        let limit = if self.limit == 0 {
            config.page_size
        } else {
            self.limit
        };
        Self {
            page: self.page.max(1),
            limit: limit.clamp(1, config.max_page_size.max(1)),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub items: Vec<RankedRow>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub sort: SortOrder,
    pub query: ClassifiedQuery,
}

/// Statements a request would run, without running them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Explain {
    pub query: ClassifiedQuery,
    pub ranked: BuiltQuery,
    pub count: BuiltQuery,
    pub facets: FacetPlan,
}

pub struct CatalogSearch {
    lookup: Arc<LookupCache>,
    store: Arc<dyn CatalogStore>,
    caps: Arc<FacetCapabilities>,
    config: Arc<SearchConfig>,
    aggregator: FacetAggregator,
    search_cache: ResultCache<SearchResults>,
    facet_cache: ResultCache<FacetsResponse>,
}

impl CatalogSearch {
    pub fn new(
        lookup: Arc<LookupCache>,
        store: Arc<dyn CatalogStore>,
        caps: FacetCapabilities,
        config: SearchConfig,
        cache: &CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let caps = Arc::new(caps);
        let config = Arc::new(config);
        Self {
            aggregator: FacetAggregator::new(Arc::clone(&store), Arc::clone(&caps), Arc::clone(&config)),
            search_cache: ResultCache::new(cache.result_capacity, cache.result_ttl, Arc::clone(&clock)),
            facet_cache: ResultCache::new(cache.result_capacity, cache.result_ttl, clock),
            lookup,
            store,
            caps,
            config,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &FacetCapabilities {
        &self.caps
    }

    pub fn lookup(&self) -> &Arc<LookupCache> {
        &self.lookup
    }

    fn classify_with(&self, raw: &str) -> (Arc<VocabularySnapshot>, ClassifiedQuery) {
        let snapshot = self.lookup.ensure_fresh();
        let classified = QueryClassifier::new(&snapshot, &self.config).classify(raw);
        debug!(
            generation = snapshot.generation(),
            facets = classified.active_categories().count(),
            free_text = classified.free_text.len(),
            style_code = classified.style_code.is_some(),
            "query classified"
        );
        (snapshot, classified)
    }

    pub fn classify(&self, raw: &str) -> ClassifiedQuery {
        self.classify_with(raw).1
    }

    pub fn explain(&self, raw: &str, pagination: Pagination, sort: SortOrder) -> Result<Explain> {
        let classified = self.classify(raw);
        let page = pagination.clamped(&self.config);
        let ranked = ranked_query(
            &classified,
            sort,
            i64::from(page.limit),
            page.offset(),
            &self.caps,
            &self.config,
        )?;
        let conditions = ConditionBuilder::new(&self.caps, &self.config).build(&classified, ALIAS, 1)?;
        Ok(Explain {
            count: count_query(&conditions)?,
            facets: self.aggregator.plan(&classified)?,
            ranked,
            query: classified,
        })
    }

    /// Ranked page plus total. A failed or slow ranked query fails the call
    /// with a retryable error.
    pub async fn search(&self, raw: &str, pagination: Pagination, sort: SortOrder) -> Result<SearchResults> {
        let (snapshot, classified) = self.classify_with(raw);
        let page = pagination.clamped(&self.config);
        let key = CacheKey::new("search", snapshot.generation(), &classified, page.page, page.limit, sort);
        self.search_cache
            .get_or_try_insert_with(key, || self.run_search(&classified, page, sort))
            .await
    }

    async fn run_search(&self, classified: &ClassifiedQuery, page: Pagination, sort: SortOrder) -> Result<SearchResults> {
        let started = Instant::now();
        let ranked = ranked_query(
            classified,
            sort,
            i64::from(page.limit),
            page.offset(),
            &self.caps,
            &self.config,
        )?;
        let conditions = ConditionBuilder::new(&self.caps, &self.config).build(classified, ALIAS, 1)?;
        let count = count_query(&conditions)?;

        let permits = Semaphore::new(self.config.max_concurrent_queries.max(1));
        let deadline = self.config.ranked_timeout;
        let (items, total) = tokio::try_join!(
            bounded(&permits, deadline, "ranked", self.store.fetch_ranked(&ranked)),
            bounded(&permits, deadline, "count", self.store.fetch_count(&count)),
        )?;
        info!(
            items = items.len(),
            total,
            page = page.page,
            sort = %sort,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search served"
        );
        Ok(SearchResults {
            items,
            total,
            page: page.page,
            limit: page.limit,
            sort,
            query: classified.clone(),
        })
    }

    /// Facet counts, price range and total. Degraded responses are not cached.
    pub async fn facets(&self, raw: &str) -> Result<FacetsResponse> {
        let (snapshot, classified) = self.classify_with(raw);
        let key = CacheKey::new("facets", snapshot.generation(), &classified, 0, 0, SortOrder::Relevance);
        let generation = self.facet_cache.generation();
        if let Some(hit) = self.facet_cache.get(&key) {
            return Ok(hit);
        }
        let started = Instant::now();
        let response = self.aggregator.aggregate(&classified).await?;
        info!(
            categories = response.filters.len(),
            unavailable = response.unavailable.len(),
            total = response.total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "facets served"
        );
        if !response.degraded {
            self.facet_cache.insert(key, response.clone(), generation);
        }
        Ok(response)
    }
}

impl Invalidate for CatalogSearch {
    fn invalidate(&self, reason: &str) {
        info!(reason, "dropping vocabulary and result caches");
        self.search_cache.invalidate();
        self.facet_cache.invalidate();
        self.lookup.invalidate();
    }
}
