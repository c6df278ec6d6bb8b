//! Sidebar facet counts, price range and total for a classified query.
//!
//! Each category's count query applies every active filter except that
//! category's own, so the counts answer "what if I add this value". Total
//! and price range apply all filters. Queries fan out on a bounded
//! [`JoinSet`]; dropping the returned future aborts whatever is in flight.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::capabilities::{FacetCapabilities, FacetRelation, FacetSource, INDEX_TABLE, STYLE_KEY};
use crate::classify::ClassifiedQuery;
use crate::conditions::{BuiltConditions, ConditionBuilder, count_query, price_range_query};
use crate::config::SearchConfig;
use crate::error::{Result, SearchError};
use crate::scoring::ALIAS;
use crate::sql::{BuiltQuery, ParamBinder};
use crate::store::{CatalogStore, FacetCountRow, PriceRange, timed};
use crate::vocab::FacetCategory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetValue {
    pub slug: String,
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetsResponse {
    pub filters: BTreeMap<FacetCategory, Vec<FacetValue>>,
    pub price_range: PriceRange,
    pub total: i64,
    /// Categories that failed, timed out or have no backing relation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<FacetCategory>,
    /// A query failed or timed out, so the response is incomplete.
    #[serde(default)]
    pub degraded: bool,
}

/// Every statement one `aggregate` call will run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetPlan {
    pub categories: Vec<(FacetCategory, BuiltQuery)>,
    pub unavailable: Vec<FacetCategory>,
    pub total: BuiltQuery,
    pub price_range: BuiltQuery,
}

/// SELECT pieces that differ between facet shapes.
struct FacetShape {
    slug: String,
    name: String,
    joins: String,
    present: String,
}

fn shape(category: FacetCategory, source: FacetSource) -> Option<FacetShape> {
    let a = ALIAS;
    let column_shape = |column: &str, name_column: &str| FacetShape {
        slug: format!("{a}.{column}"),
        name: format!("COALESCE(MAX({a}.{name_column}), {a}.{column})"),
        joins: String::new(),
        present: format!("{a}.{column} IS NOT NULL"),
    };
    match category {
        FacetCategory::Brand => Some(column_shape("brand_slug", "brand_name")),
        FacetCategory::ProductType => Some(column_shape("product_type_slug", "product_type_name")),
        FacetCategory::Colour => Some(FacetShape {
            slug: format!(r"regexp_replace(lower(trim({a}.primary_colour)), '\s+', '-', 'g')"),
            name: format!("MAX(trim({a}.primary_colour))"),
            joins: String::new(),
            present: format!("trim({a}.primary_colour) <> ''"),
        }),
        _ => {
            let relation = FacetRelation::for_category(category)?;
            match source {
                FacetSource::JoinRelation => {
                    let mut joins = format!(
                        " JOIN {jt} fj ON fj.{key} = {a}.{key} JOIN {vt} fv ON fv.id = fj.{fk}",
                        jt = relation.join_table,
                        vt = relation.value_table,
                        fk = relation.value_fk,
                        key = STYLE_KEY,
                    );
                    if let Some(kind) = relation.keyword_type {
                        joins.push_str(&format!(" AND fv.keyword_type = '{kind}'"));
                    }
                    Some(FacetShape {
                        slug: "fv.slug".to_string(),
                        name: "MAX(fv.name)".to_string(),
                        joins,
                        present: "fv.slug IS NOT NULL".to_string(),
                    })
                }
                FacetSource::IndexArray => Some(FacetShape {
                    slug: "fu.slug".to_string(),
                    name: "MAX(fu.slug)".to_string(),
                    joins: format!(" CROSS JOIN LATERAL unnest({a}.{}) AS fu(slug)", relation.index_column),
                    present: "fu.slug IS NOT NULL".to_string(),
                }),
                FacetSource::Unavailable => None,
            }
        }
    }
}

/// One grouped count query for a category, or `None` when it has no source.
pub fn facet_query(
    category: FacetCategory,
    classified: &ClassifiedQuery,
    caps: &FacetCapabilities,
    config: &SearchConfig,
) -> Result<Option<BuiltQuery>> {
    let Some(shape) = shape(category, caps.source(category)) else {
        return Ok(None);
    };
    let scoped = classified.without(category);
    let conditions = ConditionBuilder::new(caps, config).build(&scoped, ALIAS, 1)?;
    let mut binder = ParamBinder::starting_at(conditions.next_index);
    let limit = binder.value(i64::from(config.facet_value_limit));
    let sql = format!(
        "SELECT {slug} AS slug, {name} AS name, COUNT(DISTINCT {a}.{STYLE_KEY}) AS count \
         FROM {INDEX_TABLE} {a}{joins} WHERE {where_clause} AND {present} \
         GROUP BY 1 HAVING COUNT(DISTINCT {a}.{STYLE_KEY}) > 0 \
         ORDER BY count DESC, slug ASC LIMIT {limit}",
        slug = shape.slug,
        name = shape.name,
        joins = shape.joins,
        present = shape.present,
        a = ALIAS,
        where_clause = conditions.where_clause(),
    );
    let mut params = conditions.params();
    params.extend(binder.into_params());
    BuiltQuery::new(sql, params).map(Some)
}

fn filtered(classified: &ClassifiedQuery, caps: &FacetCapabilities, config: &SearchConfig) -> Result<BuiltConditions> {
    ConditionBuilder::new(caps, config).build(classified, ALIAS, 1)
}

enum Partial {
    Category(FacetCategory, Result<Vec<FacetCountRow>>),
    Total(Result<i64>),
    Price(Result<PriceRange>),
}

/// Waits for a query slot, then runs a timed store call under a deadline.
pub(crate) async fn bounded<T, F>(
    permits: &Semaphore,
    limit: Duration,
    operation: &'static str,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let _permit = permits
        .acquire()
        .await
        .map_err(|_| SearchError::store(operation, "query limiter closed"))?;
    match tokio::time::timeout(limit, timed(operation, call)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(operation, timeout_ms = limit.as_millis() as u64, "store call timed out");
            Err(SearchError::QueryTimeout { operation })
        }
    }
}

pub struct FacetAggregator {
    store: Arc<dyn CatalogStore>,
    caps: Arc<FacetCapabilities>,
    config: Arc<SearchConfig>,
}

impl FacetAggregator {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        caps: Arc<FacetCapabilities>,
        config: Arc<SearchConfig>,
    ) -> Self {
        Self { store, caps, config }
    }

    pub fn plan(&self, classified: &ClassifiedQuery) -> Result<FacetPlan> {
        let mut categories = Vec::new();
        let mut unavailable = Vec::new();
        for category in FacetCategory::PRIORITY {
            match facet_query(category, classified, &self.caps, &self.config)? {
                Some(query) => categories.push((category, query)),
                None => unavailable.push(category),
            }
        }
        let conditions = filtered(classified, &self.caps, &self.config)?;
        Ok(FacetPlan {
            categories,
            unavailable,
            total: count_query(&conditions)?,
            price_range: price_range_query(&conditions)?,
        })
    }

    /// Runs every facet query plus total and price range. A failing or lost
    /// category degrades to empty; a failing total fails the call.
    pub async fn aggregate(&self, classified: &ClassifiedQuery) -> Result<FacetsResponse> {
        let plan = self.plan(classified)?;
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_queries.max(1)));
        let deadline = self.config.facet_timeout;
        let mut tasks = JoinSet::new();
        let planned: Vec<FacetCategory> = plan.categories.iter().map(|(category, _)| *category).collect();

        for (category, query) in plan.categories {
            let store = Arc::clone(&self.store);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let outcome = bounded(&permits, deadline, "facet_counts", store.fetch_facet_counts(category, &query)).await;
                Partial::Category(category, outcome)
            });
        }
        {
            let store = Arc::clone(&self.store);
            let permits = Arc::clone(&permits);
            let query = plan.total;
            tasks.spawn(async move {
                Partial::Total(bounded(&permits, deadline, "count", store.fetch_count(&query)).await)
            });
        }
        {
            let store = Arc::clone(&self.store);
            let permits = Arc::clone(&permits);
            let query = plan.price_range;
            tasks.spawn(async move {
                Partial::Price(bounded(&permits, deadline, "price_range", store.fetch_price_range(&query)).await)
            });
        }

        let mut response = FacetsResponse {
            unavailable: plan.unavailable,
            ..FacetsResponse::default()
        };
        for &category in &response.unavailable {
            response.filters.insert(category, Vec::new());
        }

        let mut total = None;
        let mut price_seen = false;
        while let Some(joined) = tasks.join_next().await {
            let partial = match joined {
                Ok(partial) => partial,
                Err(err) => {
                    warn!(error = %err, "facet task did not finish");
                    continue;
                }
            };
            match partial {
                Partial::Category(category, Ok(rows)) => {
                    let values: Vec<FacetValue> = rows
                        .into_iter()
                        .filter(|row| row.count > 0)
                        .map(|row| FacetValue {
                            slug: row.slug,
                            name: row.name,
                            count: row.count as u64,
                        })
                        .collect();
                    debug!(%category, values = values.len(), "facet counted");
                    response.filters.insert(category, values);
                }
                Partial::Category(category, Err(err)) => {
                    warn!(%category, error = %err, "facet degraded to empty");
                    response.filters.insert(category, Vec::new());
                    response.unavailable.push(category);
                    response.degraded = true;
                }
                Partial::Total(outcome) => total = Some(outcome?),
                Partial::Price(Ok(range)) => {
                    response.price_range = range;
                    price_seen = true;
                }
                Partial::Price(Err(err)) => {
                    warn!(error = %err, "price range unavailable");
                    response.degraded = true;
                    price_seen = true;
                }
            }
        }

        // Categories whose task was lost count as failed.
        for category in planned {
            if !response.filters.contains_key(&category) {
                response.filters.insert(category, Vec::new());
                response.unavailable.push(category);
                response.degraded = true;
            }
        }
        if !price_seen {
            response.degraded = true;
        }
        response.total = total.ok_or_else(|| SearchError::store("count", "count task did not finish"))?;
        response.unavailable.sort();
        Ok(response)
    }
}
