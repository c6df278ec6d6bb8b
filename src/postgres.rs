//! Postgres-backed store, vocabulary source and capability probe.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::{QueryAs, QueryScalar};
use sqlx::{Executor, PgPool, Postgres};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::capabilities::{CapabilityProbe, INDEX_TABLE, SchemaInfo};
use crate::error::Result;
use crate::lookup::VocabularySource;
use crate::sql::{BuiltQuery, SqlParam};
use crate::store::{CatalogStore, FacetCountRow, PriceRange, RankedRow};
use crate::vocab::{FacetCategory, SynonymMapping, VocabularyData, VocabularyTerm};

const VOCABULARY_SQL: &str = "\
SELECT 'brand' AS category, slug, name, 'brands' AS source FROM brands
UNION ALL SELECT 'productType', slug, name, 'product_types' FROM product_types
UNION ALL SELECT 'sport', slug, name, 'sports' FROM sports
UNION ALL SELECT 'colour', slug, name, 'colours' FROM colours
UNION ALL SELECT 'fabric', slug, name, 'fabrics' FROM fabrics
UNION ALL SELECT 'sector', slug, name, 'sectors' FROM sectors
UNION ALL SELECT keyword_type, slug, name, 'style_keywords' FROM style_keywords
    WHERE keyword_type IN ('fit', 'sleeve', 'neckline', 'feature')";

const SYNONYM_SQL: &str = "SELECT term, canonical, category FROM search_synonyms";

#[derive(Debug, sqlx::FromRow)]
struct TermRecord {
    category: String,
    slug: String,
    name: String,
    source: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SynonymRecord {
    term: String,
    canonical: String,
    category: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct RankedRecord {
    id: i64,
    style_code: String,
    style_name: String,
    brand_slug: Option<String>,
    product_type_slug: Option<String>,
    primary_colour: Option<String>,
    sell_price: Option<f64>,
    score: f64,
}

impl From<RankedRecord> for RankedRow {
    fn from(record: RankedRecord) -> Self {
        Self {
            id: record.id,
            style_code: record.style_code,
            style_name: record.style_name,
            brand: record.brand_slug,
            product_type: record.product_type_slug,
            primary_colour: record.primary_colour,
            sell_price: record.sell_price,
            score: record.score,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CountRecord {
    slug: String,
    name: String,
    count: i64,
}

fn bind_as<'q, O>(
    mut query: QueryAs<'q, Postgres, O, PgArguments>,
    params: &'q [SqlParam],
) -> QueryAs<'q, Postgres, O, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(value) => query.bind(value.as_str()),
            SqlParam::TextArray(values) => query.bind(values.as_slice()),
            SqlParam::Int(value) => query.bind(*value),
            SqlParam::Float(value) => query.bind(*value),
        };
    }
    query
}

fn bind_scalar<'q, O>(
    mut query: QueryScalar<'q, Postgres, O, PgArguments>,
    params: &'q [SqlParam],
) -> QueryScalar<'q, Postgres, O, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(value) => query.bind(value.as_str()),
            SqlParam::TextArray(values) => query.bind(values.as_slice()),
            SqlParam::Int(value) => query.bind(*value),
            SqlParam::Float(value) => query.bind(*value),
        };
    }
    query
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    /// Opens a pool whose sessions use `trigram_threshold` for `%` similarity.
    pub async fn connect(url: &str, max_connections: u32, trigram_threshold: f32) -> Result<Self> {
        let set_threshold = format!("SET pg_trgm.similarity_threshold = {trigram_threshold}");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .after_connect(move |conn, _meta| {
                let statement = set_threshold.clone();
                Box::pin(async move {
                    conn.execute(statement.as_str()).await?;
                    Ok(())
                })
            })
            .connect(url)
            .await?;
        info!(max_connections, "connected to catalog database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn fetch_ranked(&self, query: &BuiltQuery) -> Result<Vec<RankedRow>> {
        let rows = bind_as(sqlx::query_as::<_, RankedRecord>(&query.sql), &query.params)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(RankedRow::from).collect())
    }

    async fn fetch_count(&self, query: &BuiltQuery) -> Result<i64> {
        let total = bind_scalar(sqlx::query_scalar::<_, Option<i64>>(&query.sql), &query.params)
            .fetch_one(&self.pool)
            .await?;
        Ok(total.unwrap_or(0))
    }

    async fn fetch_facet_counts(
        &self,
        category: FacetCategory,
        query: &BuiltQuery,
    ) -> Result<Vec<FacetCountRow>> {
        let rows = bind_as(sqlx::query_as::<_, CountRecord>(&query.sql), &query.params)
            .fetch_all(&self.pool)
            .await?;
        debug!(%category, rows = rows.len(), "facet rows fetched");
        Ok(rows
            .into_iter()
            .map(|row| FacetCountRow {
                slug: row.slug,
                name: row.name,
                count: row.count,
            })
            .collect())
    }

    async fn fetch_price_range(&self, query: &BuiltQuery) -> Result<PriceRange> {
        let (min, max) = bind_as(
            sqlx::query_as::<_, (Option<f64>, Option<f64>)>(&query.sql),
            &query.params,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(PriceRange { min, max })
    }
}

#[async_trait]
impl VocabularySource for PgCatalogStore {
    async fn load_vocabulary(&self) -> Result<VocabularyData> {
        let started = Instant::now();
        let term_rows = sqlx::query_as::<_, TermRecord>(VOCABULARY_SQL)
            .fetch_all(&self.pool)
            .await?;
        let synonym_rows = sqlx::query_as::<_, SynonymRecord>(SYNONYM_SQL)
            .fetch_all(&self.pool)
            .await?;

        let mut terms = Vec::with_capacity(term_rows.len());
        for row in term_rows {
            match row.category.parse::<FacetCategory>() {
                Ok(category) => terms.push(VocabularyTerm {
                    category,
                    slug: row.slug,
                    name: row.name,
                    source: row.source,
                }),
                Err(err) => debug!(error = %err, source = %row.source, "skipping vocabulary row"),
            }
        }

        let mut synonyms = Vec::with_capacity(synonym_rows.len());
        for row in synonym_rows {
            let category = match row.category.as_deref().map(str::trim) {
                None | Some("") => None,
                Some(raw) => match raw.parse::<FacetCategory>() {
                    Ok(category) => Some(category),
                    Err(err) => {
                        warn!(error = %err, term = %row.term, "skipping synonym with unknown category");
                        continue;
                    }
                },
            };
            synonyms.push(SynonymMapping {
                term: row.term,
                canonical: row.canonical,
                category,
            });
        }

        debug!(
            operation = "load_vocabulary",
            terms = terms.len(),
            synonyms = synonyms.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "vocabulary rows read"
        );
        Ok(VocabularyData { terms, synonyms })
    }
}

#[async_trait]
impl CapabilityProbe for PgCatalogStore {
    async fn probe_schema(&self) -> Result<SchemaInfo> {
        let tables = sqlx::query_scalar::<_, String>(
            "SELECT table_name::text FROM information_schema.tables WHERE table_schema = current_schema()",
        )
        .fetch_all(&self.pool)
        .await?;
        let index_columns = sqlx::query_scalar::<_, String>(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(INDEX_TABLE)
        .fetch_all(&self.pool)
        .await?;
        let extensions = sqlx::query_scalar::<_, String>("SELECT extname::text FROM pg_extension")
            .fetch_all(&self.pool)
            .await?;
        Ok(SchemaInfo {
            tables: tables.into_iter().collect(),
            index_columns: index_columns.into_iter().collect(),
            extensions: extensions.into_iter().collect(),
        })
    }
}
