//! Query classification, ranked search and facet aggregation over a
//! wholesale apparel catalog.
//!
//! A raw query is split into facet filters (brand, product type, sport,
//! colour and so on), free text and an optional style code using a
//! vocabulary snapshot held by [`LookupCache`]. The classified query is
//! turned into parameterized SQL by [`ConditionBuilder`] and
//! [`ranked_query`], and [`CatalogSearch`] runs it against a
//! [`CatalogStore`].

pub mod capabilities;
pub mod classify;
pub mod clock;
pub mod conditions;
pub mod config;
pub mod error;
pub mod facets;
pub mod invalidation;
pub mod lookup;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod result_cache;
pub mod scoring;
pub mod service;
pub mod sql;
pub mod store;
pub mod synonyms;
pub mod vocab;

#[cfg(test)]
mod test_support;

pub use capabilities::{CapabilityProbe, FacetCapabilities, FacetRelation, FacetSource, SchemaInfo};
pub use classify::{Assignment, ClassifiedQuery, QueryClassifier, Segment};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conditions::{BuiltConditions, ConditionBuilder, ConditionKind, SearchCondition};
pub use config::{CacheConfig, SearchConfig};
pub use error::{Result, SearchError};
pub use facets::{FacetAggregator, FacetPlan, FacetValue, FacetsResponse};
pub use invalidation::{Invalidate, InvalidationBus, InvalidationSignal, spawn_invalidation_listener};
pub use lookup::{JsonVocabularySource, LookupCache, RefreshOutcome, VocabularySource};
#[cfg(feature = "postgres")]
pub use postgres::PgCatalogStore;
pub use result_cache::{CacheKey, ResultCache};
pub use scoring::{RelevanceWeights, SortOrder, order_by_clause, ranked_query, score_expression};
pub use service::{CatalogSearch, Explain, Pagination, SearchResults};
pub use sql::{BuiltQuery, Fragment, ParamBinder, SqlParam, count_placeholders};
pub use store::{CatalogStore, FacetCountRow, PriceRange, RankedRow};
pub use synonyms::SynonymResolver;
pub use vocab::{
    FacetCategory, Normalization, SynonymMapping, VocabularyData, VocabularySnapshot, VocabularyTerm,
};
