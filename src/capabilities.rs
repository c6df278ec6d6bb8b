//! Which data source backs each facet, decided once at startup.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::error::Result;
use crate::vocab::FacetCategory;

/// Read-optimized projection every search query runs against.
pub const INDEX_TABLE: &str = "product_search_index";
/// Column that links index rows to the many-to-many join relations.
pub const STYLE_KEY: &str = "style_code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FacetSource {
    /// Normalized join relation; correct regardless of index freshness.
    JoinRelation,
    /// Denormalized slug array on the index row.
    IndexArray,
    /// Neither source exists; the facet is neither filtered nor counted.
    Unavailable,
}

/// Static schema description of one multi-valued facet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacetRelation {
    pub category: FacetCategory,
    /// `(style_code, <value_fk>)` rows.
    pub join_table: &'static str,
    pub value_fk: &'static str,
    /// `(id, slug, name)` rows.
    pub value_table: &'static str,
    /// Discriminator when several categories share one value table.
    pub keyword_type: Option<&'static str>,
    pub index_column: &'static str,
}

const fn keyword(category: FacetCategory, kind: &'static str, column: &'static str) -> FacetRelation {
    FacetRelation {
        category,
        join_table: "style_keywords_mapping",
        value_fk: "keyword_id",
        value_table: "style_keywords",
        keyword_type: Some(kind),
        index_column: column,
    }
}

pub const RELATIONS: [FacetRelation; 7] = [
    FacetRelation {
        category: FacetCategory::Sport,
        join_table: "style_sports",
        value_fk: "sport_id",
        value_table: "sports",
        keyword_type: None,
        index_column: "sport_slugs",
    },
    keyword(FacetCategory::Fit, "fit", "fit_slugs"),
    keyword(FacetCategory::Sleeve, "sleeve", "sleeve_slugs"),
    keyword(FacetCategory::Neckline, "neckline", "neckline_slugs"),
    FacetRelation {
        category: FacetCategory::Fabric,
        join_table: "style_fabrics",
        value_fk: "fabric_id",
        value_table: "fabrics",
        keyword_type: None,
        index_column: "fabric_slugs",
    },
    FacetRelation {
        category: FacetCategory::Sector,
        join_table: "style_sectors",
        value_fk: "sector_id",
        value_table: "sectors",
        keyword_type: None,
        index_column: "sector_slugs",
    },
    keyword(FacetCategory::Feature, "feature", "feature_slugs"),
];

impl FacetRelation {
    pub fn for_category(category: FacetCategory) -> Option<&'static FacetRelation> {
        RELATIONS.iter().find(|relation| relation.category == category)
    }
}

/// What schema introspection found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaInfo {
    pub tables: BTreeSet<String>,
    /// Columns of [`INDEX_TABLE`].
    pub index_columns: BTreeSet<String>,
    pub extensions: BTreeSet<String>,
}

#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn probe_schema(&self) -> Result<SchemaInfo>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetCapabilities {
    sources: BTreeMap<FacetCategory, FacetSource>,
    /// `pg_trgm` is installed, so `%` similarity can back free text.
    pub trigram: bool,
    /// The index carries a `colour_slugs` array usable for scoring.
    pub colour_array: bool,
}

impl FacetCapabilities {
    /// Every relation present, trigram and colour array available.
    pub fn all_joins() -> Self {
        Self {
            sources: RELATIONS
                .iter()
                .map(|relation| (relation.category, FacetSource::JoinRelation))
                .collect(),
            trigram: true,
            colour_array: true,
        }
    }

    pub fn decide(schema: &SchemaInfo) -> Self {
        let sources = RELATIONS
            .iter()
            .map(|relation| {
                let source = if schema.tables.contains(relation.join_table)
                    && schema.tables.contains(relation.value_table)
                {
                    FacetSource::JoinRelation
                } else if schema.index_columns.contains(relation.index_column) {
                    FacetSource::IndexArray
                } else {
                    FacetSource::Unavailable
                };
                (relation.category, source)
            })
            .collect();
        Self {
            sources,
            trigram: schema.extensions.contains("pg_trgm"),
            colour_array: schema.index_columns.contains("colour_slugs"),
        }
    }

    /// Probes once and logs every decision.
    pub async fn detect(probe: &dyn CapabilityProbe) -> Result<Self> {
        let schema = probe.probe_schema().await?;
        let caps = Self::decide(&schema);
        for (category, source) in &caps.sources {
            match source {
                FacetSource::JoinRelation => {}
                FacetSource::IndexArray => {
                    info!(%category, "facet falls back to denormalized index array")
                }
                FacetSource::Unavailable => warn!(%category, "facet has no backing relation"),
            }
        }
        info!(
            trigram = caps.trigram,
            colour_array = caps.colour_array,
            "facet capabilities decided"
        );
        Ok(caps)
    }

    /// Source for a multi-valued facet. Single-valued facets and colour read
    /// index columns directly and always report `IndexArray`.
    pub fn source(&self, category: FacetCategory) -> FacetSource {
        self.sources
            .get(&category)
            .copied()
            .unwrap_or(FacetSource::IndexArray)
    }

    pub fn is_available(&self, category: FacetCategory) -> bool {
        self.source(category) != FacetSource::Unavailable
    }

    pub fn with_source(mut self, category: FacetCategory, source: FacetSource) -> Self {
        if FacetRelation::for_category(category).is_some() {
            self.sources.insert(category, source);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SearchError;

    struct FixedSchema(Option<SchemaInfo>);

    #[async_trait]
    impl CapabilityProbe for FixedSchema {
        async fn probe_schema(&self) -> Result<SchemaInfo> {
            self.0
                .clone()
                .ok_or_else(|| SearchError::store("schema", "connection refused"))
        }
    }

    fn schema(tables: &[&str], columns: &[&str], extensions: &[&str]) -> SchemaInfo {
        let set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        SchemaInfo {
            tables: set(tables),
            index_columns: set(columns),
            extensions: set(extensions),
        }
    }

    #[test]
    fn join_relation_is_preferred_over_index_array() {
        let caps = FacetCapabilities::decide(&schema(
            &["style_sports", "sports"],
            &["sport_slugs"],
            &[],
        ));
        assert_eq!(caps.source(FacetCategory::Sport), FacetSource::JoinRelation);
    }

    #[test]
    fn missing_value_table_falls_back_to_array() {
        let caps = FacetCapabilities::decide(&schema(
            &["style_keywords_mapping"],
            &["fit_slugs", "colour_slugs"],
            &["pg_trgm"],
        ));
        assert_eq!(caps.source(FacetCategory::Fit), FacetSource::IndexArray);
        assert_eq!(caps.source(FacetCategory::Sleeve), FacetSource::Unavailable);
        assert!(!caps.is_available(FacetCategory::Sleeve));
        assert!(caps.trigram);
        assert!(caps.colour_array);
    }

    #[test]
    fn single_valued_facets_are_always_available() {
        let caps = FacetCapabilities::decide(&SchemaInfo::default());
        assert!(caps.is_available(FacetCategory::Brand));
        assert!(caps.is_available(FacetCategory::Colour));
        assert!(!caps.trigram);
    }

    #[tokio::test]
    async fn detect_decides_from_introspected_schema() {
        let introspected = schema(
            &["style_sports", "sports", "style_keywords_mapping", "style_keywords"],
            &["fabric_slugs"],
            &["pg_trgm"],
        );
        let caps = FacetCapabilities::detect(&FixedSchema(Some(introspected.clone())))
            .await
            .unwrap();
        assert_eq!(caps, FacetCapabilities::decide(&introspected));
        assert_eq!(caps.source(FacetCategory::Sport), FacetSource::JoinRelation);
        assert_eq!(caps.source(FacetCategory::Fit), FacetSource::JoinRelation);
        assert_eq!(caps.source(FacetCategory::Fabric), FacetSource::IndexArray);
        assert_eq!(caps.source(FacetCategory::Sector), FacetSource::Unavailable);
        assert!(caps.trigram);
        assert!(!caps.colour_array);
    }

    #[tokio::test]
    async fn detect_propagates_introspection_failure() {
        let err = FacetCapabilities::detect(&FixedSchema(None)).await.unwrap_err();
        assert!(matches!(err, SearchError::Store { operation: "schema", .. }));
    }

    #[test]
    fn keyword_categories_share_one_relation() {
        let fit = FacetRelation::for_category(FacetCategory::Fit).unwrap();
        let feature = FacetRelation::for_category(FacetCategory::Feature).unwrap();
        assert_eq!(fit.join_table, feature.join_table);
        assert_ne!(fit.keyword_type, feature.keyword_type);
        assert!(FacetRelation::for_category(FacetCategory::Brand).is_none());
    }
}
