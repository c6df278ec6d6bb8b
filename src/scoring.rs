//! Deterministic relevance scoring and the paginated ranked query.
//!
//! The score is a SQL expression evaluated inside the same statement that
//! applies LIMIT/OFFSET, so pages never depend on a post-fetch re-sort.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::capabilities::{FacetCapabilities, FacetRelation, FacetSource, INDEX_TABLE, STYLE_KEY};
use crate::classify::ClassifiedQuery;
use crate::conditions::{ConditionBuilder, colour_patterns, contains_pattern, like_escape, relation_exists};
use crate::config::SearchConfig;
use crate::error::Result;
use crate::sql::{BuiltQuery, Fragment, ParamBinder, SqlParam};
use crate::vocab::FacetCategory;

/// Alias of [`INDEX_TABLE`] in every generated statement.
pub const ALIAS: &str = "p";

/// Alias of the per-style subquery the ranked statement pages over.
const STYLE_ALIAS: &str = "r";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelevanceWeights {
    pub exact_code: u32,
    pub prefix_code: u32,
    /// Ceiling for the scaled full-text rank.
    pub text_rank: u32,
    pub name_contains: u32,
    pub colour_array: u32,
    pub colour_text: u32,
    pub fabric: u32,
    pub neckline: u32,
    pub sleeve: u32,
    pub style_keyword: u32,
}

impl Default for RelevanceWeights {
    fn default() -> Self {
        Self {
            exact_code: 100,
            prefix_code: 80,
            text_rank: 60,
            name_contains: 40,
            colour_array: 30,
            colour_text: 25,
            fabric: 25,
            neckline: 20,
            sleeve: 20,
            style_keyword: 15,
        }
    }
}

impl RelevanceWeights {
    /// Weight earned per matched value of a facet. Brand, product type,
    /// sport and sector filter without scoring.
    pub fn facet(&self, category: FacetCategory) -> u32 {
        match category {
            FacetCategory::Colour => self.colour_text,
            FacetCategory::Fabric => self.fabric,
            FacetCategory::Neckline => self.neckline,
            FacetCategory::Sleeve => self.sleeve,
            FacetCategory::Fit | FacetCategory::Feature => self.style_keyword,
            FacetCategory::Brand
            | FacetCategory::ProductType
            | FacetCategory::Sport
            | FacetCategory::Sector => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Relevance,
    PriceAsc,
    PriceDesc,
    Newest,
    Name,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Relevance => "relevance",
            SortOrder::PriceAsc => "price_asc",
            SortOrder::PriceDesc => "price_desc",
            SortOrder::Newest => "newest",
            SortOrder::Name => "name",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "relevance" | "" => Ok(SortOrder::Relevance),
            "price_asc" | "price" => Ok(SortOrder::PriceAsc),
            "price_desc" => Ok(SortOrder::PriceDesc),
            "newest" => Ok(SortOrder::Newest),
            "name" => Ok(SortOrder::Name),
            other => Err(format!("unknown sort order {other:?}")),
        }
    }
}

/// ORDER BY list; every order ends on creation time then id.
pub fn order_by_clause(sort: SortOrder, alias: &str) -> String {
    let lead = match sort {
        SortOrder::Relevance => "score DESC, ".to_string(),
        SortOrder::PriceAsc => format!("{alias}.sell_price ASC NULLS LAST, score DESC, "),
        SortOrder::PriceDesc => format!("{alias}.sell_price DESC NULLS LAST, score DESC, "),
        SortOrder::Newest => String::new(),
        SortOrder::Name => format!("{alias}.style_name ASC, "),
    };
    format!("{lead}{alias}.created_at DESC, {alias}.id ASC")
}

/// Sum of per-match weights, as a float8 SQL expression.
pub fn score_expression(
    classified: &ClassifiedQuery,
    alias: &str,
    caps: &FacetCapabilities,
    config: &SearchConfig,
    weights: &RelevanceWeights,
    binder: &mut ParamBinder,
) -> Result<String> {
    let mut terms: Vec<String> = Vec::new();

    if let Some(code) = &classified.style_code {
        let code = code.to_uppercase();
        terms.push(binder.bind(Fragment::new(
            format!(
                "CASE WHEN upper({alias}.style_code) = ? THEN {} WHEN upper({alias}.style_code) LIKE ? THEN {} ELSE 0 END",
                weights.exact_code, weights.prefix_code
            ),
            vec![code.clone().into(), format!("{}%", like_escape(&code)).into()],
        )?));
    } else if let Some(text) = classified.search_text() {
        terms.push(binder.bind(Fragment::new(
            format!(
                "LEAST(ts_rank({alias}.search_vector, plainto_tsquery(?::regconfig, ?)), 1.0) * {}",
                weights.text_rank
            ),
            vec![config.text_search_config.clone().into(), text.clone().into()],
        )?));
        terms.push(binder.bind(Fragment::new(
            format!(
                "CASE WHEN {alias}.style_name ILIKE ? THEN {} ELSE 0 END",
                weights.name_contains
            ),
            vec![contains_pattern(&text).into()],
        )?));
    }

    for colour in &classified.colours {
        if caps.colour_array {
            terms.push(binder.bind(Fragment::new(
                format!(
                    "CASE WHEN ? = ANY({alias}.colour_slugs) THEN {} ELSE 0 END",
                    weights.colour_array
                ),
                vec![colour.clone().into()],
            )?));
        }
        terms.push(binder.bind(Fragment::new(
            format!(
                "CASE WHEN {alias}.primary_colour ILIKE ANY(?) THEN {} ELSE 0 END",
                weights.colour_text
            ),
            vec![SqlParam::TextArray(colour_patterns(std::slice::from_ref(colour)))],
        )?));
    }

    for category in [
        FacetCategory::Fabric,
        FacetCategory::Neckline,
        FacetCategory::Sleeve,
        FacetCategory::Fit,
        FacetCategory::Feature,
    ] {
        let Some(relation) = FacetRelation::for_category(category) else {
            continue;
        };
        let weight = weights.facet(category);
        for value in classified.values(category) {
            let test = match caps.source(category) {
                FacetSource::JoinRelation => relation_exists(relation, alias, "= ?"),
                FacetSource::IndexArray => format!("? = ANY({alias}.{})", relation.index_column),
                FacetSource::Unavailable => continue,
            };
            terms.push(binder.bind(Fragment::new(
                format!("CASE WHEN {test} THEN {weight} ELSE 0 END"),
                vec![value.clone().into()],
            )?));
        }
    }

    if terms.is_empty() {
        Ok("0::float8".to_string())
    } else {
        Ok(format!("({})::float8", terms.join(" + ")))
    }
}

/// The paginated, scored and ordered search statement.
pub fn ranked_query(
    classified: &ClassifiedQuery,
    sort: SortOrder,
    limit: i64,
    offset: i64,
    caps: &FacetCapabilities,
    config: &SearchConfig,
) -> Result<BuiltQuery> {
    let conditions = ConditionBuilder::new(caps, config).build(classified, ALIAS, 1)?;
    let mut binder = ParamBinder::starting_at(conditions.next_index);
    let score = score_expression(
        classified,
        ALIAS,
        caps,
        config,
        &RelevanceWeights::default(),
        &mut binder,
    )?;
    let limit = binder.value(limit);
    let offset = binder.value(offset);

    // One row per style: its best-scoring SKU.
    let sql = format!(
        "SELECT {r}.id, {r}.style_code, {r}.style_name, {r}.brand_slug, {r}.product_type_slug, \
         {r}.primary_colour, {r}.sell_price, {r}.score FROM (\
         SELECT DISTINCT ON ({a}.{STYLE_KEY}) {a}.id, {a}.style_code, {a}.style_name, {a}.brand_slug, \
         {a}.product_type_slug, {a}.primary_colour, {a}.sell_price::float8 AS sell_price, \
         {a}.created_at, {score} AS score \
         FROM {INDEX_TABLE} {a} WHERE {where_clause} \
         ORDER BY {a}.{STYLE_KEY}, score DESC, {a}.sell_price ASC NULLS LAST, {a}.id ASC\
         ) {r} ORDER BY {order} LIMIT {limit} OFFSET {offset}",
        a = ALIAS,
        r = STYLE_ALIAS,
        where_clause = conditions.where_clause(),
        order = order_by_clause(sort, STYLE_ALIAS),
    );
    let mut params = conditions.params();
    params.extend(binder.into_params());
    BuiltQuery::new(sql, params)
}
