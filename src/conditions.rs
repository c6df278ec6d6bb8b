//! Turns a [`ClassifiedQuery`] into WHERE predicates with positional parameters.
//!
//! One fixed strategy per facet:
//! - brand and product type compare the index's denormalized slug columns;
//! - multi-valued facets test existence in their join relation (or the index
//!   array when the capability table says the relation is missing);
//! - colour matches the primary-colour text column;
//! - free text matches the text-search vector or trigram similarity on the name.
//!
//! Distinct facets are ANDed; values inside one facet are ORed via `ANY`.

use serde::Serialize;
use tracing::warn;

use crate::capabilities::{FacetCapabilities, FacetRelation, FacetSource, INDEX_TABLE, STYLE_KEY};
use crate::classify::ClassifiedQuery;
use crate::config::SearchConfig;
use crate::error::{Result, SearchError};
use crate::scoring::RelevanceWeights;
use crate::sql::{BuiltQuery, Fragment, ParamBinder, SqlParam};
use crate::vocab::FacetCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "category")]
pub enum ConditionKind {
    Facet(FacetCategory),
    FreeText,
    StyleCode,
}

/// One numbered predicate, its parameters and the relevance it contributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchCondition {
    pub kind: ConditionKind,
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuiltConditions {
    alias: String,
    pub conditions: Vec<SearchCondition>,
    /// First placeholder index not used by `conditions`.
    pub next_index: usize,
}

impl BuiltConditions {
    /// Live-row filter ANDed with every condition.
    pub fn where_clause(&self) -> String {
        let mut clause = format!("{}.sku_status = 'Live'", self.alias);
        for condition in &self.conditions {
            clause.push_str(" AND (");
            clause.push_str(&condition.sql);
            clause.push(')');
        }
        clause
    }

    pub fn params(&self) -> Vec<SqlParam> {
        self.conditions
            .iter()
            .flat_map(|condition| condition.params.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

pub struct ConditionBuilder<'a> {
    caps: &'a FacetCapabilities,
    config: &'a SearchConfig,
    weights: RelevanceWeights,
}

impl<'a> ConditionBuilder<'a> {
    pub fn new(caps: &'a FacetCapabilities, config: &'a SearchConfig) -> Self {
        Self {
            caps,
            config,
            weights: RelevanceWeights::default(),
        }
    }

    pub fn build(
        &self,
        classified: &ClassifiedQuery,
        alias: &str,
        start_index: usize,
    ) -> Result<BuiltConditions> {
        check_alias(alias)?;
        let mut binder = ParamBinder::starting_at(start_index);
        let mut conditions = Vec::new();

        if let Some(code) = &classified.style_code {
            let fragment = Fragment::new(
                format!("upper({alias}.style_code) = ? OR upper({alias}.style_code) LIKE ?"),
                vec![code.to_uppercase().into(), format!("{}%", like_escape(&code.to_uppercase())).into()],
            )?;
            conditions.push(bind(&mut binder, ConditionKind::StyleCode, fragment, self.weights.exact_code));
        }

        for category in FacetCategory::PRIORITY {
            let values = classified.values(category);
            if values.is_empty() {
                continue;
            }
            let Some(fragment) = self.facet_fragment(category, values, alias)? else {
                continue;
            };
            let weight = self.weights.facet(category);
            conditions.push(bind(&mut binder, ConditionKind::Facet(category), fragment, weight));
        }

        if classified.style_code.is_none() {
            if let Some(text) = classified.search_text() {
                let fragment = self.free_text_fragment(&text, alias)?;
                conditions.push(bind(&mut binder, ConditionKind::FreeText, fragment, self.weights.text_rank));
            }
        }

        Ok(BuiltConditions {
            alias: alias.to_string(),
            conditions,
            next_index: binder.next_index(),
        })
    }

    fn facet_fragment(
        &self,
        category: FacetCategory,
        values: &[String],
        alias: &str,
    ) -> Result<Option<Fragment>> {
        let slugs = SqlParam::TextArray(values.to_vec());
        let fragment = match category {
            FacetCategory::Brand => Fragment::new(format!("{alias}.brand_slug = ANY(?)"), vec![slugs])?,
            FacetCategory::ProductType => {
                Fragment::new(format!("{alias}.product_type_slug = ANY(?)"), vec![slugs])?
            }
            FacetCategory::Colour => Fragment::new(
                format!("{alias}.primary_colour ILIKE ANY(?)"),
                vec![SqlParam::TextArray(colour_patterns(values))],
            )?,
            _ => {
                let Some(relation) = FacetRelation::for_category(category) else {
                    return Ok(None);
                };
                match self.caps.source(category) {
                    FacetSource::JoinRelation => Fragment::new(
                        relation_exists(relation, alias, "= ANY(?)"),
                        vec![slugs],
                    )?,
                    FacetSource::IndexArray => Fragment::new(
                        format!("{alias}.{} && ?", relation.index_column),
                        vec![slugs],
                    )?,
                    FacetSource::Unavailable => {
                        warn!(%category, "skipping filter for facet without a backing relation");
                        return Ok(None);
                    }
                }
            }
        };
        Ok(Some(fragment))
    }

    fn free_text_fragment(&self, text: &str, alias: &str) -> Result<Fragment> {
        let config: SqlParam = self.config.text_search_config.clone().into();
        if self.caps.trigram {
            Fragment::new(
                format!(
                    "{alias}.search_vector @@ plainto_tsquery(?::regconfig, ?) OR {alias}.style_name % ?"
                ),
                vec![config, text.into(), text.into()],
            )
        } else {
            Fragment::new(
                format!(
                    "{alias}.search_vector @@ plainto_tsquery(?::regconfig, ?) OR {alias}.style_name ILIKE ?"
                ),
                vec![config, text.into(), contains_pattern(text).into()],
            )
        }
    }
}

fn bind(binder: &mut ParamBinder, kind: ConditionKind, fragment: Fragment, weight: u32) -> SearchCondition {
    let before = binder.params().len();
    let sql = binder.bind(fragment);
    SearchCondition {
        kind,
        sql,
        params: binder.params()[before..].to_vec(),
        weight,
    }
}

/// `EXISTS` subquery over a facet's join relation; `test` is applied to the value slug.
pub(crate) fn relation_exists(relation: &FacetRelation, alias: &str, test: &str) -> String {
    let join = format!("{alias}_j");
    let value = format!("{alias}_v");
    let mut sql = format!(
        "EXISTS (SELECT 1 FROM {jt} {join} JOIN {vt} {value} ON {value}.id = {join}.{fk} \
         WHERE {join}.{key} = {alias}.{key} AND {value}.slug {test}",
        jt = relation.join_table,
        vt = relation.value_table,
        fk = relation.value_fk,
        key = STYLE_KEY,
    );
    if let Some(kind) = relation.keyword_type {
        sql.push_str(&format!(" AND {value}.keyword_type = '{kind}'"));
    }
    sql.push(')');
    sql
}

/// Both spellings of a colour slug as case-insensitive contains patterns.
pub(crate) fn colour_patterns(slugs: &[String]) -> Vec<String> {
    let mut patterns = Vec::with_capacity(slugs.len() * 2);
    for slug in slugs {
        let spaced = slug.replace('-', " ");
        patterns.push(contains_pattern(slug));
        if spaced != *slug {
            patterns.push(contains_pattern(&spaced));
        }
    }
    patterns
}

pub(crate) fn contains_pattern(text: &str) -> String {
    format!("%{}%", like_escape(text))
}

pub(crate) fn like_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn check_alias(alias: &str) -> Result<()> {
    let valid = alias.chars().next().is_some_and(|ch| ch.is_ascii_lowercase())
        && alias.chars().all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(SearchError::Config(format!("invalid table alias {alias:?}")))
    }
}

/// `COUNT(DISTINCT style_code)` over every row the filters admit.
pub fn count_query(conditions: &BuiltConditions) -> Result<BuiltQuery> {
    BuiltQuery::new(
        format!(
            "SELECT COUNT(DISTINCT {a}.{STYLE_KEY}) FROM {INDEX_TABLE} {a} WHERE {}",
            conditions.where_clause(),
            a = conditions.alias,
        ),
        conditions.params(),
    )
}

/// `MIN`/`MAX` sell price over the filtered rows.
pub fn price_range_query(conditions: &BuiltConditions) -> Result<BuiltQuery> {
    BuiltQuery::new(
        format!(
            "SELECT MIN({a}.sell_price)::float8, MAX({a}.sell_price)::float8 FROM {INDEX_TABLE} {a} WHERE {}",
            conditions.where_clause(),
            a = conditions.alias,
        ),
        conditions.params(),
    )
}
