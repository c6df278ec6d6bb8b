//! Turns a raw search box query into facet filters plus residual free text.
//!
//! Tokens are scanned left to right with the longest phrase window first, so
//! "long sleeve" or "hooded sweatshirt" are claimed as one phrase before their
//! words are tried alone. Each window is tested against the vocabularies in
//! [`FacetCategory::PRIORITY`] order after synonym resolution; the first hit
//! consumes the window. Anything left over is free text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SearchConfig;
use crate::synonyms::SynonymResolver;
use crate::vocab::{FacetCategory, VocabularySnapshot};

static STYLE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]{1,4}[0-9]{2,5}[a-z]{0,3}$").expect("valid style code pattern"));

/// Where a run of input tokens ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "category")]
pub enum Assignment {
    Facet(FacetCategory),
    FreeText,
    StyleCode,
    /// A later brand or product type that conflicts with the one already chosen.
    Ignored(FacetCategory),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub tokens: Vec<String>,
    pub assignment: Assignment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
}

/// Structured form of a query: one field per facet plus free text.
///
/// `segments` records, in input order, which destination claimed each token
/// run, so every token is accounted for exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedQuery {
    pub brand: Option<String>,
    pub product_type: Option<String>,
    pub sports: Vec<String>,
    pub colours: Vec<String>,
    pub fits: Vec<String>,
    pub sleeves: Vec<String>,
    pub necklines: Vec<String>,
    pub fabrics: Vec<String>,
    pub sectors: Vec<String>,
    pub features: Vec<String>,
    pub free_text: Vec<String>,
    pub style_code: Option<String>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl ClassifiedQuery {
    /// Slugs selected for a category, in match order.
    pub fn values(&self, category: FacetCategory) -> &[String] {
        match category {
            FacetCategory::Brand => self.brand.as_slice(),
            FacetCategory::ProductType => self.product_type.as_slice(),
            FacetCategory::Sport => &self.sports,
            FacetCategory::Colour => &self.colours,
            FacetCategory::Fit => &self.fits,
            FacetCategory::Sleeve => &self.sleeves,
            FacetCategory::Neckline => &self.necklines,
            FacetCategory::Fabric => &self.fabrics,
            FacetCategory::Sector => &self.sectors,
            FacetCategory::Feature => &self.features,
        }
    }

    fn list_mut(&mut self, category: FacetCategory) -> Option<&mut Vec<String>> {
        match category {
            FacetCategory::Brand | FacetCategory::ProductType => None,
            FacetCategory::Sport => Some(&mut self.sports),
            FacetCategory::Colour => Some(&mut self.colours),
            FacetCategory::Fit => Some(&mut self.fits),
            FacetCategory::Sleeve => Some(&mut self.sleeves),
            FacetCategory::Neckline => Some(&mut self.necklines),
            FacetCategory::Fabric => Some(&mut self.fabrics),
            FacetCategory::Sector => Some(&mut self.sectors),
            FacetCategory::Feature => Some(&mut self.features),
        }
    }

    /// Clears one category's selection.
    pub fn clear(&mut self, category: FacetCategory) {
        match category {
            FacetCategory::Brand => self.brand = None,
            FacetCategory::ProductType => self.product_type = None,
            other => {
                if let Some(list) = self.list_mut(other) {
                    list.clear();
                }
            }
        }
    }

    /// Copy of this query with one category's filter removed.
    pub fn without(&self, category: FacetCategory) -> ClassifiedQuery {
        let mut copy = self.clone();
        copy.clear(category);
        copy
    }

    pub fn active_categories(&self) -> impl Iterator<Item = FacetCategory> + '_ {
        FacetCategory::PRIORITY
            .into_iter()
            .filter(|&category| !self.values(category).is_empty())
    }

    pub fn has_facets(&self) -> bool {
        self.active_categories().next().is_some()
    }

    /// Text handed to full-text, trigram and style-code matching.
    pub fn search_text(&self) -> Option<String> {
        if let Some(code) = &self.style_code {
            return Some(code.clone());
        }
        if self.free_text.is_empty() {
            None
        } else {
            Some(self.free_text.join(" "))
        }
    }

    /// All tokens in input order, regardless of where they were assigned.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.segments
            .iter()
            .flat_map(|segment| segment.tokens.iter().map(String::as_str))
    }

    fn push_free_text(&mut self, tokens: Vec<String>) {
        self.free_text.extend(tokens.iter().cloned());
        self.segments.push(Segment {
            tokens,
            assignment: Assignment::FreeText,
            canonical: None,
        });
    }

    fn assign(&mut self, category: FacetCategory, slug: String, tokens: Vec<String>) {
        if category.is_single_valued() {
            let slot = match category {
                FacetCategory::Brand => &mut self.brand,
                _ => &mut self.product_type,
            };
            match slot {
                Some(existing) if *existing != slug => {
                    debug!(
                        %category,
                        kept = %existing,
                        ignored = %slug,
                        "ignoring later single-valued match"
                    );
                    self.segments.push(Segment {
                        tokens,
                        assignment: Assignment::Ignored(category),
                        canonical: Some(slug),
                    });
                    return;
                }
                Some(_) => {}
                None => *slot = Some(slug.clone()),
            }
        } else if let Some(list) = self.list_mut(category) {
            if !list.contains(&slug) {
                list.push(slug.clone());
            }
        }
        self.segments.push(Segment {
            tokens,
            assignment: Assignment::Facet(category),
            canonical: Some(slug),
        });
    }

    fn style_code_lookup(token: String) -> ClassifiedQuery {
        ClassifiedQuery {
            style_code: Some(token.to_uppercase()),
            segments: vec![Segment {
                tokens: vec![token],
                assignment: Assignment::StyleCode,
                canonical: None,
            }],
            ..ClassifiedQuery::default()
        }
    }
}

/// Strips control characters, collapses whitespace and truncates on a char boundary.
pub fn sanitize(raw: &str, max_chars: usize) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| if ch.is_control() { ' ' } else { ch })
        .take(max_chars)
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased tokens; punctuation other than `- & ' / .` separates words.
pub fn tokenize(input: &str, max_tokens: usize) -> Vec<String> {
    input
        .split(|ch: char| {
            ch.is_whitespace()
                || !(ch.is_alphanumeric() || matches!(ch, '-' | '&' | '\'' | '/' | '.'))
        })
        .map(|raw| raw.trim_matches(|ch: char| matches!(ch, '-' | '\'' | '.' | '/')))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .take(max_tokens)
        .collect()
}

pub struct QueryClassifier<'a> {
    snapshot: &'a VocabularySnapshot,
    resolver: SynonymResolver<'a>,
    config: &'a SearchConfig,
}

impl<'a> QueryClassifier<'a> {
    pub fn new(snapshot: &'a VocabularySnapshot, config: &'a SearchConfig) -> Self {
        Self {
            snapshot,
            resolver: SynonymResolver::new(snapshot),
            config,
        }
    }

    pub fn classify(&self, raw: &str) -> ClassifiedQuery {
        let cleaned = sanitize(raw, self.config.max_query_chars);
        let tokens = tokenize(&cleaned, self.config.max_tokens);
        if tokens.is_empty() {
            return ClassifiedQuery::default();
        }
        if tokens.len() == 1 && STYLE_CODE.is_match(&tokens[0]) {
            return ClassifiedQuery::style_code_lookup(tokens[0].clone());
        }

        let classified = self.classify_tokens(&tokens);
        if tokens.len() == 1 && !classified.has_facets() && self.is_short_code(&tokens[0]) {
            return ClassifiedQuery::style_code_lookup(tokens[0].clone());
        }
        classified
    }

    fn is_short_code(&self, token: &str) -> bool {
        token.chars().count() <= self.config.style_code_max_len
            && token.chars().all(|ch| ch.is_ascii_alphanumeric())
    }

    fn classify_tokens(&self, tokens: &[String]) -> ClassifiedQuery {
        let mut classified = ClassifiedQuery::default();
        let max_window = self.config.max_window.max(1);
        let mut idx = 0;
        while idx < tokens.len() {
            let widest = max_window.min(tokens.len() - idx);
            let hit = (1..=widest).rev().find_map(|width| {
                let phrase = tokens[idx..idx + width].join(" ");
                self.match_phrase(&phrase).map(|found| (width, found))
            });
            match hit {
                Some((width, (category, slug))) => {
                    classified.assign(category, slug, tokens[idx..idx + width].to_vec());
                    idx += width;
                }
                None => {
                    classified.push_free_text(vec![tokens[idx].clone()]);
                    idx += 1;
                }
            }
        }
        classified
    }

    /// First category in priority order whose vocabulary accepts the phrase.
    ///
    /// The phrase is resolved to its canonical form once, up front; the raw
    /// phrase is only tried when the canonical form matches nothing.
    pub fn match_phrase(&self, phrase: &str) -> Option<(FacetCategory, String)> {
        let canonical = self.resolver.canonical(phrase);
        self.first_match(&canonical).or_else(|| {
            if canonical == phrase {
                None
            } else {
                self.first_match(phrase)
            }
        })
    }

    fn first_match(&self, phrase: &str) -> Option<(FacetCategory, String)> {
        FacetCategory::PRIORITY.into_iter().find_map(|category| {
            self.snapshot
                .category(category)
                .get(phrase)
                .map(|term| (category, term.slug.clone()))
        })
    }
}
