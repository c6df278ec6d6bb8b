use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// A named filter axis over which products can be filtered and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FacetCategory {
    Brand,
    #[serde(alias = "product_type", alias = "type")]
    ProductType,
    Sport,
    #[serde(alias = "color")]
    Colour,
    Fit,
    Sleeve,
    Neckline,
    Fabric,
    Sector,
    Feature,
}

/// How a category's terms are keyed for membership tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Lowercase and collapse whitespace; hyphens are significant.
    Plain,
    /// Additionally drop spaces, hyphens and underscores ("v-neck" == "v neck" == "vneck").
    CollapseSeparators,
}

impl FacetCategory {
    /// Classification priority: the first category that accepts a phrase wins it.
    pub const PRIORITY: [FacetCategory; 10] = [
        FacetCategory::Brand,
        FacetCategory::ProductType,
        FacetCategory::Sport,
        FacetCategory::Colour,
        FacetCategory::Fit,
        FacetCategory::Sleeve,
        FacetCategory::Neckline,
        FacetCategory::Fabric,
        FacetCategory::Sector,
        FacetCategory::Feature,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FacetCategory::Brand => "brand",
            FacetCategory::ProductType => "productType",
            FacetCategory::Sport => "sport",
            FacetCategory::Colour => "colour",
            FacetCategory::Fit => "fit",
            FacetCategory::Sleeve => "sleeve",
            FacetCategory::Neckline => "neckline",
            FacetCategory::Fabric => "fabric",
            FacetCategory::Sector => "sector",
            FacetCategory::Feature => "feature",
        }
    }

    pub fn is_single_valued(self) -> bool {
        matches!(self, FacetCategory::Brand | FacetCategory::ProductType)
    }

    pub fn normalization(self) -> Normalization {
        match self {
            FacetCategory::Brand
            | FacetCategory::ProductType
            | FacetCategory::Fit
            | FacetCategory::Sleeve
            | FacetCategory::Neckline
            | FacetCategory::Feature => Normalization::CollapseSeparators,
            FacetCategory::Sport
            | FacetCategory::Colour
            | FacetCategory::Fabric
            | FacetCategory::Sector => Normalization::Plain,
        }
    }

    /// Applies this category's normalization rule to a phrase.
    pub fn normalize(self, input: &str) -> String {
        let base = normalize_phrase(input);
        match self.normalization() {
            Normalization::Plain => base,
            Normalization::CollapseSeparators => base
                .chars()
                .filter(|ch| !matches!(ch, ' ' | '-' | '_'))
                .collect(),
        }
    }

    /// Categories whose vocabulary also answers to singular forms.
    fn folds_plurals(self) -> bool {
        matches!(self, FacetCategory::ProductType)
    }
}

impl fmt::Display for FacetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FacetCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let key: String = value
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|ch| !matches!(ch, '_' | '-' | ' '))
            .collect();
        match key.as_str() {
            "brand" | "brands" => Ok(FacetCategory::Brand),
            "type" | "producttype" | "producttypes" => Ok(FacetCategory::ProductType),
            "sport" | "sports" => Ok(FacetCategory::Sport),
            "colour" | "color" | "colours" | "colors" => Ok(FacetCategory::Colour),
            "fit" | "fits" => Ok(FacetCategory::Fit),
            "sleeve" | "sleeves" => Ok(FacetCategory::Sleeve),
            "neckline" | "necklines" | "neck" => Ok(FacetCategory::Neckline),
            "fabric" | "fabrics" => Ok(FacetCategory::Fabric),
            "sector" | "sectors" => Ok(FacetCategory::Sector),
            "feature" | "features" => Ok(FacetCategory::Feature),
            _ => Err(format!("unknown facet category {value:?}")),
        }
    }
}

/// Lowercase, trim and collapse internal whitespace.
pub fn normalize_phrase(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for word in input.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(word.chars().flat_map(char::to_lowercase));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyTerm {
    pub category: FacetCategory,
    pub slug: String,
    pub name: String,
    /// Relation the term was loaded from.
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynonymMapping {
    pub term: String,
    pub canonical: String,
    /// `None` applies to every category as a fallback.
    #[serde(default)]
    pub category: Option<FacetCategory>,
}

/// Raw rows a vocabulary source hands to the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VocabularyData {
    #[serde(default)]
    pub terms: Vec<VocabularyTerm>,
    #[serde(default)]
    pub synonyms: Vec<SynonymMapping>,
}

/// O(1) membership over one category's normalized keys.
#[derive(Debug, Clone)]
pub struct TermSet {
    category: FacetCategory,
    terms: Vec<VocabularyTerm>,
    by_key: HashMap<String, usize>,
}

impl TermSet {
    fn new(category: FacetCategory) -> Self {
        Self {
            category,
            terms: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    fn insert(&mut self, term: VocabularyTerm) {
        let idx = self.terms.len();
        let slug_spaced = term.slug.replace(['-', '_'], " ");
        let mut keys = vec![
            self.category.normalize(&term.slug),
            self.category.normalize(&slug_spaced),
            self.category.normalize(&term.name),
        ];
        if self.category.folds_plurals() {
            let singulars: Vec<String> = keys.iter().flat_map(|k| singular_forms(k)).collect();
            keys.extend(singulars);
        }
        let mut inserted = false;
        for key in keys {
            if key.is_empty() {
                continue;
            }
            if let Entry::Vacant(slot) = self.by_key.entry(key) {
                slot.insert(idx);
                inserted = true;
            }
        }
        if inserted {
            self.terms.push(term);
        }
    }

    pub fn category(&self) -> FacetCategory {
        self.category
    }

    /// Looks up a phrase after applying the category's normalization rule.
    pub fn get(&self, phrase: &str) -> Option<&VocabularyTerm> {
        self.by_key
            .get(&self.category.normalize(phrase))
            .map(|&idx| &self.terms[idx])
    }

    pub fn contains(&self, phrase: &str) -> bool {
        self.get(phrase).is_some()
    }

    pub fn by_slug(&self, slug: &str) -> Option<&VocabularyTerm> {
        self.terms.iter().find(|term| term.slug == slug)
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VocabularyTerm> {
        self.terms.iter()
    }
}

fn singular_forms(key: &str) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(stem) = key.strip_suffix("ies") {
        if !stem.is_empty() {
            out.push(format!("{stem}y"));
        }
    }
    if let Some(stem) = key.strip_suffix("es") {
        if stem.len() > 1 {
            out.push(stem.to_string());
        }
    }
    if key.ends_with('s') && !key.ends_with("ss") && key.len() > 2 {
        out.push(key[..key.len() - 1].to_string());
    }
    out
}

/// Immutable vocabulary view; replaced wholesale on refresh.
#[derive(Debug)]
pub struct VocabularySnapshot {
    generation: u64,
    loaded_at: Option<Instant>,
    sets: HashMap<FacetCategory, TermSet>,
    scoped_synonyms: HashMap<FacetCategory, HashMap<String, String>>,
    global_synonyms: HashMap<String, String>,
}

impl VocabularySnapshot {
    pub fn empty() -> Self {
        Self::build(VocabularyData::default(), 0, None)
    }

    pub fn build(data: VocabularyData, generation: u64, loaded_at: Option<Instant>) -> Self {
        let mut sets: HashMap<FacetCategory, TermSet> = FacetCategory::PRIORITY
            .iter()
            .map(|&category| (category, TermSet::new(category)))
            .collect();
        for term in data.terms {
            if term.slug.trim().is_empty() {
                continue;
            }
            if let Some(set) = sets.get_mut(&term.category) {
                set.insert(term);
            }
        }

        let mut scoped_synonyms: HashMap<FacetCategory, HashMap<String, String>> = HashMap::new();
        let mut global_synonyms = HashMap::new();
        for mapping in data.synonyms {
            let key = normalize_phrase(&mapping.term);
            let canonical = normalize_phrase(&mapping.canonical);
            if key.is_empty() || canonical.is_empty() || key == canonical {
                continue;
            }
            match mapping.category {
                Some(category) => {
                    let scoped = scoped_synonyms.entry(category).or_default();
                    let collapsed = category.normalize(&mapping.term);
                    scoped.entry(key).or_insert_with(|| canonical.clone());
                    scoped.entry(collapsed).or_insert(canonical);
                }
                None => {
                    global_synonyms.entry(key).or_insert(canonical);
                }
            }
        }

        Self {
            generation,
            loaded_at,
            sets,
            scoped_synonyms,
            global_synonyms,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> Option<Instant> {
        self.loaded_at
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(TermSet::is_empty)
    }

    pub fn term_count(&self) -> usize {
        self.sets.values().map(TermSet::len).sum()
    }

    pub fn synonym_count(&self) -> usize {
        self.global_synonyms.len() + self.scoped_synonyms.values().map(HashMap::len).sum::<usize>()
    }

    pub fn category(&self, category: FacetCategory) -> &TermSet {
        // Every category is seeded in `build`.
        &self.sets[&category]
    }

    pub fn brands(&self) -> &TermSet {
        self.category(FacetCategory::Brand)
    }

    pub fn product_types(&self) -> &TermSet {
        self.category(FacetCategory::ProductType)
    }

    pub fn sports(&self) -> &TermSet {
        self.category(FacetCategory::Sport)
    }

    pub fn colours(&self) -> &TermSet {
        self.category(FacetCategory::Colour)
    }

    pub fn fits(&self) -> &TermSet {
        self.category(FacetCategory::Fit)
    }

    pub fn sleeves(&self) -> &TermSet {
        self.category(FacetCategory::Sleeve)
    }

    pub fn necklines(&self) -> &TermSet {
        self.category(FacetCategory::Neckline)
    }

    pub fn fabrics(&self) -> &TermSet {
        self.category(FacetCategory::Fabric)
    }

    pub fn sectors(&self) -> &TermSet {
        self.category(FacetCategory::Sector)
    }

    pub fn features(&self) -> &TermSet {
        self.category(FacetCategory::Feature)
    }

    pub(crate) fn scoped_synonym(&self, category: FacetCategory, key: &str) -> Option<&str> {
        let scoped = self.scoped_synonyms.get(&category)?;
        scoped
            .get(key)
            .or_else(|| scoped.get(&category.normalize(key)))
            .map(String::as_str)
    }

    pub(crate) fn global_synonym(&self, key: &str) -> Option<&str> {
        self.global_synonyms.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(category: FacetCategory, slug: &str, name: &str) -> VocabularyTerm {
        VocabularyTerm {
            category,
            slug: slug.into(),
            name: name.into(),
            source: String::new(),
        }
    }

    #[test]
    fn collapse_rule_merges_hyphen_and_space_variants() {
        assert_eq!(FacetCategory::Neckline.normalize("V-Neck"), "vneck");
        assert_eq!(FacetCategory::Neckline.normalize(" v  neck "), "vneck");
        assert_eq!(FacetCategory::ProductType.normalize("T-Shirts"), "tshirts");
    }

    #[test]
    fn plain_rule_keeps_hyphens() {
        assert_eq!(FacetCategory::Colour.normalize("Off-White"), "off-white");
        assert_eq!(FacetCategory::Colour.normalize("  Navy   Blue"), "navy blue");
    }

    #[test]
    fn term_sets_match_slug_name_and_singulars() {
        let snapshot = VocabularySnapshot::build(
            VocabularyData {
                terms: vec![
                    term(FacetCategory::ProductType, "polos", "Polos"),
                    term(FacetCategory::ProductType, "t-shirts", "T-Shirts"),
                    term(FacetCategory::Colour, "navy-blue", "Navy Blue"),
                ],
                synonyms: Vec::new(),
            },
            1,
            None,
        );
        let types = snapshot.product_types();
        assert_eq!(types.get("polo").map(|t| t.slug.as_str()), Some("polos"));
        assert_eq!(types.get("t shirt").map(|t| t.slug.as_str()), Some("t-shirts"));
        assert!(types.contains("tshirts"));
        assert_eq!(
            snapshot.colours().get("navy blue").map(|t| t.slug.as_str()),
            Some("navy-blue")
        );
        assert!(snapshot.colours().contains("navy-blue"));
        assert_eq!(snapshot.term_count(), 3);
    }

    #[test]
    fn first_term_wins_a_shared_key() {
        let snapshot = VocabularySnapshot::build(
            VocabularyData {
                terms: vec![
                    term(FacetCategory::Brand, "gildan", "Gildan"),
                    term(FacetCategory::Brand, "gildan-2", "Gildan"),
                ],
                synonyms: Vec::new(),
            },
            1,
            None,
        );
        assert_eq!(snapshot.brands().get("gildan").unwrap().slug, "gildan");
    }

    #[test]
    fn category_names_parse_from_store_spellings() {
        assert_eq!("product_type".parse::<FacetCategory>(), Ok(FacetCategory::ProductType));
        assert_eq!("Color".parse::<FacetCategory>(), Ok(FacetCategory::Colour));
        assert_eq!("necklines".parse::<FacetCategory>(), Ok(FacetCategory::Neckline));
        assert!("size".parse::<FacetCategory>().is_err());
    }

    #[test]
    fn category_serializes_camel_case() {
        let json = serde_json::to_string(&FacetCategory::ProductType).unwrap();
        assert_eq!(json, "\"productType\"");
        let parsed: FacetCategory = serde_json::from_str("\"color\"").unwrap();
        assert_eq!(parsed, FacetCategory::Colour);
    }
}
