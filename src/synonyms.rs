use std::borrow::Cow;

use crate::vocab::{FacetCategory, VocabularySnapshot, normalize_phrase};

/// Maps colloquial spellings onto canonical vocabulary phrases.
///
/// Lookups are scoped to a category first and fall back to uncategorized
/// mappings on a miss. A token with no mapping resolves to itself.
#[derive(Clone, Copy)]
pub struct SynonymResolver<'a> {
    snapshot: &'a VocabularySnapshot,
}

impl<'a> SynonymResolver<'a> {
    pub fn new(snapshot: &'a VocabularySnapshot) -> Self {
        Self { snapshot }
    }

    pub fn resolve<'t>(&self, token: &'t str, category: Option<FacetCategory>) -> Cow<'t, str>
    where
        'a: 't,
    {
        let key = normalize_phrase(token);
        if let Some(category) = category {
            if let Some(canonical) = self.snapshot.scoped_synonym(category, &key) {
                return Cow::Borrowed(canonical);
            }
        }
        match self.snapshot.global_synonym(&key) {
            Some(canonical) => Cow::Borrowed(canonical),
            None => Cow::Borrowed(token),
        }
    }

    /// Canonical phrase for a window before any category is chosen.
    ///
    /// Scoped mappings are tried in [`FacetCategory::PRIORITY`] order, then the
    /// uncategorized ones.
    pub fn canonical<'t>(&self, phrase: &'t str) -> Cow<'t, str>
    where
        'a: 't,
    {
        let key = normalize_phrase(phrase);
        FacetCategory::PRIORITY
            .into_iter()
            .find_map(|category| self.snapshot.scoped_synonym(category, &key))
            .or_else(|| self.snapshot.global_synonym(&key))
            .map_or(Cow::Borrowed(phrase), Cow::Borrowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::{SynonymMapping, VocabularyData};

    fn snapshot() -> VocabularySnapshot {
        VocabularySnapshot::build(
            VocabularyData {
                terms: Vec::new(),
                synonyms: vec![
                    SynonymMapping {
                        term: "hoodie".into(),
                        canonical: "hooded sweatshirt".into(),
                        category: Some(FacetCategory::ProductType),
                    },
                    SynonymMapping {
                        term: "footy".into(),
                        canonical: "football".into(),
                        category: Some(FacetCategory::Sport),
                    },
                    SynonymMapping {
                        term: "grey".into(),
                        canonical: "gray".into(),
                        category: None,
                    },
                    SynonymMapping {
                        term: "crew".into(),
                        canonical: "crew neck".into(),
                        category: None,
                    },
                    SynonymMapping {
                        term: "crew".into(),
                        canonical: "crew clothing".into(),
                        category: Some(FacetCategory::Brand),
                    },
                ],
            },
            1,
            None,
        )
    }

    #[test]
    fn scoped_mapping_only_applies_to_its_category() {
        let snapshot = snapshot();
        let resolver = SynonymResolver::new(&snapshot);
        assert_eq!(
            resolver.resolve("Hoodie", Some(FacetCategory::ProductType)),
            "hooded sweatshirt"
        );
        assert_eq!(resolver.resolve("hoodie", Some(FacetCategory::Sport)), "hoodie");
        assert_eq!(resolver.resolve("footy", Some(FacetCategory::Sport)), "football");
    }

    #[test]
    fn global_mapping_is_the_fallback() {
        let snapshot = snapshot();
        let resolver = SynonymResolver::new(&snapshot);
        assert_eq!(resolver.resolve("grey", Some(FacetCategory::Colour)), "gray");
        assert_eq!(resolver.resolve("grey", None), "gray");
        assert_eq!(resolver.resolve("crew", Some(FacetCategory::Brand)), "crew clothing");
        assert_eq!(resolver.resolve("crew", Some(FacetCategory::Neckline)), "crew neck");
    }

    #[test]
    fn canonical_prefers_scoped_mappings_in_priority_order() {
        let snapshot = snapshot();
        let resolver = SynonymResolver::new(&snapshot);
        assert_eq!(resolver.canonical("crew"), "crew clothing");
        assert_eq!(resolver.canonical("Footy"), "football");
        assert_eq!(resolver.canonical("grey"), "gray");
        assert_eq!(resolver.canonical("polo"), "polo");
    }

    #[test]
    fn unknown_token_resolves_to_itself() {
        let snapshot = snapshot();
        let resolver = SynonymResolver::new(&snapshot);
        assert_eq!(resolver.resolve("xyzzy", None), "xyzzy");
    }
}
