//! Positional-parameter SQL assembly.
//!
//! Fragments are written with `?` markers and renumbered to `$n` as they are
//! bound, so no call site ever counts parameters by hand. Both steps check
//! that markers and parameters line up.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::error::{Result, SearchError};

/// A value bound to one positional placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlParam {
    Text(String),
    TextArray(Vec<String>),
    Int(i64),
    Float(f64),
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<Vec<String>> for SqlParam {
    fn from(value: Vec<String>) -> Self {
        SqlParam::TextArray(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Float(value)
    }
}

/// Unnumbered SQL text with one parameter per `?`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    sql: String,
    params: Vec<SqlParam>,
}

impl Fragment {
    pub fn new(sql: impl Into<String>, params: Vec<SqlParam>) -> Result<Self> {
        let sql = sql.into();
        let placeholders = count_placeholders(&sql);
        if placeholders != params.len() {
            return Err(SearchError::ParameterMismatch {
                placeholders,
                params: params.len(),
            });
        }
        Ok(Self { sql, params })
    }

    /// Fragment with no parameters.
    pub fn raw(sql: impl Into<String>) -> Result<Self> {
        Self::new(sql, Vec::new())
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }
}

/// Counts `?` markers outside single-quoted literals.
pub fn count_placeholders(sql: &str) -> usize {
    let mut in_literal = false;
    let mut count = 0;
    for ch in sql.chars() {
        match ch {
            '\'' => in_literal = !in_literal,
            '?' if !in_literal => count += 1,
            _ => {}
        }
    }
    count
}

/// Distinct `$n` placeholder numbers outside single-quoted literals.
pub fn numbered_placeholders(sql: &str) -> BTreeSet<usize> {
    let mut found = BTreeSet::new();
    let mut in_literal = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        match ch {
            '\'' => in_literal = !in_literal,
            '$' if !in_literal => {
                let mut digits = String::new();
                while let Some(&(_, next)) = chars.peek() {
                    if !next.is_ascii_digit() {
                        break;
                    }
                    digits.push(next);
                    chars.next();
                }
                if let Ok(n) = digits.parse() {
                    found.insert(n);
                }
            }
            _ => {}
        }
    }
    found
}

/// Renumbers fragments into `$n` placeholders starting at a given index.
#[derive(Debug, Clone)]
pub struct ParamBinder {
    next: usize,
    params: Vec<SqlParam>,
}

impl Default for ParamBinder {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl ParamBinder {
    pub fn starting_at(start: usize) -> Self {
        Self {
            next: start.max(1),
            params: Vec::new(),
        }
    }

    /// Index the next bound parameter will receive.
    pub fn next_index(&self) -> usize {
        self.next
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }

    pub fn into_params(self) -> Vec<SqlParam> {
        self.params
    }

    /// Binds one value and returns its placeholder.
    pub fn value(&mut self, param: impl Into<SqlParam>) -> String {
        let placeholder = format!("${}", self.next);
        self.next += 1;
        self.params.push(param.into());
        placeholder
    }

    /// Renumbers a fragment's `?` markers and takes its parameters.
    pub fn bind(&mut self, fragment: Fragment) -> String {
        let Fragment { sql, params } = fragment;
        let mut params = params.into_iter();
        let mut out = String::with_capacity(sql.len() + 8);
        let mut in_literal = false;
        for ch in sql.chars() {
            match ch {
                '\'' => {
                    in_literal = !in_literal;
                    out.push(ch);
                }
                '?' if !in_literal => match params.next() {
                    Some(param) => out.push_str(&self.value(param)),
                    None => out.push(ch),
                },
                _ => out.push(ch),
            }
        }
        out
    }
}

/// Finished statement ready to hand to a store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl BuiltQuery {
    /// Checks that placeholders are exactly `$1..=$n` for `n` parameters.
    pub fn new(sql: String, params: Vec<SqlParam>) -> Result<Self> {
        let numbers = numbered_placeholders(&sql);
        let contiguous = numbers.iter().copied().eq(1..=params.len());
        if !contiguous {
            return Err(SearchError::ParameterMismatch {
                placeholders: numbers.len(),
                params: params.len(),
            });
        }
        Ok(Self { sql, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fragment_rejects_mismatched_counts() {
        let err = Fragment::new("a = ? AND b = ?", vec!["x".into()]).unwrap_err();
        assert!(matches!(
            err,
            SearchError::ParameterMismatch {
                placeholders: 2,
                params: 1
            }
        ));
    }

    #[test]
    fn quoted_question_marks_are_not_placeholders() {
        assert_eq!(count_placeholders("name = '?' AND code = ?"), 1);
        assert!(Fragment::new("note = 'why?'", Vec::new()).is_ok());
    }

    #[test]
    fn binder_continues_numbering_across_fragments() {
        let mut binder = ParamBinder::starting_at(3);
        let first = binder.bind(Fragment::new("a = ?", vec!["x".into()]).unwrap());
        let second = binder.bind(
            Fragment::new("b = ANY(?) OR c % ?", vec![vec!["y".to_string()].into(), "z".into()])
                .unwrap(),
        );
        assert_eq!(first, "a = $3");
        assert_eq!(second, "b = ANY($4) OR c % $5");
        assert_eq!(binder.next_index(), 6);
        assert_eq!(binder.params().len(), 3);
    }

    #[test]
    fn built_query_requires_contiguous_numbering() {
        assert!(BuiltQuery::new("SELECT $1, $2".into(), vec![1i64.into(), 2i64.into()]).is_ok());
        assert!(BuiltQuery::new("SELECT $1, $3".into(), vec![1i64.into(), 2i64.into()]).is_err());
        assert!(BuiltQuery::new("SELECT '$1'".into(), Vec::new()).is_ok());
    }

    #[test]
    fn repeated_placeholder_counts_once() {
        let numbers = numbered_placeholders("a = $1 OR b = $1 OR c = $12");
        assert_eq!(numbers.into_iter().collect::<Vec<_>>(), vec![1, 12]);
    }

    proptest! {
        #[test]
        fn bound_fragments_keep_params_and_placeholders_equal(
            sizes in prop::collection::vec(0usize..5, 0..6),
            start in 1usize..20,
        ) {
            let mut binder = ParamBinder::starting_at(start);
            let mut pieces = Vec::new();
            for size in &sizes {
                let sql = vec!["col = ?"; *size].join(" OR ");
                let params = (0..*size).map(|i| SqlParam::Int(i as i64)).collect();
                pieces.push(binder.bind(Fragment::new(sql, params).unwrap()));
            }
            let total: usize = sizes.iter().sum();
            let numbers = numbered_placeholders(&pieces.join(" AND "));
            prop_assert_eq!(numbers.len(), total);
            prop_assert_eq!(binder.params().len(), total);
            prop_assert_eq!(binder.next_index(), start + total);
        }
    }
}
