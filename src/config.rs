use std::time::Duration;

use crate::error::{Result, SearchError};

/// Tuning for classification, query assembly and fan-out.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Inputs at or under this length with no vocabulary hit are treated as style codes.
    pub style_code_max_len: usize,
    pub max_query_chars: usize,
    pub max_tokens: usize,
    /// Longest phrase window tried during classification.
    pub max_window: usize,
    pub page_size: u32,
    pub max_page_size: u32,
    pub facet_value_limit: u32,
    pub max_concurrent_queries: usize,
    pub ranked_timeout: Duration,
    pub facet_timeout: Duration,
    pub text_search_config: String,
    pub trigram_threshold: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            style_code_max_len: 3,
            max_query_chars: 200,
            max_tokens: 24,
            max_window: 3,
            page_size: 24,
            max_page_size: 100,
            facet_value_limit: 100,
            max_concurrent_queries: 4,
            ranked_timeout: Duration::from_secs(5),
            facet_timeout: Duration::from_secs(2),
            text_search_config: "english".to_string(),
            trigram_threshold: 0.3,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_window == 0 {
            return Err(SearchError::Config("max_window must be at least 1".into()));
        }
        if self.max_concurrent_queries == 0 {
            return Err(SearchError::Config(
                "max_concurrent_queries must be at least 1".into(),
            ));
        }
        if self.page_size == 0 || self.page_size > self.max_page_size {
            return Err(SearchError::Config(format!(
                "page_size must be within 1..={}",
                self.max_page_size
            )));
        }
        if !self
            .text_search_config
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(SearchError::Config(
                "text_search_config must be a plain identifier".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.trigram_threshold) {
            return Err(SearchError::Config(
                "trigram_threshold must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub vocabulary_refresh_interval: Duration,
    pub result_ttl: Duration,
    pub result_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            vocabulary_refresh_interval: Duration::from_secs(300),
            result_ttl: Duration::from_secs(60),
            result_capacity: 512,
        }
    }
}
