use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Result, SearchError};
use crate::vocab::{VocabularyData, VocabularySnapshot};

/// Where vocabularies and synonym mappings are read from.
#[async_trait]
pub trait VocabularySource: Send + Sync {
    async fn load_vocabulary(&self) -> Result<VocabularyData>;
}

/// Reads a `VocabularyData` JSON document from disk.
#[derive(Debug, Clone)]
pub struct JsonVocabularySource {
    path: PathBuf,
}

impl JsonVocabularySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl VocabularySource for JsonVocabularySource {
    async fn load_vocabulary(&self) -> Result<VocabularyData> {
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { generation: u64 },
    /// Another refresh was already in flight; its result will be published instead.
    Coalesced,
    /// Load failed and the previous snapshot was kept.
    Failed,
}

/// Holds the current vocabulary snapshot and refreshes it in the background.
///
/// Readers clone an `Arc` to the snapshot and never wait on a refresh; a
/// completed load is published with a single pointer swap.
pub struct LookupCache {
    source: Arc<dyn VocabularySource>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
    current: RwLock<Arc<VocabularySnapshot>>,
    refreshing: AtomicBool,
    dirty: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
    generation: AtomicU64,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl LookupCache {
    pub fn new(
        source: Arc<dyn VocabularySource>,
        clock: Arc<dyn Clock>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            source,
            clock,
            refresh_interval,
            current: RwLock::new(Arc::new(VocabularySnapshot::empty())),
            refreshing: AtomicBool::new(false),
            dirty: AtomicBool::new(true),
            last_attempt: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Builds a cache around a snapshot that is already loaded.
    pub fn with_snapshot(
        source: Arc<dyn VocabularySource>,
        clock: Arc<dyn Clock>,
        refresh_interval: Duration,
        snapshot: VocabularySnapshot,
    ) -> Self {
        let cache = Self::new(source, clock, refresh_interval);
        cache.generation.store(snapshot.generation(), Ordering::Release);
        *cache.last_attempt.lock() = Some(cache.clock.now());
        cache.dirty.store(false, Ordering::Release);
        *cache.current.write() = Arc::new(snapshot);
        cache
    }

    /// First load at startup. Unlike later refreshes, failure here is returned.
    pub async fn initialize(&self) -> Result<Arc<VocabularySnapshot>> {
        match self.refresh().await {
            RefreshOutcome::Failed => Err(SearchError::VocabularyLoad(
                "initial vocabulary load failed".into(),
            )),
            _ => Ok(self.snapshot()),
        }
    }

    pub fn snapshot(&self) -> Arc<VocabularySnapshot> {
        self.current.read().clone()
    }

    pub fn is_stale(&self) -> bool {
        if self.dirty.load(Ordering::Acquire) {
            return true;
        }
        match *self.last_attempt.lock() {
            Some(at) => self.clock.now().saturating_duration_since(at) >= self.refresh_interval,
            None => true,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Reloads from the source unless a refresh is already running.
    pub async fn refresh(&self) -> RefreshOutcome {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("vocabulary refresh already in flight");
            return RefreshOutcome::Coalesced;
        }
        let _in_flight = InFlight(&self.refreshing);
        let mut outcome = self.load_once().await;
        // An invalidation that landed mid-load may describe writes the load missed.
        if self.dirty.load(Ordering::Acquire) && outcome != RefreshOutcome::Failed {
            outcome = self.load_once().await;
        }
        outcome
    }

    async fn load_once(&self) -> RefreshOutcome {
        self.dirty.store(false, Ordering::Release);
        *self.last_attempt.lock() = Some(self.clock.now());

        let started = Instant::now();
        match self.source.load_vocabulary().await {
            Ok(data) => {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                let snapshot = VocabularySnapshot::build(data, generation, Some(self.clock.now()));
                info!(
                    generation,
                    terms = snapshot.term_count(),
                    synonyms = snapshot.synonym_count(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "vocabulary snapshot loaded"
                );
                *self.current.write() = Arc::new(snapshot);
                RefreshOutcome::Refreshed { generation }
            }
            Err(err) => {
                warn!(
                    error = %err,
                    stale_generation = self.generation.load(Ordering::Acquire),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "vocabulary refresh failed; keeping previous snapshot"
                );
                RefreshOutcome::Failed
            }
        }
    }

    /// Returns the current snapshot, kicking off a background refresh when stale.
    pub fn ensure_fresh(self: &Arc<Self>) -> Arc<VocabularySnapshot> {
        if self.is_stale() && !self.is_refreshing() {
            self.spawn_refresh();
        }
        self.snapshot()
    }

    /// Marks the snapshot stale and starts a refresh right away.
    pub fn invalidate(self: &Arc<Self>) {
        self.dirty.store(true, Ordering::Release);
        self.spawn_refresh();
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime available; refresh deferred to next request");
            return;
        };
        let cache = Arc::clone(self);
        handle.spawn(async move {
            cache.refresh().await;
        });
    }

    /// Periodic refresh on the configured interval.
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.refresh().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::{ScriptedSource, fixture_data};
    use crate::vocab::FacetCategory;
    use tempfile::TempDir;

    fn cache_with(source: Arc<ScriptedSource>, clock: Arc<ManualClock>) -> Arc<LookupCache> {
        Arc::new(LookupCache::new(source, clock, Duration::from_secs(300)))
    }

    #[tokio::test]
    async fn initialize_publishes_first_generation() {
        let source = Arc::new(ScriptedSource::always(fixture_data()));
        let cache = cache_with(source.clone(), Arc::new(ManualClock::new()));
        let snapshot = cache.initialize().await.unwrap();
        assert_eq!(snapshot.generation(), 1);
        assert!(snapshot.brands().contains("gildan"));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn json_source_reads_category_aliases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vocabulary.json");
        std::fs::write(
            &path,
            r#"{
                "terms": [
                    {"category": "brand", "slug": "gildan", "name": "Gildan"},
                    {"category": "product_type", "slug": "polos", "name": "Polos", "source": "catalog"},
                    {"category": "color", "slug": "navy", "name": "Navy"}
                ],
                "synonyms": [
                    {"term": "polo shirt", "canonical": "polos", "category": "type"},
                    {"term": "gray", "canonical": "grey"}
                ]
            }"#,
        )
        .unwrap();

        let data = JsonVocabularySource::new(&path).load_vocabulary().await.unwrap();
        let categories: Vec<FacetCategory> = data.terms.iter().map(|term| term.category).collect();
        assert_eq!(
            categories,
            vec![FacetCategory::Brand, FacetCategory::ProductType, FacetCategory::Colour]
        );
        assert_eq!(data.terms[1].source, "catalog");
        assert!(data.terms[0].source.is_empty());
        assert_eq!(data.synonyms[0].category, Some(FacetCategory::ProductType));
        assert_eq!(data.synonyms[1].category, None);
    }

    #[tokio::test]
    async fn json_source_reports_missing_and_malformed_files() {
        let dir = TempDir::new().unwrap();
        let missing = JsonVocabularySource::new(dir.path().join("absent.json"));
        assert!(missing.load_vocabulary().await.is_err());

        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{\"terms\": [").unwrap();
        assert!(JsonVocabularySource::new(&path).load_vocabulary().await.is_err());
    }

    #[tokio::test]
    async fn initialize_surfaces_first_failure() {
        let source = Arc::new(ScriptedSource::failing());
        let cache = cache_with(source, Arc::new(ManualClock::new()));
        assert!(matches!(
            cache.initialize().await,
            Err(SearchError::VocabularyLoad(_))
        ));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_snapshot() {
        let source = Arc::new(ScriptedSource::sequence(vec![Ok(fixture_data()), Err(())]));
        let cache = cache_with(source, Arc::new(ManualClock::new()));
        cache.initialize().await.unwrap();
        assert_eq!(cache.refresh().await, RefreshOutcome::Failed);
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.generation(), 1);
        assert!(!snapshot.is_empty());
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce() {
        let source = Arc::new(
            ScriptedSource::always(fixture_data()).with_delay(Duration::from_millis(50)),
        );
        let cache = cache_with(source.clone(), Arc::new(ManualClock::new()));
        let (a, b) = tokio::join!(cache.refresh(), cache.refresh());
        let outcomes = [a, b];
        assert!(outcomes.contains(&RefreshOutcome::Coalesced));
        assert!(outcomes.contains(&RefreshOutcome::Refreshed { generation: 1 }));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn readers_see_previous_snapshot_during_refresh() {
        let source = Arc::new(
            ScriptedSource::always(fixture_data()).with_delay(Duration::from_millis(100)),
        );
        let cache = cache_with(source, Arc::new(ManualClock::new()));
        cache.initialize().await.unwrap();

        let background = Arc::clone(&cache);
        let task = tokio::spawn(async move { background.refresh().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.is_refreshing());
        assert_eq!(cache.snapshot().generation(), 1);

        assert_eq!(task.await.unwrap(), RefreshOutcome::Refreshed { generation: 2 });
        assert_eq!(cache.snapshot().generation(), 2);
    }

    #[tokio::test]
    async fn staleness_follows_the_clock() {
        let clock = Arc::new(ManualClock::new());
        let source = Arc::new(ScriptedSource::always(fixture_data()));
        let cache = cache_with(source, clock.clone());
        assert!(cache.is_stale());
        cache.initialize().await.unwrap();
        assert!(!cache.is_stale());
        clock.advance(Duration::from_secs(299));
        assert!(!cache.is_stale());
        clock.advance(Duration::from_secs(1));
        assert!(cache.is_stale());
    }

    #[tokio::test]
    async fn invalidate_forces_a_refresh() {
        let source = Arc::new(ScriptedSource::always(fixture_data()));
        let cache = cache_with(source.clone(), Arc::new(ManualClock::new()));
        cache.initialize().await.unwrap();
        cache.invalidate();
        tokio::time::timeout(Duration::from_secs(2), async {
            while cache.snapshot().generation() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("refresh after invalidation");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn refresh_loop_reloads_on_interval() {
        let source = Arc::new(ScriptedSource::always(fixture_data()));
        let cache = Arc::new(LookupCache::new(
            source.clone(),
            Arc::new(ManualClock::new()),
            Duration::from_millis(20),
        ));
        cache.initialize().await.unwrap();
        let handle = cache.spawn_refresh_loop();
        tokio::time::timeout(Duration::from_secs(2), async {
            while cache.snapshot().generation() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("periodic refreshes");
        handle.abort();
        assert!(source.calls() >= 3);
    }

    #[tokio::test]
    async fn ensure_fresh_returns_current_snapshot_without_waiting() {
        let clock = Arc::new(ManualClock::new());
        let source = Arc::new(
            ScriptedSource::always(fixture_data()).with_delay(Duration::from_millis(200)),
        );
        let cache = cache_with(source, clock.clone());
        cache.initialize().await.unwrap();
        clock.advance(Duration::from_secs(600));
        let started = Instant::now();
        let snapshot = cache.ensure_fresh();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(snapshot.generation(), 1);
    }
}
