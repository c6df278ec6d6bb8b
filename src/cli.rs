use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catalog_search::{
    Assignment, BuiltQuery, CacheConfig, CatalogSearch, CatalogStore, ClassifiedQuery, Clock,
    FacetCapabilities, FacetCategory, FacetCountRow, FacetsResponse, JsonVocabularySource,
    LookupCache, Pagination, PriceRange, RankedRow, SearchConfig, SearchError, SearchResults,
    SortOrder, SystemClock, VocabularySnapshot, VocabularySource,
};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "catalog-search",
    about = "Classify, search and facet the apparel catalog",
    version
)]
pub struct Cli {
    /// Emit JSON instead of human-readable tables.
    #[arg(long, global = true)]
    json: bool,

    /// Write logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Read vocabularies from a JSON file instead of the database.
    #[arg(long, global = true, env = "CATALOG_SEARCH_VOCAB_FILE")]
    vocab_file: Option<PathBuf>,

    /// Postgres connection string for the catalog.
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Tuning {
    /// Queries of at most this many characters with no vocabulary hit are style codes.
    #[arg(long, global = true, env = "CATALOG_SEARCH_STYLE_CODE_MAX_LEN", default_value_t = 3)]
    style_code_max_len: usize,

    #[arg(long, global = true, env = "CATALOG_SEARCH_MAX_QUERY_CHARS", default_value_t = 200)]
    max_query_chars: usize,

    #[arg(long, global = true, env = "CATALOG_SEARCH_PAGE_SIZE", default_value_t = 24)]
    page_size: u32,

    #[arg(long, global = true, env = "CATALOG_SEARCH_MAX_PAGE_SIZE", default_value_t = 100)]
    max_page_size: u32,

    /// Maximum values returned per facet category.
    #[arg(long, global = true, env = "CATALOG_SEARCH_FACET_LIMIT", default_value_t = 100)]
    facet_limit: u32,

    /// Facet queries allowed in flight at once.
    #[arg(long, global = true, env = "CATALOG_SEARCH_MAX_CONCURRENT_QUERIES", default_value_t = 4)]
    max_concurrent_queries: usize,

    #[arg(long, global = true, env = "CATALOG_SEARCH_RANKED_TIMEOUT_MS", default_value_t = 5_000)]
    ranked_timeout_ms: u64,

    #[arg(long, global = true, env = "CATALOG_SEARCH_FACET_TIMEOUT_MS", default_value_t = 2_000)]
    facet_timeout_ms: u64,

    /// Postgres text search configuration used for free text.
    #[arg(long, global = true, env = "CATALOG_SEARCH_TEXT_CONFIG", default_value = "english")]
    text_search_config: String,

    #[arg(long, global = true, env = "CATALOG_SEARCH_TRIGRAM_THRESHOLD", default_value_t = 0.3)]
    trigram_threshold: f32,

    #[arg(long, global = true, env = "CATALOG_SEARCH_MAX_CONNECTIONS", default_value_t = 8)]
    max_connections: u32,

    #[arg(long, global = true, env = "CATALOG_SEARCH_VOCAB_REFRESH_SECS", default_value_t = 300)]
    vocab_refresh_secs: u64,

    #[arg(long, global = true, env = "CATALOG_SEARCH_RESULT_TTL_SECS", default_value_t = 60)]
    result_ttl_secs: u64,
}

impl Tuning {
    fn search_config(&self) -> SearchConfig {
        SearchConfig {
            style_code_max_len: self.style_code_max_len,
            max_query_chars: self.max_query_chars,
            page_size: self.page_size,
            max_page_size: self.max_page_size,
            facet_value_limit: self.facet_limit,
            max_concurrent_queries: self.max_concurrent_queries,
            ranked_timeout: Duration::from_millis(self.ranked_timeout_ms),
            facet_timeout: Duration::from_millis(self.facet_timeout_ms),
            text_search_config: self.text_search_config.clone(),
            trigram_threshold: self.trigram_threshold,
            ..SearchConfig::default()
        }
    }

    fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            vocabulary_refresh_interval: Duration::from_secs(self.vocab_refresh_secs),
            result_ttl: Duration::from_secs(self.result_ttl_secs),
            ..CacheConfig::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show how a query splits into facets, free text and style code.
    Classify {
        #[arg(required = true)]
        query: Vec<String>,
    },
    /// Run a ranked search.
    Search {
        #[arg(required = true)]
        query: Vec<String>,
        #[command(flatten)]
        paging: Paging,
    },
    /// Count facet values for a query.
    Facets {
        #[arg(required = true)]
        query: Vec<String>,
    },
    /// Print the statements a search would run, without running them.
    Explain {
        #[arg(required = true)]
        query: Vec<String>,
        #[command(flatten)]
        paging: Paging,
    },
    /// Summarize the loaded vocabulary.
    Vocab,
}

#[derive(Args, Debug)]
struct Paging {
    /// 1-based page number.
    #[arg(long, default_value_t = 1)]
    page: u32,
    /// Page size; defaults to the configured page size.
    #[arg(short, long)]
    limit: Option<u32>,
    /// relevance, price_asc, price_desc, newest or name.
    #[arg(long, default_value = "relevance")]
    sort: SortOrder,
}

impl Paging {
    fn pagination(&self) -> Pagination {
        Pagination::new(self.page, self.limit.unwrap_or(0))
    }
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        tokio::select! {
            result = dispatch(cli) => result,
            _ = tokio::signal::ctrl_c() => Err("interrupted".into()),
        }
    })
}

fn init_tracing(as_json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("catalog_search=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if as_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn dispatch(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = cli.tuning.search_config();
    config.validate()?;
    let backend = Backend::open(&cli).await?;
    let search = backend.service(config, &cli.tuning.cache_config()).await?;

    match &cli.command {
        Command::Classify { query } => handle_classify(&search, &query.join(" "), cli.json),
        Command::Search { query, paging } => {
            backend.require_database("search")?;
            let results = search
                .search(&query.join(" "), paging.pagination(), paging.sort)
                .await?;
            print_results(&results, cli.json)
        }
        Command::Facets { query } => {
            backend.require_database("facets")?;
            let response = search.facets(&query.join(" ")).await?;
            print_facets(&response, cli.json)
        }
        Command::Explain { query, paging } => {
            let explain = search.explain(&query.join(" "), paging.pagination(), paging.sort)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&explain)?);
            } else {
                print_statement("ranked", &explain.ranked);
                print_statement("count", &explain.count);
                for (category, statement) in &explain.facets.categories {
                    print_statement(&format!("facet {category}"), statement);
                }
                print_statement("price range", &explain.facets.price_range);
            }
            Ok(())
        }
        Command::Vocab => print_vocabulary(&search.lookup().snapshot(), cli.json),
    }
}

/// Store, vocabulary source and capabilities chosen from the flags.
struct Backend {
    store: Arc<dyn CatalogStore>,
    vocabulary: Arc<dyn VocabularySource>,
    capabilities: FacetCapabilities,
    online: bool,
}

impl Backend {
    async fn open(cli: &Cli) -> Result<Self, Box<dyn Error>> {
        let file_source = cli
            .vocab_file
            .as_ref()
            .map(|path| Arc::new(JsonVocabularySource::new(path)) as Arc<dyn VocabularySource>);

        if let Some(url) = cli.database_url.as_deref() {
            return Self::connect(url, &cli.tuning, file_source).await;
        }
        let vocabulary =
            file_source.ok_or("either --vocab-file or --database-url is required")?;
        Ok(Self {
            store: Arc::new(OfflineStore),
            vocabulary,
            capabilities: FacetCapabilities::all_joins(),
            online: false,
        })
    }

    #[cfg(feature = "postgres")]
    async fn connect(
        url: &str,
        tuning: &Tuning,
        file_source: Option<Arc<dyn VocabularySource>>,
    ) -> Result<Self, Box<dyn Error>> {
        let store = Arc::new(
            catalog_search::PgCatalogStore::connect(
                url,
                tuning.max_connections,
                tuning.trigram_threshold,
            )
            .await?,
        );
        let capabilities = FacetCapabilities::detect(store.as_ref()).await?;
        let vocabulary = file_source.unwrap_or_else(|| Arc::clone(&store) as Arc<dyn VocabularySource>);
        Ok(Self {
            store,
            vocabulary,
            capabilities,
            online: true,
        })
    }

    #[cfg(not(feature = "postgres"))]
    async fn connect(
        _url: &str,
        _tuning: &Tuning,
        _file_source: Option<Arc<dyn VocabularySource>>,
    ) -> Result<Self, Box<dyn Error>> {
        Err("database support is disabled. Rebuild with `--features postgres`.".into())
    }

    async fn service(
        &self,
        config: SearchConfig,
        cache: &CacheConfig,
    ) -> Result<CatalogSearch, Box<dyn Error>> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let lookup = Arc::new(LookupCache::new(
            Arc::clone(&self.vocabulary),
            Arc::clone(&clock),
            cache.vocabulary_refresh_interval,
        ));
        let snapshot = lookup.initialize().await?;
        info!(
            generation = snapshot.generation(),
            terms = snapshot.term_count(),
            "vocabulary ready"
        );
        Ok(CatalogSearch::new(
            lookup,
            Arc::clone(&self.store),
            self.capabilities.clone(),
            config,
            cache,
            clock,
        ))
    }

    fn require_database(&self, command: &str) -> Result<(), Box<dyn Error>> {
        if self.online {
            Ok(())
        } else {
            Err(format!("`{command}` needs --database-url").into())
        }
    }
}

/// Stands in for the database when only a vocabulary file is given.
struct OfflineStore;

impl OfflineStore {
    fn unavailable<T>(operation: &'static str) -> catalog_search::Result<T> {
        Err(SearchError::store(operation, "no database configured"))
    }
}

#[async_trait]
impl CatalogStore for OfflineStore {
    async fn fetch_ranked(&self, _query: &BuiltQuery) -> catalog_search::Result<Vec<RankedRow>> {
        Self::unavailable("ranked")
    }

    async fn fetch_count(&self, _query: &BuiltQuery) -> catalog_search::Result<i64> {
        Self::unavailable("count")
    }

    async fn fetch_facet_counts(
        &self,
        _category: FacetCategory,
        _query: &BuiltQuery,
    ) -> catalog_search::Result<Vec<FacetCountRow>> {
        Self::unavailable("facet")
    }

    async fn fetch_price_range(&self, _query: &BuiltQuery) -> catalog_search::Result<PriceRange> {
        Self::unavailable("price_range")
    }
}

fn handle_classify(search: &CatalogSearch, raw: &str, as_json: bool) -> Result<(), Box<dyn Error>> {
    let classified = search.classify(raw);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&classified)?);
    } else {
        print_classified(&classified);
    }
    Ok(())
}

fn print_classified(classified: &ClassifiedQuery) {
    let mut rows: Vec<(String, String)> = classified
        .active_categories()
        .map(|category| (category.to_string(), classified.values(category).join(", ")))
        .collect();
    if let Some(code) = &classified.style_code {
        rows.push(("styleCode".to_string(), code.clone()));
    }
    if !classified.free_text.is_empty() {
        rows.push(("freeText".to_string(), classified.free_text.join(" ")));
    }
    if rows.is_empty() {
        println!("Nothing to classify.");
        return;
    }
    let width = rows
        .iter()
        .map(|(label, _)| label.len())
        .max()
        .unwrap_or(5)
        .max("FIELD".len());
    println!("{:<width$}  {}", "FIELD", "VALUE", width = width);
    println!("{:-<width$}  {}", "", "-----", width = width);
    for (label, value) in &rows {
        println!("{:<width$}  {}", label, value, width = width);
    }

    println!("\nSegments:");
    for segment in &classified.segments {
        let destination = match &segment.assignment {
            Assignment::Facet(category) => category.to_string(),
            Assignment::FreeText => "free text".to_string(),
            Assignment::StyleCode => "style code".to_string(),
            Assignment::Ignored(category) => format!("ignored {category}"),
        };
        let canonical = segment
            .canonical
            .as_deref()
            .map(|slug| format!(" -> {slug}"))
            .unwrap_or_default();
        println!("- \"{}\" [{}]{}", segment.tokens.join(" "), destination, canonical);
    }
}

fn print_results(results: &SearchResults, as_json: bool) -> Result<(), Box<dyn Error>> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }
    if results.items.is_empty() {
        println!("No styles matched ({} total).", results.total);
        return Ok(());
    }
    let code_width = column_width(results.items.iter().map(|row| row.style_code.len()), "STYLE");
    let name_width = column_width(results.items.iter().map(|row| row.style_name.len()), "NAME");
    let brand_width = column_width(
        results
            .items
            .iter()
            .map(|row| row.brand.as_deref().map_or(1, str::len)),
        "BRAND",
    );
    println!(
        "Page {} ({} per page, sorted by {}), {} total:",
        results.page, results.limit, results.sort, results.total
    );
    println!(
        "{:<code_width$}  {:<name_width$}  {:<brand_width$}  {:>10}  {:>8}",
        "STYLE", "NAME", "BRAND", "PRICE", "SCORE"
    );
    println!(
        "{:-<code_width$}  {:-<name_width$}  {:-<brand_width$}  {:->10}  {:->8}",
        "", "", "", "", ""
    );
    for row in &results.items {
        let price = row
            .sell_price
            .map(|value| format!("{value:.2}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<code_width$}  {:<name_width$}  {:<brand_width$}  {:>10}  {:>8.1}",
            row.style_code,
            row.style_name,
            row.brand.as_deref().unwrap_or("-"),
            price,
            row.score
        );
    }
    Ok(())
}

fn print_facets(response: &FacetsResponse, as_json: bool) -> Result<(), Box<dyn Error>> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }
    println!("{} matching styles", response.total);
    match (response.price_range.min, response.price_range.max) {
        (Some(min), Some(max)) => println!("Price range: {min:.2} - {max:.2}"),
        _ => println!("Price range: -"),
    }
    for (category, values) in &response.filters {
        if values.is_empty() {
            continue;
        }
        let width = column_width(values.iter().map(|value| value.slug.len()), "SLUG");
        println!("\n{category}:");
        for value in values {
            println!("  {:<width$}  {:>6}  {}", value.slug, value.count, value.name, width = width);
        }
    }
    if !response.unavailable.is_empty() {
        let names: Vec<String> = response.unavailable.iter().map(ToString::to_string).collect();
        println!("\nUnavailable: {}", names.join(", "));
    }
    if response.degraded {
        println!("(partial result: some facet queries failed)");
    }
    Ok(())
}

fn print_statement(label: &str, statement: &BuiltQuery) {
    println!("-- {label}");
    println!("{}", statement.sql);
    for (index, param) in statement.params.iter().enumerate() {
        println!("--   ${} = {}", index + 1, json!(param));
    }
    println!();
}

fn print_vocabulary(snapshot: &VocabularySnapshot, as_json: bool) -> Result<(), Box<dyn Error>> {
    let counts: Vec<(FacetCategory, usize)> = FacetCategory::PRIORITY
        .iter()
        .map(|category| (*category, snapshot.category(*category).len()))
        .collect();
    if as_json {
        let payload = json!({
            "generation": snapshot.generation(),
            "terms": snapshot.term_count(),
            "synonyms": snapshot.synonym_count(),
            "categories": counts
                .iter()
                .map(|(category, count)| json!({ "category": category, "terms": count }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    let width = column_width(counts.iter().map(|(category, _)| category.as_str().len()), "CATEGORY");
    println!(
        "Vocabulary generation {}: {} terms, {} synonyms",
        snapshot.generation(),
        snapshot.term_count(),
        snapshot.synonym_count()
    );
    println!("{:<width$}  {}", "CATEGORY", "TERMS", width = width);
    println!("{:-<width$}  {}", "", "-----", width = width);
    for (category, count) in &counts {
        println!("{:<width$}  {}", category.as_str(), count, width = width);
    }
    Ok(())
}

fn column_width(lengths: impl Iterator<Item = usize>, header: &str) -> usize {
    lengths.max().unwrap_or(0).max(header.len())
}
