#[cfg(feature = "cli")]
mod cli;

#[cfg(feature = "cli")]
fn main() {
    if let Err(err) = cli::run() {
        eprintln!("catalog-search: {err}");
        std::process::exit(1);
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!(
        "catalog-search was built without the `cli` feature, so the classify, search and \
         facets commands are unavailable. Rebuild with `--features cli` (add `postgres` to \
         run against a live catalog), or use the `catalog_search` library directly."
    );
    std::process::exit(2);
}
