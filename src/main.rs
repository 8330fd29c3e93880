use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use feedsentry::config::Config;
use feedsentry::feed::{
    build_client, opml, FeedIngestor, FeedItem, FeedSource, FeedState, LoadStatus,
};
use feedsentry::search::{SearchIndex, SearchResult};
use feedsentry::storage::{Database, DatabaseError};
use feedsentry::util::{strip_control_chars, validate_feed_url};
use feedsentry::watchlist::{AddOutcome, Watchlist};

/// Get the config directory path (~/.config/feedsentry/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsentry"))
}

#[derive(Parser, Debug)]
#[command(
    name = "feedsentry",
    version,
    about = "Security news aggregator with keyword watchlist"
)]
struct Args {
    /// Directory holding config.toml and state.db
    #[arg(long, value_name = "DIR", global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load every source and print its latest items
    Fetch {
        /// Items shown per source
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Load every source, then search titles and summaries
    Search { term: String },
    /// Manage the keyword watchlist
    Watch {
        #[command(subcommand)]
        action: WatchAction,
    },
    /// Manage feed sources
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },
}

#[derive(Subcommand, Debug)]
enum WatchAction {
    /// Show keywords with their current match counts
    List,
    Add { keyword: String },
    Remove { keyword: String },
    /// Show items matching any keyword
    Matches {
        /// Only items published within this many hours
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..))]
        recent_hours: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum SourcesAction {
    List,
    Add {
        url: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Remove { url: String },
    /// Add every source listed in an OPML file
    Import { file: PathBuf },
    /// Write all sources to an OPML file
    Export { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = match args.config_dir {
        Some(dir) => dir,
        None => get_config_dir()?,
    };
    ensure_config_dir(&config_dir)?;

    let config = Config::load(&config_dir.join("config.toml")).context("Failed to load config")?;
    let db = open_database(&config_dir.join("state.db")).await?;

    match args.command {
        Command::Fetch { limit } => cmd_fetch(&config, &db, limit).await,
        Command::Search { term } => cmd_search(&config, &db, &term).await,
        Command::Watch { action } => cmd_watch(&config, &db, action).await,
        Command::Sources { action } => cmd_sources(&config, &db, action).await,
    }
}

fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    // User-only access
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = std::fs::set_permissions(config_dir, perms) {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    Ok(())
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: {}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

/// Built-in sources followed by user-added ones, without duplicates.
async fn all_sources(config: &Config, db: &Database) -> Result<Vec<FeedSource>> {
    let mut sources = config.sources.clone();
    for source in db.load_sources().await.context("Failed to load sources")? {
        if !sources.iter().any(|s| s.url == source.url) {
            sources.push(source);
        }
    }
    Ok(sources)
}

async fn build_ingestor(config: &Config, db: &Database) -> Result<FeedIngestor> {
    let client = build_client().context("Failed to build HTTP client")?;
    let ingestor = FeedIngestor::new(config.transport(client), Arc::new(SearchIndex::new()))
        .with_retry_policy(config.retry_policy())
        .with_staleness(config.staleness())
        .with_max_concurrent(config.max_concurrent_sources);

    for source in all_sources(config, db).await? {
        if let Err(e) = ingestor.add_source(source.clone()) {
            eprintln!("Skipping source {}: {}", clean(&source.url), e);
        }
    }
    Ok(ingestor)
}

/// Loads every source, reporting failures on stderr.
async fn load_everything(ingestor: &FeedIngestor) -> Vec<(FeedSource, FeedState)> {
    let mut results = ingestor.load_all().await;
    let order = ingestor.sources();
    results.sort_by_key(|(source, _)| order.iter().position(|s| s.url == source.url));

    for (source, state) in &results {
        if state.status == LoadStatus::Errored {
            eprintln!(
                "{}: {}",
                clean(&source.title),
                clean(state.error().unwrap_or("load failed"))
            );
        }
    }
    results
}

async fn cmd_fetch(config: &Config, db: &Database, limit: usize) -> Result<()> {
    let ingestor = build_ingestor(config, db).await?;

    for (source, state) in load_everything(&ingestor).await {
        println!("== {} ({} items)", clean(&source.title), state.items.len());
        for item in state.items.iter().take(limit) {
            print_item(item);
        }
        println!();
    }
    Ok(())
}

async fn cmd_search(config: &Config, db: &Database, term: &str) -> Result<()> {
    let ingestor = build_ingestor(config, db).await?;
    load_everything(&ingestor).await;

    let results = ingestor.index().query(term);
    if results.is_empty() {
        println!("No results for '{}'", clean(term));
    }
    for result in &results {
        print_result(result);
    }
    Ok(())
}

async fn cmd_watch(config: &Config, db: &Database, action: WatchAction) -> Result<()> {
    match action {
        WatchAction::Add { keyword } => {
            let mut watchlist = Watchlist::load(Arc::new(SearchIndex::new()), db.clone()).await?;
            match watchlist.add(&keyword).await? {
                AddOutcome::Added => println!("Watching '{}'", clean(keyword.trim())),
                AddOutcome::AlreadyPresent => {
                    println!("Already watching '{}'", clean(keyword.trim()))
                }
            }
        }
        WatchAction::Remove { keyword } => {
            let mut watchlist = Watchlist::load(Arc::new(SearchIndex::new()), db.clone()).await?;
            if watchlist.remove(&keyword).await? {
                println!("Stopped watching '{}'", clean(keyword.trim()));
            } else {
                println!("'{}' was not on the watchlist", clean(keyword.trim()));
            }
        }
        WatchAction::List => {
            let ingestor = build_ingestor(config, db).await?;
            load_everything(&ingestor).await;
            let watchlist = Watchlist::load(Arc::clone(ingestor.index()), db.clone()).await?;

            if watchlist.keywords().is_empty() {
                println!("Watchlist is empty");
            }
            for entry in watchlist.entries() {
                println!("{:>5}  {}", entry.count, clean(&entry.keyword));
            }
        }
        WatchAction::Matches { recent_hours } => {
            let ingestor = build_ingestor(config, db).await?;
            load_everything(&ingestor).await;
            let watchlist = Watchlist::load(Arc::clone(ingestor.index()), db.clone()).await?;

            let matches = match recent_hours {
                Some(hours) => {
                    let window = chrono::TimeDelta::try_hours(hours)
                        .ok_or_else(|| anyhow::anyhow!("--recent-hours {} is out of range", hours))?;
                    watchlist.matches_recent(window)
                }
                None => watchlist.matches_all(),
            };
            for m in &matches {
                let keywords = m.keywords.join(", ");
                println!("[{}]", clean(&keywords));
                print_item(&m.item);
            }
            println!("{} matching items", matches.len());
        }
    }
    Ok(())
}

async fn cmd_sources(config: &Config, db: &Database, action: SourcesAction) -> Result<()> {
    match action {
        SourcesAction::List => {
            for source in all_sources(config, db).await? {
                println!("{}  {}", clean(&source.title), clean(&source.url));
                if let Some(description) = &source.description {
                    println!("    {}", clean(description));
                }
            }
        }
        SourcesAction::Add {
            url,
            title,
            description,
        } => {
            let parsed = validate_feed_url(&url)?;
            let url = parsed.to_string();
            let title = title.unwrap_or_else(|| parsed.host_str().unwrap_or(&url).to_string());
            let source = FeedSource {
                title,
                url,
                description,
            };
            db.save_source(&source).await?;
            println!("Added {}", clean(&source.url));
        }
        SourcesAction::Remove { url } => {
            if db.delete_source(&url).await? {
                println!("Removed {}", clean(&url));
            } else if config.sources.iter().any(|s| s.url == url) {
                println!("{} is a built-in source; remove it from config.toml", clean(&url));
            } else {
                println!("No such source: {}", clean(&url));
            }
        }
        SourcesAction::Import { file } => {
            let sources = opml::import_file(&file).await?;
            db.save_sources(&sources).await?;
            println!("Imported {} sources from {}", sources.len(), file.display());
        }
        SourcesAction::Export { file } => {
            let sources = all_sources(config, db).await?;
            opml::export_to_file(&sources, &file)?;
            println!("Exported {} sources to {}", sources.len(), file.display());
        }
    }
    Ok(())
}

fn clean(s: &str) -> std::borrow::Cow<'_, str> {
    strip_control_chars(s)
}

fn print_item(item: &FeedItem) {
    print_result(&SearchResult::from(item));
}

fn print_result(result: &SearchResult) {
    let date = result.published.as_deref().unwrap_or("undated");
    println!("  {}  [{}] {}", clean(date), clean(&result.source), clean(&result.title));
    if result.link_safe {
        println!("      {}", clean(&result.link));
    } else {
        println!("      (link blocked)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_hours_rejects_negative() {
        assert!(Args::try_parse_from(["feedsentry", "watch", "matches", "--recent-hours", "-5"]).is_err());

        let args =
            Args::try_parse_from(["feedsentry", "watch", "matches", "--recent-hours", "24"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Watch {
                action: WatchAction::Matches { recent_hours: Some(24) }
            }
        ));
    }

    #[test]
    fn test_out_of_range_hours_has_no_window() {
        assert!(chrono::TimeDelta::try_hours(i64::MAX).is_none());
    }
}
