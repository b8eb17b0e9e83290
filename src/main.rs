use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use refeed::cache::ContentCache;
use refeed::cleanup::CleanupWorker;
use refeed::config::Config;
use refeed::feed::{Fetcher, HttpFeedParser, ProcessScriptExecutor};
use refeed::refresh::Refresher;
use refeed::storage::{Database, DatabaseError, NewFeed};
use refeed::tasks::{cancel_pair, TaskManager};

/// Get the config directory path (~/.config/refeed/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("refeed"))
}

#[derive(Parser, Debug)]
#[command(name = "refeed", about = "Refresh RSS/Atom subscriptions into a local database")]
struct Args {
    /// Config file (default: ~/.config/refeed/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file (default: ~/.config/refeed/refeed.db)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Refresh every feed once, then exit
    #[arg(long)]
    once: bool,

    /// Subscribe to a feed URL and refresh it first (repeatable)
    #[arg(long, value_name = "URL")]
    add: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    tracing::debug!(?config, "Effective configuration");

    let db_path = args.db.clone().unwrap_or_else(|| config_dir.join("refeed.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::Locked) => {
            eprintln!("Error: Another instance of refeed appears to be running. Please close it and try again.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let cache = Arc::new(ContentCache::new(config.cache_capacity, config.cache_ttl()));
    let parser = HttpFeedParser::new(&config.user_agent, config.proxy_url.as_deref())
        .context("Failed to build HTTP client")?;
    let mut fetcher = Fetcher::new(db.clone(), Arc::new(parser), Arc::clone(&cache));
    if let Some(dir) = &config.scripts_dir {
        fetcher = fetcher.with_scripts(Arc::new(ProcessScriptExecutor::new(dir)));
    }

    let (cleanup, _cleanup_task) = CleanupWorker::spawn(db.clone(), config.max_article_age_days);
    let tasks = TaskManager::new(
        db.clone(),
        Arc::new(fetcher),
        Arc::new(cleanup),
        config.task_options(),
    );
    let refresher = Refresher::new(db.clone(), cache, tasks);

    if !args.add.is_empty() {
        let ids = subscribe(&db, &args.add).await?;
        let queued = refresher.fetch_feeds_by_ids(None, &ids).await?;
        println!("Subscribed to {} feed(s), {} queued", ids.len(), queued);
    }

    if args.once {
        refresher.fetch_all(None).await?;
        tokio::select! {
            _ = refresher.wait_idle() => {}
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        }
    } else {
        run_periodic(&refresher, &config).await?;
    }

    shutdown(&refresher).await;
    report(&refresher);
    Ok(())
}

/// Insert each URL unless already subscribed, returns the feed IDs in order.
async fn subscribe(db: &Database, urls: &[String]) -> Result<Vec<i64>> {
    let existing = db.get_feeds().await.context("Failed to load feeds")?;
    let mut ids = Vec::with_capacity(urls.len());

    for raw in urls {
        let url = url::Url::parse(raw.trim())
            .with_context(|| format!("Invalid feed URL: {raw}"))?;
        if let Some(feed) = existing.iter().find(|f| f.url == url.as_str()) {
            ids.push(feed.id);
            continue;
        }
        let title = url.host_str().unwrap_or(url.as_str()).to_string();
        let id = db
            .insert_feed(&NewFeed {
                title,
                url: url.to_string(),
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to subscribe to {url}"))?;
        ids.push(id);
    }
    Ok(ids)
}

/// Global refresh on every tick until Ctrl-C.
async fn run_periodic(refresher: &Refresher, config: &Config) -> Result<()> {
    refresher.fetch_all(None).await?;

    let Some(period) = config.refresh_interval() else {
        tokio::select! {
            _ = refresher.wait_idle() => {}
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        }
        return Ok(());
    };

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = refresher.fetch_all(None).await {
                    tracing::warn!(error = %e, "Periodic refresh failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                return Ok(());
            }
        }
    }
}

/// Drain running refreshes. A second Ctrl-C abandons the wait.
async fn shutdown(refresher: &Refresher) {
    let (cancel_tx, cancel) = cancel_pair();
    let force = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    if let Err(e) = refresher.stop(cancel).await {
        tracing::warn!(error = %e, "Shutdown did not wait for running refreshes");
    }
    force.abort();
}

fn report(refresher: &Refresher) {
    let progress = refresher.progress();
    if progress.errors.is_empty() {
        return;
    }
    eprintln!("{} feed(s) failed:", progress.errors.len());
    for (feed_id, error) in &progress.errors {
        eprintln!("  feed {feed_id}: {error}");
    }
}
