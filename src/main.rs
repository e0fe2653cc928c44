use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use quote_sync::config;
use quote_sync::db;
use quote_sync::model::{CategoryFilter, ConflictMode};
use quote_sync::remote::HttpRemote;
use quote_sync::store::{ImportError, ValidationError};
use quote_sync::sync::{
    ConflictChoice, Delivery, Resolution, SyncDiff, SyncEngine, SyncOutcome,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Random quotes with an offline outbox and remote sync")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show a random quote, optionally switching the remembered category
    Show {
        /// Category name, or "all"
        #[arg(long)]
        category: Option<String>,
    },
    /// Add a quote and try to deliver it to the remote side
    Add {
        #[arg(long)]
        text: String,
        #[arg(long)]
        category: String,
    },
    /// List known categories
    Categories,
    /// Write all quotes to a JSON file
    Export { path: PathBuf },
    /// Append quotes from a JSON file
    Import { path: PathBuf },
    /// Run one sync cycle
    Sync {
        /// Review remote changes instead of applying them automatically
        #[arg(long)]
        manual: bool,
    },
    /// Sync periodically until interrupted
    Watch,
    /// Show collection and outbox counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    if let Command::Sync { manual: true } = args.command {
        cfg.sync.conflict_mode = ConflictMode::Manual;
    }

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let remote = Arc::new(HttpRemote::from_config(&cfg)?);
    let engine = Arc::new(SyncEngine::open(pool, remote, &cfg.sync).await?);

    match args.command {
        Command::Show { category } => {
            let mut rng = rand::rng();
            let mut store = engine.store().lock().await;
            let quote = match category {
                Some(raw) => store.filter_quotes(CategoryFilter::parse(&raw), &mut rng).await?,
                None => {
                    let filter = store.selected_category().clone();
                    store.random_quote(&filter, &mut rng).cloned()
                }
            };
            match quote {
                Some(q) => println!("{}\n  Category: {}", q.text, q.category),
                None => println!("No quotes available for this category."),
            }
        }
        Command::Add { text, category } => match engine.submit_quote(&text, &category).await {
            Ok(sub) => match sub.delivery {
                Delivery::Delivered { remote_id } => {
                    println!("Added {} (synced as #{})", sub.quote, remote_id)
                }
                Delivery::Queued { .. } => {
                    let pending = engine.unsynced_count().await;
                    println!("Added {} ({} unsynced)", sub.quote, pending)
                }
            },
            Err(err) => match err.downcast_ref::<ValidationError>() {
                Some(invalid) => eprintln!("{}", invalid),
                None => return Err(err),
            },
        },
        Command::Categories => {
            let store = engine.store().lock().await;
            let selected = store.selected_category().clone();
            let marker = |active: bool| if active { "*" } else { " " };
            println!("{} all", marker(selected == CategoryFilter::All));
            for category in store.categories() {
                let active = selected == CategoryFilter::parse(&category);
                println!("{} {}", marker(active), category);
            }
        }
        Command::Export { path } => {
            let json = engine.store().lock().await.export_json()?;
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Exported to {}", path.display());
        }
        Command::Import { path } => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            match engine.store().lock().await.import_json(&raw).await {
                Ok(count) => println!("Imported {} quotes.", count),
                Err(err) => match err.downcast_ref::<ImportError>() {
                    Some(invalid) => eprintln!("Error importing quotes: {}", invalid),
                    None => return Err(err),
                },
            }
        }
        Command::Sync { .. } => {
            let report = engine.run_cycle().await?;
            if report.flush.attempted() > 0 {
                println!(
                    "Outbox: {} delivered, {} still pending",
                    report.flush.delivered,
                    engine.unsynced_count().await
                );
            }
            match report.outcome {
                SyncOutcome::Skipped => println!("A sync is already running."),
                SyncOutcome::FetchFailed { .. } => println!("Could not reach the server."),
                SyncOutcome::NoChange => println!("Already up to date."),
                SyncOutcome::AutoMerged { added, replaced } => println!(
                    "Synced with server: {} new, {} updated from server.",
                    added, replaced
                ),
                SyncOutcome::AwaitingResolution(diff) => review(&engine, &diff).await?,
            }
        }
        Command::Watch => {
            info!(interval_ms = cfg.app.sync_interval_ms, "starting periodic sync");
            let ticker = engine.start_periodic(cfg.sync_interval());
            tokio::signal::ctrl_c().await?;
            ticker.stop();
            info!("periodic sync stopped");
        }
        Command::Status => {
            let store = engine.store().lock().await;
            println!("Quotes:   {}", store.len());
            println!("Unsynced: {}", engine.unsynced_count().await);
            println!("Category: {}", store.selected_category().as_str());
            println!("Mode:     {}", engine.mode().as_str());
            println!("Sync:     {}", engine.state().as_str());
        }
    }

    Ok(())
}

/// Walk the user through a pending diff on stdin.
async fn review(engine: &SyncEngine, diff: &SyncDiff) -> Result<()> {
    println!(
        "Server has {} new quotes and {} conflicts.",
        diff.new.len(),
        diff.conflicts.len()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    match ask(&mut lines, "[a]ccept all, [r]eview each, [d]ismiss? ").await?.as_str() {
        "a" => {
            let summary = engine.accept_all().await?;
            println!("Applied {} new, {} updated.", summary.accepted, summary.replaced);
            return Ok(());
        }
        "r" => {}
        _ => {
            engine.dismiss()?;
            println!("Dismissed.");
            return Ok(());
        }
    }

    let mut resolution = Resolution::default();
    for rq in &diff.new {
        println!("\nNEW  {}", rq.to_quote());
        if ask(&mut lines, "[a]ccept or [i]gnore? ").await? == "a" {
            resolution = resolution.accept(rq.text.clone());
        }
    }
    for conflict in &diff.conflicts {
        println!(
            "\nCONFLICT  \"{}\"\n  local:  {}\n  server: {}",
            conflict.local.text, conflict.local.category, conflict.remote.category
        );
        let choice = match ask(&mut lines, "keep [l]ocal or use [s]erver? ").await?.as_str() {
            "s" => ConflictChoice::UseRemote,
            _ => ConflictChoice::KeepLocal,
        };
        resolution = resolution.choose(conflict.remote.text.clone(), choice);
    }
    let summary = engine.resolve(resolution).await?;
    println!("Applied {} new, {} updated.", summary.accepted, summary.replaced);
    Ok(())
}

async fn ask<R>(lines: &mut tokio::io::Lines<R>, prompt: &str) -> Result<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await?;
    stdout.flush().await?;
    let answer = lines.next_line().await?.unwrap_or_default();
    Ok(answer.trim().to_lowercase())
}
