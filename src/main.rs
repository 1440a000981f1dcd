//! CLI entry point for the harvester tool.

use std::io::{self, IsTerminal};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use harvester_core::{
    AppConfig, CrawlReport, DownloadReport, Failure, Harvester, MergeReport, NameFilter,
    RunOptions,
};
use tracing::{debug, info};

mod cli;
mod progress;

use cli::{Args, Command, ProxyAction};
use progress::BarObserver;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    let options = RunOptions {
        safe_mode: args.safe.then_some(true),
        no_proxy: args.no_proxy,
        workers: args.workers.map(usize::from),
    };
    let harvester = Harvester::new(config, options).context("initializing harvester")?;
    info!(mode = ?harvester.mode(), proxy_usage = ?harvester.proxy_usage(), "harvester starting");

    match args.command {
        Command::Entities {
            keywords,
            limit,
            start_page,
        } => {
            let report = harvester
                .crawl_entities(&NameFilter::new(&keywords), limit, start_page)
                .await?;
            print_crawl_report(&report);
        }
        Command::Items {
            entities,
            singers,
            limit,
            force,
        } => {
            if entities.is_empty() && harvester.entities().await?.is_empty() {
                println!("no entities to crawl; run `harvester entities` first");
                return Ok(());
            }
            let report = harvester
                .crawl_items(&entities, &NameFilter::new(&singers), limit, None, force)
                .await?;
            print_merge_report(&report);
        }
        Command::Download {
            items,
            singers,
            limit,
            dir,
        } => {
            let observer = Arc::new(BarObserver::new(!args.quiet && io::stderr().is_terminal()));
            let report = harvester
                .download_items(
                    &items,
                    &NameFilter::new(&singers),
                    dir.as_deref(),
                    None,
                    limit,
                    observer,
                )
                .await?;
            print_download_report(&report);
        }
        Command::Stats => {
            let stats = harvester.stats().await?;
            println!("total_items: {}", stats.total_items);
            println!("total_entities: {}", stats.total_entities);
            for (name, count) in &stats.items_per_entity {
                println!("  {name}: {count}");
            }
        }
        Command::Proxies { action } => match action {
            ProxyAction::Refresh => {
                let status = harvester.refresh_proxies().await;
                println!(
                    "live: {}, quarantined: {}, direct fallback: {}",
                    status.live, status.quarantined, status.allow_direct
                );
            }
            ProxyAction::Status => {
                for source in harvester.pool().sources() {
                    match source.candidates().await {
                        Ok(candidates) => println!("{}: {} candidates", source.name(), candidates.len()),
                        Err(e) => println!("{}: unavailable ({e})", source.name()),
                    }
                }
            }
        },
    }

    Ok(())
}

fn print_failures(failures: &[Failure]) {
    for failure in failures {
        println!("  failed {failure}");
    }
}

fn print_crawl_report(report: &CrawlReport) {
    println!(
        "entities: {} from {} pages ({} failed pages)",
        report.entities.len(),
        report.pages_crawled,
        report.failures.len()
    );
    for entity in &report.entities {
        println!("  {} {}", entity.id, entity.name);
    }
    print_failures(&report.failures);
}

fn print_merge_report(report: &MergeReport) {
    println!(
        "crawled: {}, skipped (recent): {}, inserted: {}, updated: {}, unchanged: {}",
        report.crawled.len(),
        report.skipped_recent.len(),
        report.inserted,
        report.updated,
        report.unchanged
    );
    println!(
        "total_items: {}, total_entities: {}",
        report.stats.total_items, report.stats.total_entities
    );
    print_failures(&report.failures);
}

fn print_download_report(report: &DownloadReport) {
    println!(
        "succeeded: {}, skipped: {}, failed: {}, deferred: {}",
        report.succeeded.len(),
        report.skipped.len(),
        report.failed.len(),
        report.deferred.len()
    );
    print_failures(&report.failed);
}
