//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Crawl a music catalog and download its tracks.
///
/// Harvester discovers singers on the catalog, collects their songs into a
/// local store, and downloads the audio files, rotating through a pool of
/// probed proxies.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the JSON config file
    #[arg(long, default_value = "config.json", global = true)]
    pub config: PathBuf,

    /// Serialize work and use long randomized delays
    #[arg(long, global = true)]
    pub safe: bool,

    /// Connect directly instead of through the proxy pool
    #[arg(long, global = true)]
    pub no_proxy: bool,

    /// Worker count override (1-100)
    #[arg(short = 'w', long, global = true, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub workers: Option<u8>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Crawl the singer catalog into the entity store
    Entities {
        /// Keep singers whose name contains this keyword (repeatable)
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,

        /// Stop after this many matching singers
        #[arg(short, long)]
        limit: Option<usize>,

        /// Catalog page to start from
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        start_page: u32,
    },

    /// Crawl song listings into the item store
    Items {
        /// Singer id to crawl (repeatable; default: every stored singer)
        #[arg(short, long = "entity")]
        entities: Vec<String>,

        /// Keep singers whose name contains this keyword (repeatable)
        #[arg(short, long = "singer")]
        singers: Vec<String>,

        /// Crawl at most this many singers
        #[arg(short, long)]
        limit: Option<usize>,

        /// Ignore the crawl cache
        #[arg(short, long)]
        force: bool,
    },

    /// Download songs from the item store
    Download {
        /// Song id to download (repeatable; default: every stored song)
        #[arg(short, long = "item")]
        items: Vec<String>,

        /// Keep songs whose singer name contains this keyword (repeatable)
        #[arg(short, long = "singer")]
        singers: Vec<String>,

        /// Download at most this many songs not already on disk
        #[arg(short, long)]
        limit: Option<usize>,

        /// Target directory (default: `download_dir` from config)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Print item store statistics
    Stats,

    /// Manage the proxy pool
    Proxies {
        #[command(subcommand)]
        action: ProxyAction,
    },
}

/// Proxy pool subcommands.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyAction {
    /// Probe every source and save the live set
    Refresh,
    /// Show candidate counts per source without probing
    Status,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_stats_parses_with_defaults() {
        let args = Args::try_parse_from(["harvester", "stats"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(!args.safe);
        assert!(!args.no_proxy);
        assert_eq!(args.workers, None);
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert!(matches!(args.command, Command::Stats));
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["harvester", "-v", "stats"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["harvester", "stats", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_entities_repeatable_keywords() {
        let args = Args::try_parse_from([
            "harvester",
            "entities",
            "-k",
            "jay",
            "--keyword",
            "faye",
            "--limit",
            "5",
        ])
        .unwrap();
        match args.command {
            Command::Entities {
                keywords,
                limit,
                start_page,
            } => {
                assert_eq!(keywords, vec!["jay", "faye"]);
                assert_eq!(limit, Some(5));
                assert_eq!(start_page, 1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_start_page_must_be_positive() {
        let result = Args::try_parse_from(["harvester", "entities", "--start-page", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_items_force_and_entities() {
        let args =
            Args::try_parse_from(["harvester", "items", "-e", "12", "-e", "34", "--force"]).unwrap();
        match args.command {
            Command::Items {
                entities, force, ..
            } => {
                assert_eq!(entities, vec!["12", "34"]);
                assert!(force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_singer_filter_on_items_and_download() {
        let args =
            Args::try_parse_from(["harvester", "items", "-s", "jay", "--singer", "faye"]).unwrap();
        match args.command {
            Command::Items { singers, .. } => assert_eq!(singers, vec!["jay", "faye"]),
            other => panic!("unexpected command: {other:?}"),
        }

        let args = Args::try_parse_from(["harvester", "download", "--singer", "jay"]).unwrap();
        match args.command {
            Command::Download { singers, .. } => assert_eq!(singers, vec!["jay"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_download_with_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "harvester",
            "download",
            "--dir",
            "/tmp/music",
            "--safe",
            "--no-proxy",
            "-w",
            "4",
        ])
        .unwrap();
        assert!(args.safe);
        assert!(args.no_proxy);
        assert_eq!(args.workers, Some(4));
        match args.command {
            Command::Download {
                dir,
                items,
                singers,
                limit,
            } => {
                assert_eq!(dir, Some(PathBuf::from("/tmp/music")));
                assert!(items.is_empty());
                assert!(singers.is_empty());
                assert_eq!(limit, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_workers_out_of_range_rejected() {
        assert!(Args::try_parse_from(["harvester", "stats", "-w", "0"]).is_err());
        assert!(Args::try_parse_from(["harvester", "stats", "-w", "101"]).is_err());
    }

    #[test]
    fn test_cli_proxies_actions() {
        let args = Args::try_parse_from(["harvester", "proxies", "refresh"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Proxies {
                action: ProxyAction::Refresh
            }
        ));
        assert!(Args::try_parse_from(["harvester", "proxies"]).is_err());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Args::try_parse_from(["harvester"]).is_err());
    }
}
