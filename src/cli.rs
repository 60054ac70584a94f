//! CLI definitions for xharvest.
//!
//! Uses clap for argument parsing with derive macros.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// xharvest - deduplicating X search harvester
#[derive(Parser, Debug)]
#[command(name = "xharvest")]
#[command(version)]
#[command(about = "Harvest unique posts from X search across date ranges")]
#[command(long_about = r#"
xharvest drives headless Chrome through WebDriver, searches X for a keyword
one date range at a time, scrolls until each session's target is met, and
keeps only posts it has never seen before.

Quick start:
  1. Start chromedriver:   chromedriver --port=9515
  2. Export your cookie:   export XH_AUTH_TOKEN=<auth_token cookie value>
  3. Harvest:              xharvest run "banjir" --since 2024-01-01 --until 2024-01-31
"#)]
pub struct Cli {
    /// Path to the dedup database
    #[arg(long, env = "XH_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Be verbose (show debug info)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Be quiet (suppress progress and non-error output)
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Harvest posts for a keyword over a date range
    Run(RunArgs),

    /// Show dedup database statistics
    Stats(StatsArgs),

    /// Delete stored fingerprints older than N days
    Purge(PurgeArgs),

    /// Show or initialise configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Keyword or hashtag to search for
    pub keyword: String,

    /// First day to search (YYYY-MM-DD)
    #[arg(long)]
    pub since: String,

    /// Last day to search (YYYY-MM-DD, inclusive)
    #[arg(long)]
    pub until: String,

    /// Days per session
    #[arg(long, short = 'i', default_value = "1")]
    pub interval: u32,

    /// Records to collect per session
    #[arg(long, short = 'n', default_value = "100")]
    pub target: usize,

    /// Language filter (lang: operator)
    #[arg(long, short = 'l')]
    pub lang: Option<String>,

    /// Search tab: top or latest
    #[arg(long, short = 'm')]
    pub mode: Option<String>,

    /// Value of the auth_token cookie
    #[arg(long, env = "XH_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Run sessions in parallel with N browsers (max 5)
    #[arg(long, short = 't')]
    pub threads: Option<usize>,

    /// Run in parallel with the configured number of browsers
    #[arg(long, short = 'p', conflicts_with = "threads")]
    pub parallel: bool,

    /// Export format: csv, json or excel
    #[arg(long, short = 'f')]
    pub format: Option<String>,

    /// Directory for the export file
    #[arg(long, short = 'o')]
    pub output_dir: Option<PathBuf>,

    /// Skip writing an export file
    #[arg(long)]
    pub no_export: bool,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct PurgeArgs {
    /// Retention window in days (defaults to the configured value)
    #[arg(long, short = 'd')]
    pub days: Option<u32>,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Show the effective configuration
    #[arg(long)]
    pub show: bool,

    /// Write a default config file to the user config directory
    #[arg(long)]
    pub init: bool,

    /// Overwrite an existing config file with --init
    #[arg(long, requires = "init")]
    pub force: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_defaults() {
        let cli = Cli::try_parse_from([
            "xharvest", "run", "kopi", "--since", "2024-01-01", "--until", "2024-01-03",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.keyword, "kopi");
        assert_eq!(args.interval, 1);
        assert_eq!(args.target, 100);
        assert!(args.threads.is_none());
        assert!(!args.parallel);
    }

    #[test]
    fn threads_and_parallel_conflict() {
        let result = Cli::try_parse_from([
            "xharvest", "run", "kopi", "--since", "2024-01-01", "--until", "2024-01-03", "-t", "3",
            "--parallel",
        ]);
        assert!(result.is_err());
    }
}
