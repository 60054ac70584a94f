//! xharvest - deduplicating X search harvester CLI
//!
//! Main entry point for the xharvest command-line tool.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use xharvest::cli::{self, Cli, Commands};
use xharvest::events::LogLevel;
use xharvest::export::ExportTarget;
use xharvest::logging::{OperationGuard, init_cli_logging};
use xharvest::query::{chunk_date_range, parse_date};
use xharvest::webdriver::{WebDriverFactory, XPathPageReader};
use xharvest::{
    BrowserFactory, CancelToken, CollectorSettings, Config, EventSink, ExportFormat,
    FingerprintStore, HEADER_DIVIDER_WIDTH, HarvestError, HarvestEvent, HarvestRequest, Harvester,
    PageReader, ParallelHarvester, Record, SearchMode, TracingSink, VALID_EXPORT_FORMATS,
    VALID_SEARCH_MODES, format_number, format_unknown_value_error,
};

fn main() {
    let cli = Cli::parse();
    let mut config = Config::load();
    if let Some(db) = &cli.db {
        config.paths.db = Some(db.clone());
    }
    if cli.no_color {
        config.output.colors = false;
    }
    if cli.quiet {
        config.output.quiet = true;
    }
    if !config.output.colors {
        colored::control::set_override(false);
    }

    init_cli_logging(config.output.quiet, cli.verbose, config.output.colors);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&config, args),
        Commands::Stats(args) => cmd_stats(&config, args),
        Commands::Purge(args) => cmd_purge(&config, args),
        Commands::Config(args) => cmd_config(&config, args),
        Commands::Completions(args) => {
            cmd_completions(args);
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("{} {err:#}", "error:".red().bold());
        if let Some(hint) = err.downcast_ref::<HarvestError>().and_then(HarvestError::suggestion) {
            eprintln!("  {} {hint}", "hint:".cyan());
        }
        std::process::exit(1);
    }
}

fn parse_mode(value: Option<&str>, default: SearchMode) -> Result<SearchMode> {
    value.map_or(Ok(default), |v| {
        v.parse()
            .map_err(|_| anyhow::anyhow!(format_unknown_value_error("search mode", v, VALID_SEARCH_MODES)))
    })
}

fn parse_format(value: Option<&str>, default: ExportFormat) -> Result<ExportFormat> {
    value.map_or(Ok(default), |v| {
        v.parse()
            .map_err(|_| anyhow::anyhow!(format_unknown_value_error("export format", v, VALID_EXPORT_FORMATS)))
    })
}

/// Cancel `token` on Ctrl-C. The signal is awaited on a dedicated thread
/// running a single-threaded tokio runtime.
fn install_interrupt_handler(token: CancelToken) {
    let spawned = std::thread::Builder::new()
        .name("xh-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(error = %e, "Ctrl-C handler unavailable");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\n{}", "Stopping after the current step...".yellow());
                    token.cancel();
                }
            });
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start signal thread");
    }
}

/// Renders harvest events on the terminal with an indicatif bar.
struct TerminalSink {
    bar: ProgressBar,
}

impl TerminalSink {
    fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden())
        } else {
            ProgressBar::new(0)
        };
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(200));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl EventSink for TerminalSink {
    fn emit(&self, event: HarvestEvent) {
        match event {
            HarvestEvent::Log {
                level,
                worker,
                message,
            } => {
                let prefix = worker.map_or_else(String::new, |w| format!("[Worker {w}] "));
                let line = format!("{prefix}{message}");
                let line = match level {
                    LogLevel::Debug => {
                        debug!("{line}");
                        return;
                    }
                    LogLevel::Info => line.normal(),
                    LogLevel::Warn => line.yellow(),
                    LogLevel::Error => line.red(),
                };
                self.bar.println(line.to_string());
            }
            HarvestEvent::Progress { count, target } => {
                self.bar.set_length(target as u64);
                self.bar.set_position(count as u64);
            }
            HarvestEvent::Statistics(stats) => {
                self.bar.set_message(format!(
                    "{:.1}/min | ETA {} | session {}",
                    stats.current_speed.max(stats.average_speed),
                    stats.total_eta,
                    stats.session_number
                ));
            }
            HarvestEvent::Record(record) => {
                debug!(url = %record.url, "Accepted record");
            }
        }
    }
}

fn cmd_run(config: &Config, args: &cli::RunArgs) -> Result<()> {
    let mode = parse_mode(args.mode.as_deref(), config.harvest.search_mode)?;
    let format = parse_format(args.format.as_deref(), config.output.format)?;
    let start = parse_date(&args.since)?;
    let end = parse_date(&args.until)?;
    let date_ranges = chunk_date_range(start, end, args.interval)?;

    let request = HarvestRequest {
        keyword: args.keyword.clone(),
        date_ranges,
        target_per_session: args.target,
        language: args.lang.clone().unwrap_or_else(|| config.harvest.language.clone()),
        search_mode: mode,
        auth_token: args.auth_token.clone().unwrap_or_default(),
    };
    request.validate()?;

    let db_path = config.db_path();
    let store = Arc::new(
        FingerprintStore::open(&db_path, config.dedup.store_options())
            .with_context(|| format!("opening dedup database {}", db_path.display()))?,
    );
    let factory: Arc<dyn BrowserFactory> = Arc::new(WebDriverFactory::new(config.webdriver.clone()));
    let reader: Arc<dyn PageReader> = Arc::new(XPathPageReader);
    let terminal = Arc::new(TerminalSink::new(config.output.quiet));
    let sink: Arc<dyn EventSink> = if config.output.quiet {
        Arc::new(TracingSink)
    } else {
        Arc::clone(&terminal) as Arc<dyn EventSink>
    };
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let threads = args
        .threads
        .or_else(|| args.parallel.then_some(config.harvest.threads));

    if !config.output.quiet {
        println!("{}", "Harvesting X search results...".bold().cyan());
        println!("  Keyword:  {}", request.keyword);
        println!("  Range:    {start} → {end} ({} sessions)", request.date_ranges.len());
        println!("  Mode:     {mode}");
        println!("  Database: {}", db_path.display());
        println!();
    }

    let guard = OperationGuard::new("harvest");
    let outcome = threads.map_or_else(
        || {
            Harvester::new(factory.clone(), reader.clone(), Arc::clone(&store), Arc::clone(&sink))
                .configured(config)
                .with_cancel(cancel.clone())
                .run(&request)
                .map(|report| (report.records, report.cancelled, 0))
        },
        |n| {
            let pool = ParallelHarvester::new(n, factory.clone(), reader.clone(), Arc::clone(&store), Arc::clone(&sink))
                .with_settings(CollectorSettings::from(&config.harvest))
                .with_cancel(cancel.clone());
            pool.scrape_parallel(&request)
                .map(|records| (records, cancel.is_cancelled(), pool.stats().errors_count))
        },
    );
    terminal.finish();

    let (records, cancelled, errors) = match outcome {
        Ok(outcome) => {
            guard.complete(outcome.0.len());
            outcome
        }
        Err(e) => {
            guard.fail(&e);
            return Err(e.into());
        }
    };

    print_summary(&records, cancelled, errors);

    if !args.no_export && !records.is_empty() {
        let target = ExportTarget {
            dir: args.output_dir.clone().unwrap_or_else(|| config.output_dir()),
            format,
            keyword: request.keyword.clone(),
            mode,
            start,
            end,
        };
        match target.write(&records) {
            Ok(path) => println!(
                "  {} Saved {} records to {}",
                "✓".green(),
                format_number(records.len()),
                path.display()
            ),
            Err(e) => {
                eprintln!("  {} Export failed: {e}", "✗".red());
                if let Some(hint) = e.suggestion() {
                    eprintln!("    {} {hint}", "hint:".cyan());
                }
            }
        }
    }

    Ok(())
}

fn print_summary(records: &[Record], cancelled: bool, errors: usize) {
    println!();
    println!("{}", "Harvest Summary".bold().cyan());
    println!("{}", "─".repeat(HEADER_DIVIDER_WIDTH));
    println!("  {:<20} {:>10}", "Unique records:", format_number(records.len()));
    if errors > 0 {
        println!("  {:<20} {:>10}", "Failed sessions:", errors.to_string().red());
    }
    if cancelled {
        println!("  {}", "Stopped early by user".yellow());
    }
    println!("{}", "─".repeat(HEADER_DIVIDER_WIDTH));
}

fn cmd_stats(config: &Config, args: &cli::StatsArgs) -> Result<()> {
    let db_path = config.db_path();
    if !db_path.exists() {
        anyhow::bail!(
            "No dedup database found at {}. Run 'xharvest run' first.",
            db_path.display()
        );
    }

    let store = FingerprintStore::open(&db_path, config.dedup.store_options())?;
    let stats = store.stats();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{}", "Dedup Database".bold().cyan());
    println!("{}", "─".repeat(HEADER_DIVIDER_WIDTH));
    println!("  {:<20} {}", "Path:", db_path.display());
    println!(
        "  {:<20} {:>10}",
        "Stored records:",
        format_number(stats.total_persisted)
    );
    println!("  {:<20} {:>10}", "Retention:", format!("{}d", config.dedup.retention_days));
    println!("{}", "─".repeat(HEADER_DIVIDER_WIDTH));
    Ok(())
}

fn cmd_purge(config: &Config, args: &cli::PurgeArgs) -> Result<()> {
    let days = args.days.unwrap_or(config.dedup.retention_days);
    let db_path = config.db_path();
    let store = FingerprintStore::open(&db_path, config.dedup.store_options())?;
    let deleted = store.purge_older_than(days)?;
    println!(
        "{} Purged {} fingerprints older than {days} days",
        "✓".green(),
        format_number(deleted)
    );
    Ok(())
}

fn cmd_config(config: &Config, args: &cli::ConfigArgs) -> Result<()> {
    if args.init {
        let existing = Config::user_config_path().filter(|p| p.exists());
        if let (Some(path), false) = (&existing, args.force) {
            anyhow::bail!(
                "Config file already exists at {}. Use --force to overwrite.",
                path.display()
            );
        }
        let path = Config::default().save().context("writing config file")?;
        println!("{} Wrote {}", "✓".green(), path.display());
        return Ok(());
    }

    if args.show {
        println!("{}", "Current Configuration".bold().cyan());
        println!("  Database: {}", config.db_path().display());
        println!("  Output:   {}", config.output_dir().display());
        if let Some(path) = Config::user_config_path() {
            println!("  File:     {}", path.display());
        }
        println!();
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        println!("{}", Config::default_config_content());
    }
    Ok(())
}

fn cmd_completions(args: &cli::CompletionsArgs) {
    let mut cmd = Cli::command();
    generate(args.shell, &mut cmd, "xharvest", &mut io::stdout());
}
