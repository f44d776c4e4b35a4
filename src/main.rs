//! soulsfetch - randomizer asset acquisition for the Souls games

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use soulsfetch::auth::{AuthenticationSession, CommandOpener, SsoConfig, UrlOpener};
use soulsfetch::catalog::SourceCatalog;
use soulsfetch::downloaders::Downloaders;
use soulsfetch::orchestrator::{AcquisitionEvent, AssetResult, EventSink, Orchestrator, Report};
use soulsfetch::settings::SettingsFile;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "soulsfetch")]
#[command(version)]
#[command(about = "Fetches randomizer and mod loader assets for Dark Souls II, III and Sekiro")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Root folder assets are stored under (one subfolder per game)
    #[arg(long, global = true, env = "SOULSFETCH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON catalog to use instead of the built-in one
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Nexus Mods API key, skips the browser login
    #[arg(long, global = true, env = "NEXUS_API_KEY", hide_env_values = true)]
    nexus_key: Option<String>,

    /// Browser command to open pages with (default: xdg-open)
    #[arg(long, global = true, default_value = "xdg-open")]
    browser: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to Nexus Mods through the browser
    Auth,

    /// Forget the stored Nexus Mods API key
    Logout,

    /// Show login state and what each game has on disk
    Status,

    /// Download everything a game needs
    Download {
        /// Game name as listed by `catalog`
        game: String,
    },

    /// List assets that are not on disk yet
    Missing { game: String },

    /// Print step-by-step manual download instructions
    Guide { game: String },

    /// Open the download page of every missing asset
    Open { game: String },

    /// Rename and normalize files downloaded by hand
    Normalize { game: String },

    /// List the catalog, optionally for one game
    Catalog { game: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(if cli.verbose {
                "soulsfetch=debug".parse()?
            } else {
                "soulsfetch=warn".parse()?
            }))
            .init();
    }

    let store = SettingsFile::default_location()?;
    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => default_data_dir(&store)?,
    };
    let catalog = match &cli.catalog {
        Some(path) => SourceCatalog::from_json_file(path)?,
        None => SourceCatalog::builtin(),
    };

    let opener: Arc<dyn UrlOpener> = Arc::new(CommandOpener::new(&cli.browser));
    let mut session = AuthenticationSession::new(SsoConfig::default(), store, opener.clone());
    if let Some(key) = cli.nexus_key.as_deref().filter(|k| !k.is_empty()) {
        session.use_key(key);
    }

    match cli.command {
        Commands::Auth => {
            println!("Waiting for authorization in your browser...");
            session
                .authenticate()
                .await
                .context("Nexus Mods login failed")?;
            println!("Logged in to Nexus Mods.");
        }

        Commands::Logout => {
            session.logout()?;
            println!("Logged out. The stored API key was removed.");
        }

        Commands::Status => {
            session.restore().await;
            println!("=== Status ===");
            println!(
                "Nexus Mods: {}",
                if session.is_authenticated() { "logged in" } else { "not logged in" }
            );
            println!("Data dir:   {}", data_dir.display());

            let orchestrator = build(catalog, &data_dir, session, opener)?;
            println!();
            for game in orchestrator.catalog().games() {
                let (ready, found) = orchestrator.ensure_assets_present(game);
                println!(
                    "{:<8} {}/{} present{}",
                    game,
                    found.len(),
                    orchestrator.catalog().total_for_game(game),
                    if ready { "" } else { " (run `soulsfetch download`)" }
                );
            }
        }

        Commands::Download { game } => {
            session.restore().await;
            if !session.is_authenticated() {
                println!("Not logged in to Nexus Mods; Nexus assets will be listed for manual download.");
                println!("Run `soulsfetch auth` to enable automatic downloads.\n");
            }

            let orchestrator = build(catalog, &data_dir, session, opener)?;
            let total = orchestrator.catalog().total_for_game(&game);
            let pb = ProgressBar::new(total as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | {msg}")
                    .unwrap()
                    .progress_chars("=>-"),
            );
            pb.enable_steady_tick(Duration::from_millis(100));

            let report = orchestrator.download_all(&game, progress_sink(pb.clone())).await?;
            pb.finish_and_clear();

            print_summary(&report);
            if !report.all_satisfied {
                println!();
                print!("{}", orchestrator.manual_guide(&game));
            }
            if !report.is_success() {
                std::process::exit(1);
            }
        }

        Commands::Missing { game } => {
            let orchestrator = build(catalog, &data_dir, session, opener)?;
            let missing = orchestrator.missing_assets(&game);
            if missing.is_empty() {
                println!("Nothing missing for {}.", game);
            }
            for descriptor in missing {
                println!(
                    "{:<22} {:<8} {}",
                    descriptor.key,
                    descriptor.source.kind(),
                    descriptor.display_name()
                );
            }
        }

        Commands::Guide { game } => {
            let orchestrator = build(catalog, &data_dir, session, opener)?;
            print!("{}", orchestrator.manual_guide(&game));
        }

        Commands::Open { game } => {
            let orchestrator = build(catalog, &data_dir, session, opener)?;
            let opened = orchestrator.open_manual_sources(&game).await;
            println!("Opened {} page(s). Save the files into {}.", opened, data_dir.join(&game).display());
        }

        Commands::Normalize { game } => {
            let orchestrator = build(catalog, &data_dir, session, opener)?;
            let results = orchestrator.normalize_existing(&game);
            if results.is_empty() {
                println!("Nothing to normalize for {}.", game);
            }
            for (key, result) in results {
                println!("{:<22} {:?}", key, result);
            }
        }

        Commands::Catalog { game } => {
            let games: Vec<String> = match game {
                Some(game) => vec![game],
                None => catalog.games().into_iter().map(str::to_string).collect(),
            };
            for game in games {
                println!("=== {} ===", game);
                for d in catalog.for_game(&game) {
                    println!(
                        "{:<22} {:<8} {:<30} {}{}",
                        d.key,
                        d.source.kind(),
                        d.file_name,
                        d.description,
                        if d.essential { " [essential]" } else { "" }
                    );
                }
                println!();
            }
        }
    }

    Ok(())
}

fn default_data_dir(store: &SettingsFile) -> Result<PathBuf> {
    if let Some(dir) = store.load().data_dir {
        return Ok(PathBuf::from(dir));
    }
    let base = dirs::data_dir().context("Could not determine data directory")?;
    Ok(base.join("soulsfetch").join("Data"))
}

fn build(
    catalog: SourceCatalog,
    data_dir: &std::path::Path,
    session: AuthenticationSession,
    opener: Arc<dyn UrlOpener>,
) -> Result<Orchestrator> {
    let downloaders = Downloaders::new()?;
    Ok(Orchestrator::new(catalog, data_dir, session, downloaders, opener))
}

/// Drive the bar from acquisition events
fn progress_sink(pb: ProgressBar) -> EventSink {
    Arc::new(move |event: AcquisitionEvent| match event {
        AcquisitionEvent::Started { key, source } => {
            pb.set_message(format!("{} ({})", key, source));
        }
        AcquisitionEvent::Progress { key, bytes, total } => {
            let size = match total {
                Some(total) => format!("{}/{} KB", bytes / 1024, total / 1024),
                None => format!("{} KB", bytes / 1024),
            };
            pb.set_message(format!("{} {}", key, size));
        }
        AcquisitionEvent::Finished { key, result } => {
            if let AssetResult::Failed(failure) = &result {
                pb.println(format!("FAILED {}: {}", key, failure.reason));
            }
            pb.inc(1);
        }
        AcquisitionEvent::Message(msg) => pb.set_message(msg),
    })
}

fn print_summary(report: &Report) {
    let count = |f: fn(&AssetResult) -> bool| report.outcomes.iter().filter(|o| f(&o.result)).count();
    let downloaded = count(|r| matches!(r, AssetResult::Fetched));
    let present = count(|r| matches!(r, AssetResult::AlreadyPresent));
    let failed = count(|r| matches!(r, AssetResult::Failed(_)));

    println!("\n=== Download Summary ({}) ===", report.game);
    println!("Downloaded: {}", downloaded);
    println!("Present:    {}", present);
    println!("Failed:     {}", failed);
    for outcome in report.failures() {
        println!("  - {}", outcome.key);
    }
    if let Some(limits) = &report.nexus_limits {
        println!(
            "Nexus API:  {}/{} hourly, {}/{} daily requests left",
            limits.hourly_remaining, limits.hourly_limit, limits.daily_remaining, limits.daily_limit
        );
    }
    println!("\n{}", report.message);
}
