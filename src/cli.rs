use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};

use banwatch::config::Config;
use banwatch::error::BanwatchError;
use banwatch::format::trend_arrow;
use banwatch::geoip::{Freshness, GeoIpUpdater, UpdateOutcome};
use banwatch::models::JailDetail;
use banwatch::period::{Granularity, Period};
use banwatch::{bot, Banwatch};

#[derive(Parser)]
#[command(name = "banwatch")]
#[command(author, version, about = "fail2ban ban statistics and Telegram notifier")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the Telegram bot
    Run,

    /// Show ban counts per period
    Stats {
        /// Only this period (hour, day, week, month, year)
        #[arg(short, long)]
        period: Option<Granularity>,
    },

    /// Show fail2ban service and jail status
    Status,

    /// Show banned IPs by country
    Geo {
        /// Only the current period (hour, day, week, month, year)
        #[arg(short, long)]
        period: Option<Granularity>,

        /// Number of countries to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Import new lines from the fail2ban log
    Sync,

    /// Download the GeoIP database if it is missing or stale
    GeoipUpdate {
        /// Download even if the current database is fresh
        #[arg(short, long)]
        force: bool,
    },

    /// Validate configuration for running the bot
    CheckConfig,

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Table row for period stats
#[derive(Tabled)]
struct PeriodRow {
    #[tabled(rename = "Period")]
    period: String,
    #[tabled(rename = "Range (UTC)")]
    range: String,
    #[tabled(rename = "Bans")]
    count: u64,
    #[tabled(rename = "Previous")]
    previous: u64,
    #[tabled(rename = "Change")]
    change: String,
}

/// Table row for country list
#[derive(Tabled)]
struct CountryRow {
    #[tabled(rename = "#")]
    rank: usize,
    #[tabled(rename = "Country")]
    country: String,
    #[tabled(rename = "Code")]
    code: String,
    #[tabled(rename = "Bans")]
    count: u64,
    #[tabled(rename = "Share")]
    share: String,
}

/// Table row for jail counters
#[derive(Tabled)]
struct JailRow {
    #[tabled(rename = "Jail")]
    jail: String,
    #[tabled(rename = "Failed now")]
    currently_failed: String,
    #[tabled(rename = "Failed total")]
    total_failed: String,
    #[tabled(rename = "Banned now")]
    currently_banned: String,
    #[tabled(rename = "Banned total")]
    total_banned: String,
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Stats { period } => cmd_stats(config, period).await,
        Commands::Status => cmd_status(config).await,
        Commands::Geo { period, limit } => cmd_geo(config, period, limit).await,
        Commands::Sync => cmd_sync(config).await,
        Commands::GeoipUpdate { force } => cmd_geoip_update(config, force).await,
        Commands::CheckConfig => cmd_check_config(config),
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

async fn cmd_run(config: Config) -> Result<()> {
    let app = Arc::new(Banwatch::new(config)?);
    bot::run(app).await
}

/// Open the store and fold in whatever the log has gained
async fn open_synced(config: Config) -> Result<Arc<Banwatch>> {
    let app = Arc::new(Banwatch::new(config)?);
    let worker = app.clone();
    match tokio::task::spawn_blocking(move || worker.sync_log()).await? {
        Ok(n) if n > 0 => println!("Imported {} new bans", n.to_string().cyan()),
        Ok(_) => {}
        Err(e) => eprintln!("{} {:#}", "Warning:".yellow().bold(), e),
    }
    Ok(app)
}

async fn cmd_stats(config: Config, period: Option<Granularity>) -> Result<()> {
    let app = open_synced(config).await?;
    let now = Utc::now();

    let granularities: Vec<Granularity> = match period {
        Some(g) => vec![g],
        None => Granularity::ALL.to_vec(),
    };

    let mut rows = Vec::with_capacity(granularities.len());
    for g in &granularities {
        let stats = app.period_stats(*g, now)?;
        rows.push(PeriodRow {
            period: g.label().to_string(),
            range: stats.period.to_string(),
            count: stats.count,
            previous: stats.previous_count,
            change: format!(
                "{} {:+} ({:.1}%)",
                trend_arrow(stats.trend()),
                stats.delta(),
                stats.percent_change()
            ),
        });
    }

    println!("{}", "=== fail2ban Ban Statistics ===".bold());
    println!("{}", Table::new(rows));

    if let Some(g) = period {
        let current = Period::containing(g, now)?;
        let jails = app.jail_counts(&current)?;
        if !jails.is_empty() {
            println!("\n{}", "Bans by jail:".bold());
            for (jail, count) in jails {
                println!("  {}: {}", jail, count);
            }
        }
    }

    println!("\nStored bans (all time): {}", app.database().count_all()?);
    Ok(())
}

async fn cmd_status(config: Config) -> Result<()> {
    let app = Banwatch::new(config)?;

    let status = match app.service_status().await {
        Ok(status) => status,
        Err(BanwatchError::ProbeUnavailable(reason)) => {
            println!("{}", "fail2ban: UNAVAILABLE".red().bold());
            println!("{}", reason);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let flag = |on: bool| if on { "yes".green() } else { "no".red() };
    println!("{}", "=== fail2ban Service Status ===".bold());
    println!("Running:    {}", flag(status.running));
    println!("Enabled:    {}", flag(status.enabled));
    println!("Version:    {}", status.version);
    println!(
        "Started at: {}",
        status
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );

    let mut rows = Vec::new();
    for (jail, detail) in &status.jails {
        match detail {
            JailDetail::Counters(c) => rows.push(JailRow {
                jail: jail.clone(),
                currently_failed: c.currently_failed.to_string(),
                total_failed: c.total_failed.to_string(),
                currently_banned: c.currently_banned.to_string().yellow().to_string(),
                total_banned: c.total_banned.to_string(),
            }),
            JailDetail::Unavailable(reason) => {
                let unavailable = "n/a".red().to_string();
                eprintln!("{} jail {}: {}", "Warning:".yellow().bold(), jail, reason);
                rows.push(JailRow {
                    jail: jail.clone(),
                    currently_failed: unavailable.clone(),
                    total_failed: unavailable.clone(),
                    currently_banned: unavailable.clone(),
                    total_banned: unavailable,
                });
            }
        }
    }
    if !rows.is_empty() {
        println!("\n{}", Table::new(rows));
    }

    Ok(())
}

async fn cmd_geo(config: Config, period: Option<Granularity>, limit: usize) -> Result<()> {
    let app = open_synced(config).await?;
    if !app.geo().is_loaded() {
        eprintln!(
            "{} GeoIP database {} is not available; run `banwatch geoip-update`",
            "Warning:".yellow().bold(),
            app.geo().path().display()
        );
    }

    let current = period
        .map(|g| Period::containing(g, Utc::now()))
        .transpose()?;
    let tally = app.country_tally(current.as_ref())?;

    if tally.is_empty() {
        println!("No banned IPs found");
        return Ok(());
    }

    let total = tally.total() as f64;
    let rows: Vec<CountryRow> = tally
        .top(limit)
        .into_iter()
        .enumerate()
        .map(|(i, (code, country))| CountryRow {
            rank: i + 1,
            country: country.name,
            code,
            count: country.count,
            share: format!("{:.1}%", country.count as f64 / total * 100.0),
        })
        .collect();

    match &current {
        Some(p) => println!("{} {}", "Banned IPs by country:".bold(), p),
        None => println!("{}", "Banned IPs by country (all time):".bold()),
    }
    println!("{}", Table::new(rows));
    if tally.unknown > 0 {
        println!("Unknown location: {}", tally.unknown.to_string().yellow());
    }
    println!("Total: {}", tally.total());

    Ok(())
}

async fn cmd_sync(config: Config) -> Result<()> {
    let app = Arc::new(Banwatch::new(config)?);
    let worker = app.clone();
    let inserted = tokio::task::spawn_blocking(move || worker.sync_log()).await??;

    println!(
        "{} {} new bans from {}",
        "Imported".green().bold(),
        inserted,
        app.config().fail2ban.log_file.display()
    );
    if let Some(latest) = app.database().latest()? {
        println!(
            "Latest ban: {} {} [{}]",
            latest.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            latest.ip,
            latest.jail
        );
    }
    Ok(())
}

async fn cmd_geoip_update(config: Config, force: bool) -> Result<()> {
    let updater = GeoIpUpdater::new(&config.geoip)?;
    let now = Utc::now();

    let outcome = if force {
        let previous = match updater.freshness(now) {
            Freshness::Missing => None,
            Freshness::Stale { modified } | Freshness::Fresh { modified } => Some(modified),
        };
        match updater.refresh().await {
            Ok(bytes) => UpdateOutcome::Installed { previous, bytes },
            Err(e) => UpdateOutcome::Failed(e.to_string()),
        }
    } else {
        updater.refresh_if_needed(now).await
    };

    match outcome {
        UpdateOutcome::UpToDate { modified } => {
            println!(
                "GeoIP database is up to date (updated {})",
                modified.format("%Y-%m-%d")
            );
        }
        UpdateOutcome::Installed { bytes, .. } => {
            println!(
                "{} {} ({} bytes)",
                "Installed".green().bold(),
                updater.path().display(),
                bytes
            );
        }
        UpdateOutcome::Failed(reason) => {
            anyhow::bail!("GeoIP update failed: {}", reason);
        }
    }
    Ok(())
}

fn cmd_check_config(config: Config) -> Result<()> {
    println!("{:#?}", config);
    config
        .validate_for_bot()
        .context("Configuration is not ready for `banwatch run`")?;
    println!("{}", "Configuration OK".green().bold());
    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    let toml_str = toml::to_string_pretty(&config)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &toml_str)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml_str);
        }
    }

    Ok(())
}
