pub mod bot;
pub mod chart;
pub mod config;
pub mod database;
pub mod error;
pub mod format;
pub mod geoip;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod period;
pub mod status;
pub mod telegram;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use chart::{ChartRenderer, SvgChartRenderer};
use config::Config;
use database::Database;
use geoip::GeoResolver;
use models::{CountryTally, ServiceStatus};
use monitor::{sync_tail, LineParser, LogReader, LogTail, DEFAULT_BAN_PATTERN};
use notify::ChatTarget;
use period::{
    aggregate_timestamps, bucket_counts, comparison_window, Bucket, Granularity, Period,
    PeriodStats,
};
use status::StatusProbe;

/// Core banwatch instance
pub struct Banwatch {
    config: Arc<Config>,
    db: Database,
    geo: GeoResolver,
    probe: StatusProbe,
    charts: Box<dyn ChartRenderer>,
    parser: Arc<LineParser>,
    tail: Mutex<LogTail>,
}

impl Banwatch {
    /// Create a new instance backed by the configured database
    pub fn new(config: Config) -> Result<Self> {
        let db = Database::open(&config.general.db_path).with_context(|| {
            format!(
                "Failed to open ban store at {}",
                config.general.db_path.display()
            )
        })?;
        let probe = StatusProbe::from_config(&config.fail2ban);
        let charts = Box::new(SvgChartRenderer::new(&config.charts));
        Self::with_parts(config, db, probe, charts)
    }

    /// Create an instance from explicit collaborators
    pub fn with_parts(
        config: Config,
        db: Database,
        probe: StatusProbe,
        charts: Box<dyn ChartRenderer>,
    ) -> Result<Self> {
        let pattern = config
            .fail2ban
            .ban_pattern
            .as_deref()
            .unwrap_or(DEFAULT_BAN_PATTERN);
        let parser = Arc::new(
            LineParser::new(pattern)
                .context("Invalid fail2ban.ban_pattern")?
                .with_timezone(config.fail2ban.log_timezone),
        );
        let tail = LogTail::new(config.fail2ban.log_file.clone(), parser.clone());
        let geo = GeoResolver::from_config(&config.geoip);

        Ok(Self {
            config: Arc::new(config),
            db,
            geo,
            probe,
            charts,
            parser,
            tail: Mutex::new(tail),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<Config> {
        self.config.clone()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn geo(&self) -> &GeoResolver {
        &self.geo
    }

    pub fn charts(&self) -> &dyn ChartRenderer {
        self.charts.as_ref()
    }

    /// Whole-file reader over the configured log
    pub fn log_reader(&self) -> LogReader {
        LogReader::new(self.config.fail2ban.log_file.clone(), self.parser.clone())
    }

    /// Chat that receives notices and digests
    pub fn notify_target(&self) -> Option<ChatTarget> {
        self.config
            .telegram
            .chat_id
            .map(|chat| ChatTarget::new(chat, self.config.telegram.message_thread_id))
    }

    /// Fold new log lines into the store and apply retention
    pub fn sync_log(&self) -> Result<usize> {
        let inserted = {
            let mut tail = self.tail.lock();
            sync_tail(&mut tail, &self.db)?
        };

        let retention = self.config.general.retention_days;
        if retention > 0 {
            let cutoff = Utc::now() - Duration::days(i64::from(retention));
            self.db.prune_before(cutoff)?;
        }

        Ok(inserted)
    }

    /// Bans in the period containing `now` and the one before it
    pub fn period_stats(&self, granularity: Granularity, now: DateTime<Utc>) -> Result<PeriodStats> {
        let (current, previous) = comparison_window(granularity, now)?;
        let timestamps = self.db.timestamps_between(previous.start, current.end)?;
        Ok(aggregate_timestamps(timestamps, granularity, now)?)
    }

    pub fn breakdown(&self, period: &Period) -> Result<Vec<Bucket>> {
        let timestamps = self.db.timestamps_between(period.start, period.end)?;
        Ok(bucket_counts(timestamps, period))
    }

    pub fn jail_counts(&self, period: &Period) -> Result<Vec<(String, u64)>> {
        Ok(self.db.jail_counts_between(period.start, period.end)?)
    }

    /// Country distribution of bans in `period`, or of every stored ban
    pub fn country_tally(&self, period: Option<&Period>) -> Result<CountryTally> {
        let events = match period {
            Some(p) => self.db.events_between(p.start, p.end)?,
            None => self.db.all_events()?,
        };
        Ok(self.geo.tally(events.into_iter().map(|e| e.ip)))
    }

    pub async fn service_status(&self) -> error::Result<ServiceStatus> {
        self.probe.probe().await
    }

    /// Day, week and month stats for the periodic digest
    pub fn digest(&self, now: DateTime<Utc>) -> Result<Vec<PeriodStats>> {
        [Granularity::Day, Granularity::Week, Granularity::Month]
            .into_iter()
            .map(|g| self.period_stats(g, now))
            .collect()
    }
}
