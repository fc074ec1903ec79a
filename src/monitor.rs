use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, Metadata};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::error::BanwatchError;
use crate::models::BanEvent;

/// Default pattern for fail2ban ban actions. `ip` is required, `jail` and
/// `restore` are optional.
pub const DEFAULT_BAN_PATTERN: &str =
    r"\[(?P<jail>[^\]\s]+)\]\s+(?P<restore>Restore\s+)?Ban\s+(?P<ip>[0-9A-Fa-f:.]+)";

/// Zone used for log timestamps that carry no UTC offset
///
/// fail2ban writes its own log in host-local time, so `Local` is the default.
/// Written in config as `local`, `utc` or a fixed offset such as `+02:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogTimezone {
    #[default]
    Local,
    Utc,
    Fixed(FixedOffset),
}

impl LogTimezone {
    /// Resolve a wall-clock time in this zone. Ambiguous local times (DST
    /// fall-back) take the earlier instant; times skipped by DST yield `None`.
    pub fn to_utc(&self, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            LogTimezone::Local => Local
                .from_local_datetime(naive)
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
            LogTimezone::Utc => Some(Utc.from_utc_datetime(naive)),
            LogTimezone::Fixed(offset) => offset
                .from_local_datetime(naive)
                .single()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

impl FromStr for LogTimezone {
    type Err = BanwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "local" => Ok(LogTimezone::Local),
            "utc" | "z" => Ok(LogTimezone::Utc),
            _ => parse_offset(trimmed)
                .map(LogTimezone::Fixed)
                .ok_or_else(|| BanwatchError::InvalidTimezone(s.to_string())),
        }
    }
}

/// `+HH`, `+HHMM` or `+HH:MM`
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let sign = match s.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits = &s[1..];
    let (hours, minutes) = match digits.len() {
        2 => (digits, "00"),
        4 => digits.split_at(2),
        5 if digits.as_bytes()[2] == b':' => (&digits[..2], &digits[3..]),
        _ => return None,
    };
    if !hours.bytes().chain(minutes.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

impl fmt::Display for LogTimezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTimezone::Local => f.write_str("local"),
            LogTimezone::Utc => f.write_str("utc"),
            LogTimezone::Fixed(offset) => write!(f, "{}", offset),
        }
    }
}

impl TryFrom<String> for LogTimezone {
    type Error = BanwatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LogTimezone> for String {
    fn from(tz: LogTimezone) -> Self {
        tz.to_string()
    }
}

/// Compiled patterns for recognizing ban lines
#[derive(Debug)]
pub struct LineParser {
    ban: Regex,
    native_ts: Regex,
    iso_ts: Regex,
    timezone: LogTimezone,
}

impl LineParser {
    pub fn new(ban_pattern: &str) -> Result<Self> {
        let ban = Regex::new(ban_pattern)
            .with_context(|| format!("Invalid ban pattern: {}", ban_pattern))?;

        if !ban.capture_names().any(|name| name == Some("ip")) {
            anyhow::bail!("Ban pattern must have an `ip` named capture group");
        }

        Ok(Self {
            ban,
            native_ts: Regex::new(r"(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})(?:,\d+)?")?,
            iso_ts: Regex::new(
                r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
            )?,
            timezone: LogTimezone::default(),
        })
    }

    /// Zone applied to timestamps without an offset
    pub fn with_timezone(mut self, timezone: LogTimezone) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn timezone(&self) -> LogTimezone {
        self.timezone
    }

    /// Parse one log line into a ban event, if it is one
    pub fn parse_line(&self, line: &str) -> Option<BanEvent> {
        let captures = self.ban.captures(line)?;

        if captures.name("restore").is_some() {
            debug!("Skipping restored ban: {}", line.trim());
            return None;
        }

        let ip = match captures.name("ip")?.as_str().parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                debug!("Ban line without a valid IP: {}", line.trim());
                return None;
            }
        };

        let Some(timestamp) = self.parse_timestamp(line) else {
            debug!("Ban line without a parsable timestamp: {}", line.trim());
            return None;
        };

        let jail = captures
            .name("jail")
            .map(|m| m.as_str())
            .unwrap_or("unknown");

        Some(BanEvent::new(timestamp, ip, jail))
    }

    /// Extract the line's timestamp. Times without an offset are read in
    /// the parser's [`LogTimezone`].
    pub fn parse_timestamp(&self, line: &str) -> Option<DateTime<Utc>> {
        if let Some(caps) = self.native_ts.captures(line) {
            if let Ok(naive) = NaiveDateTime::parse_from_str(&caps[1], "%Y-%m-%d %H:%M:%S") {
                return self.timezone.to_utc(&naive);
            }
        }

        let raw = self.iso_ts.find(line)?.as_str();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        // `+0200` style offsets
        if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
            return Some(dt.with_timezone(&Utc));
        }

        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .and_then(|naive| self.timezone.to_utc(&naive))
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new(DEFAULT_BAN_PATTERN).expect("default ban pattern compiles")
    }
}

/// Whole-file reader over the ban log
///
/// Every call to [`LogReader::events`] opens the path again, so the sequence
/// can be restarted at will and always follows the file currently at `path`.
#[derive(Debug, Clone)]
pub struct LogReader {
    path: PathBuf,
    parser: Arc<LineParser>,
}

impl LogReader {
    pub fn new(path: impl Into<PathBuf>, parser: Arc<LineParser>) -> Self {
        Self {
            path: path.into(),
            parser,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazily iterate over every ban in the file
    pub fn events(&self) -> Result<LogEvents, BanwatchError> {
        let file = open_log(&self.path)?;
        Ok(LogEvents {
            reader: BufReader::new(file),
            parser: self.parser.clone(),
            buf: Vec::new(),
        })
    }

    /// Read all events, treating an unreadable log as empty
    pub fn read_all_or_warn(&self) -> Vec<BanEvent> {
        match self.events() {
            Ok(events) => events.collect(),
            Err(e) => {
                warn!("{}; continuing with no events", e);
                Vec::new()
            }
        }
    }
}

fn open_log(path: &Path) -> Result<File, BanwatchError> {
    File::open(path).map_err(|source| BanwatchError::LogUnreadable {
        path: path.to_path_buf(),
        source,
    })
}

/// Iterator returned by [`LogReader::events`]
pub struct LogEvents {
    reader: BufReader<File>,
    parser: Arc<LineParser>,
    buf: Vec<u8>,
}

impl Iterator for LogEvents {
    type Item = BanEvent;

    fn next(&mut self) -> Option<BanEvent> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&self.buf);
                    if let Some(event) = self.parser.parse_line(&line) {
                        return Some(event);
                    }
                }
                Err(e) => {
                    warn!("Error reading ban log: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Incremental reader that only returns lines appended since the last poll
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    parser: Arc<LineParser>,
    position: u64,
    file_id: Option<u64>,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>, parser: Arc<LineParser>) -> Self {
        Self {
            path: path.into(),
            parser,
            position: 0,
            file_id: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read complete lines appended since the previous poll
    pub fn poll(&mut self) -> Result<Vec<BanEvent>, BanwatchError> {
        let file = open_log(&self.path)?;
        let metadata = file.metadata()?;
        let id = file_id(&metadata);

        // Replaced (new inode) or truncated in place
        let replaced = matches!((self.file_id, id), (Some(old), Some(new)) if old != new);
        if replaced || metadata.len() < self.position {
            info!(
                "Log file {} appears to have been rotated, starting from beginning",
                self.path.display()
            );
            self.position = 0;
        }
        self.file_id = id;

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.position))?;

        let mut events = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            // A trailing fragment is picked up once the writer finishes the line
            if read == 0 || !buf.ends_with(b"\n") {
                break;
            }
            self.position += read as u64;

            if let Some(event) = self.parser.parse_line(&String::from_utf8_lossy(&buf)) {
                events.push(event);
            }
        }

        Ok(events)
    }
}

#[cfg(unix)]
pub(crate) fn file_id(metadata: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
pub(crate) fn file_id(_metadata: &Metadata) -> Option<u64> {
    None
}

/// Poll the tail once and append new events to the store
pub fn sync_tail(tail: &mut LogTail, db: &Database) -> Result<usize> {
    let events = match tail.poll() {
        Ok(events) => events,
        Err(e @ BanwatchError::LogUnreadable { .. }) => {
            warn!("{}", e);
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    if events.is_empty() {
        return Ok(0);
    }

    let inserted = db.insert_events(&events)?;
    if inserted > 0 {
        info!("Recorded {} new bans from {}", inserted, tail.path().display());
    }
    Ok(inserted)
}

/// Watch the directory holding `path` and call `sync` whenever the log
/// changes, plus once per `interval`. Runs until the task is aborted.
///
/// `sync` does file and database I/O, so each call runs on the blocking pool.
pub async fn start_monitoring<F>(path: &Path, interval: Duration, sync: F) -> Result<()>
where
    F: FnMut() -> Result<usize> + Send + 'static,
{
    let (watcher_tx, mut watcher_rx) = mpsc::channel::<Result<Event, notify::Error>>(100);

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = watcher_tx.blocking_send(res);
        },
        Config::default(),
    )
    .context("Failed to create file watcher")?;

    let watched_name = path.file_name().map(|n| n.to_os_string());
    if let Some(parent) = path.parent().filter(|p| p.exists()) {
        watcher.watch(parent, RecursiveMode::NonRecursive)?;
        info!("Watching directory: {}", parent.display());
    } else {
        warn!(
            "Directory of {} does not exist, falling back to polling",
            path.display()
        );
    }

    info!(
        "Log monitoring started for {} (poll every {:?})",
        path.display(),
        interval
    );

    let sync = Arc::new(Mutex::new(sync));
    let run_sync = || {
        let sync = sync.clone();
        async move {
            let outcome = tokio::task::spawn_blocking(move || {
                let mut sync = sync.lock();
                (*sync)()
            })
            .await;
            match outcome {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => debug!("Log sync stored {} bans", n),
                Ok(Err(e)) => error!("Log sync failed: {:#}", e),
                Err(e) => error!("Log sync task panicked: {}", e),
            }
        }
    };

    // First tick completes immediately and doubles as the initial sync
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            Some(res) = watcher_rx.recv() => {
                match res {
                    Ok(event) => {
                        let ours = event.paths.iter().any(|p| {
                            p.file_name().map(|n| n.to_os_string()) == watched_name
                        });
                        if ours {
                            run_sync().await;
                        }
                    }
                    Err(e) => error!("File watcher error: {}", e),
                }
            }

            // Also poll periodically in case we miss file events
            _ = ticker.tick() => run_sync().await,
        }
    }
}
