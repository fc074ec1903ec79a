use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::period::Granularity;

#[derive(Debug, Error)]
pub enum BanwatchError {
    #[error("log file {path} is unreadable: {source}")]
    LogUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid granularity '{0}' (expected hour, day, week, month or year)")]
    InvalidGranularity(String),

    #[error("no {granularity} period around {reference} fits the supported calendar range")]
    PeriodOutOfRange {
        granularity: Granularity,
        reference: DateTime<Utc>,
    },

    #[error("invalid log timezone '{0}' (expected local, utc or an offset like +02:00)")]
    InvalidTimezone(String),

    #[error("no geolocation record for {0}")]
    LookupMiss(String),

    #[error("fail2ban control interface unavailable: {0}")]
    ProbeUnavailable(String),

    #[error("delivery failed: {0}")]
    TransportDelivery(String),

    #[error("missing required configuration: {0}")]
    ConfigurationMissing(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("render error: {0}")]
    Render(String),

    #[error("geoip update failed: {0}")]
    GeoIpUpdate(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BanwatchError>;
