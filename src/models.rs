use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

/// A single ban recorded by fail2ban
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEvent {
    pub timestamp: DateTime<Utc>,
    pub ip: IpAddr,
    pub jail: String,
}

impl BanEvent {
    pub fn new(timestamp: DateTime<Utc>, ip: IpAddr, jail: impl Into<String>) -> Self {
        Self {
            timestamp,
            ip,
            jail: jail.into(),
        }
    }
}

/// Result of resolving one IP against the GeoIP database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeoLookup {
    Country { code: String, name: String },
    Unknown,
}

impl GeoLookup {
    pub fn country_code(&self) -> Option<&str> {
        match self {
            GeoLookup::Country { code, .. } => Some(code),
            GeoLookup::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, GeoLookup::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryCount {
    pub name: String,
    pub count: u64,
}

/// Ban counts grouped by country, with an explicit bucket for unresolved IPs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryTally {
    pub countries: HashMap<String, CountryCount>,
    pub unknown: u64,
}

impl CountryTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, lookup: &GeoLookup) {
        match lookup {
            GeoLookup::Country { code, name } => {
                self.countries
                    .entry(code.clone())
                    .or_insert_with(|| CountryCount {
                        name: name.clone(),
                        count: 0,
                    })
                    .count += 1;
            }
            GeoLookup::Unknown => self.unknown += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.known() + self.unknown
    }

    pub fn known(&self) -> u64 {
        self.countries.values().map(|c| c.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Countries sorted by count (descending), ties broken by code
    pub fn top(&self, limit: usize) -> Vec<(String, CountryCount)> {
        let mut rows: Vec<(String, CountryCount)> = self
            .countries
            .iter()
            .map(|(code, c)| (code.clone(), c.clone()))
            .collect();
        rows.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));
        rows.truncate(limit);
        rows
    }
}

/// Parsed `fail2ban-client status <jail>` output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailCounters {
    pub currently_failed: u64,
    pub total_failed: u64,
    pub currently_banned: u64,
    pub total_banned: u64,
    pub file_list: Vec<String>,
    pub banned_ips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JailDetail {
    Counters(JailCounters),
    Unavailable(String),
}

/// fail2ban service state, fetched fresh on every request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub enabled: bool,
    pub version: String,
    pub started_at: Option<DateTime<Utc>>,
    pub jails: BTreeMap<String, JailDetail>,
}
