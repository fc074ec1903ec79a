//! Country resolution for banned addresses
//!
//! Lookups go through a MaxMind GeoLite2 database loaded fully into memory.
//! The database is reloaded whenever the file on disk changes, so the
//! updater can swap in a new copy without restarting the process.

use std::io::{Cursor, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use lru::LruCache;
use maxminddb::{geoip2, MaxMindDBError, Reader};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::GeoIpConfig;
use crate::error::{BanwatchError, Result};
use crate::models::{CountryTally, GeoLookup};
use crate::monitor::file_id;

const EDITION: &str = "GeoLite2-City";

/// IP → country resolver with an LRU cache in front of the database
pub struct GeoResolver {
    path: PathBuf,
    state: Mutex<ResolverState>,
}

struct ResolverState {
    reader: Option<Reader<Vec<u8>>>,
    loaded: Option<FileStamp>,
    cache: LruCache<IpAddr, GeoLookup>,
}

/// Identity of the database file on disk. An atomic install always yields a
/// new inode, even when the mtime does not move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
    file_id: Option<u64>,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let metadata = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: metadata.modified().ok()?,
            len: metadata.len(),
            file_id: file_id(&metadata),
        })
    }
}

impl GeoResolver {
    pub fn new<P: Into<PathBuf>>(path: P, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            path: path.into(),
            state: Mutex::new(ResolverState {
                reader: None,
                loaded: None,
                cache: LruCache::new(capacity),
            }),
        }
    }

    pub fn from_config(config: &GeoIpConfig) -> Self {
        Self::new(config.db_path.clone(), config.cache_size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a database is currently loaded
    pub fn is_loaded(&self) -> bool {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        state.reader.is_some()
    }

    /// Resolve a single address. Never fails: anything unresolvable is `Unknown`.
    pub fn resolve(&self, ip: IpAddr) -> GeoLookup {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        resolve_cached(&mut state, ip)
    }

    /// Resolve every address and count them per country
    pub fn tally<I>(&self, ips: I) -> CountryTally
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let mut state = self.state.lock();
        self.refresh(&mut state);

        let mut tally = CountryTally::new();
        for ip in ips {
            tally.add(&resolve_cached(&mut state, ip));
        }
        tally
    }

    // Reload when the file appears, disappears or is replaced
    fn refresh(&self, state: &mut ResolverState) {
        let stamp = FileStamp::of(&self.path);

        // Also covers a file that already failed to load
        if stamp == state.loaded {
            return;
        }

        state.cache.clear();
        state.loaded = stamp;

        if stamp.is_none() {
            if state.reader.take().is_some() {
                warn!("GeoIP database {} disappeared", self.path.display());
            }
            return;
        }

        match Reader::open_readfile(&self.path) {
            Ok(reader) => {
                info!(
                    "Loaded GeoIP database {} (build {})",
                    self.path.display(),
                    reader.metadata.build_epoch
                );
                state.reader = Some(reader);
            }
            Err(e) => {
                warn!("Failed to load GeoIP database {}: {}", self.path.display(), e);
                state.reader = None;
            }
        }
    }
}

fn resolve_cached(state: &mut ResolverState, ip: IpAddr) -> GeoLookup {
    if let Some(hit) = state.cache.get(&ip) {
        return hit.clone();
    }

    let result = match state.reader.as_ref() {
        Some(reader) if !is_reserved(&ip) => lookup(reader, ip),
        _ => GeoLookup::Unknown,
    };
    state.cache.put(ip, result.clone());
    result
}

fn lookup(reader: &Reader<Vec<u8>>, ip: IpAddr) -> GeoLookup {
    let record: geoip2::Country = match reader.lookup(ip) {
        Ok(record) => record,
        Err(MaxMindDBError::AddressNotFoundError(_)) => {
            debug!("{}", BanwatchError::LookupMiss(ip.to_string()));
            return GeoLookup::Unknown;
        }
        Err(e) => {
            debug!("GeoIP lookup for {} failed: {}", ip, e);
            return GeoLookup::Unknown;
        }
    };

    let Some(country) = record.country else {
        debug!("{}", BanwatchError::LookupMiss(ip.to_string()));
        return GeoLookup::Unknown;
    };
    let Some(code) = country.iso_code else {
        return GeoLookup::Unknown;
    };

    let name = country
        .names
        .and_then(|n| n.get("en").map(|s| s.to_string()))
        .unwrap_or_else(|| code.to_string());

    GeoLookup::Country {
        code: code.to_string(),
        name,
    }
}

/// Addresses that never appear in a geolocation database
pub fn is_reserved(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_reserved_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_reserved_v4(&v4);
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
                || (first == 0x2001 && v6.segments()[1] == 0x0db8)
        }
    }
}

fn is_reserved_v4(v4: &Ipv4Addr) -> bool {
    let octets = v4.octets();
    v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_broadcast()
        || v4.is_documentation()
        || v4.is_unspecified()
        || v4.is_multicast()
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64) // CGNAT
        || octets[0] >= 240
}

/// Age of the on-disk database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Missing,
    Stale { modified: DateTime<Utc> },
    Fresh { modified: DateTime<Utc> },
}

/// What a refresh check ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate { modified: DateTime<Utc> },
    Installed { previous: Option<DateTime<Utc>>, bytes: u64 },
    Failed(String),
}

/// Keeps the GeoLite2 database from going stale
pub struct GeoIpUpdater {
    config: GeoIpConfig,
    client: reqwest::Client,
}

impl GeoIpUpdater {
    pub fn new(config: &GeoIpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs.max(1)))
            .build()
            .map_err(|e| BanwatchError::GeoIpUpdate(e.without_url().to_string()))?;

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.db_path
    }

    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        let modified = match std::fs::metadata(&self.config.db_path).and_then(|m| m.modified()) {
            Ok(t) => DateTime::<Utc>::from(t),
            Err(_) => return Freshness::Missing,
        };

        let max_age = chrono::Duration::days(i64::from(self.config.update_days));
        if now - modified >= max_age {
            Freshness::Stale { modified }
        } else {
            Freshness::Fresh { modified }
        }
    }

    /// Download a new database when the current one is missing or stale
    pub async fn refresh_if_needed(&self, now: DateTime<Utc>) -> UpdateOutcome {
        let previous = match self.freshness(now) {
            Freshness::Fresh { modified } => {
                debug!("GeoIP database is up to date ({})", modified.format("%Y-%m-%d"));
                return UpdateOutcome::UpToDate { modified };
            }
            Freshness::Stale { modified } => {
                info!(
                    "GeoIP database is outdated ({}), updating",
                    modified.format("%Y-%m-%d")
                );
                Some(modified)
            }
            Freshness::Missing => {
                info!("GeoIP database not found, downloading a fresh copy");
                None
            }
        };

        match self.refresh().await {
            Ok(bytes) => UpdateOutcome::Installed { previous, bytes },
            Err(e) => {
                warn!("{}", e);
                UpdateOutcome::Failed(e.to_string())
            }
        }
    }

    /// Unconditionally download and install the database. Returns its size.
    pub async fn refresh(&self) -> Result<u64> {
        let archive = self.download().await?;
        let target = self.config.db_path.clone();

        tokio::task::spawn_blocking(move || -> Result<u64> {
            let data = extract_mmdb(&archive)?;
            Reader::from_source(data.clone()).map_err(|e| {
                BanwatchError::GeoIpUpdate(format!("downloaded database is invalid: {}", e))
            })?;
            install_atomic(&data, &target)?;
            Ok(data.len() as u64)
        })
        .await
        .map_err(|e| BanwatchError::GeoIpUpdate(format!("extraction task failed: {}", e)))?
    }

    async fn download(&self) -> Result<Vec<u8>> {
        let license_key = self
            .config
            .license_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| BanwatchError::GeoIpUpdate("MAXMIND_LICENSE_KEY is not set".into()))?;

        let base = self.config.download_url.trim_end_matches('/');
        let request = match self.config.account_id {
            Some(account_id) => self
                .client
                .get(format!("{}/geoip/databases/{}/download", base, EDITION))
                .query(&[("suffix", "tar.gz")])
                .basic_auth(account_id, Some(license_key)),
            None => self
                .client
                .get(format!("{}/app/geoip_download", base))
                .query(&[
                    ("edition_id", EDITION),
                    ("license_key", license_key),
                    ("suffix", "tar.gz"),
                ]),
        };

        info!("Downloading {} database", EDITION);
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BanwatchError::GeoIpUpdate(format!("download failed: {}", e.without_url())))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| BanwatchError::GeoIpUpdate(format!("download failed: {}", e.without_url())))?;

        debug!("Downloaded {} bytes", body.len());
        Ok(body.to_vec())
    }
}

/// Pull the first `.mmdb` member out of a `.tar.gz` archive
pub fn extract_mmdb(archive: &[u8]) -> Result<Vec<u8>> {
    let mut tar = tar::Archive::new(GzDecoder::new(Cursor::new(archive)));

    for entry in tar.entries()? {
        let mut entry = entry?;
        let is_mmdb = entry
            .path()?
            .extension()
            .map_or(false, |ext| ext == "mmdb");
        if !is_mmdb {
            continue;
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        return Ok(data);
    }

    Err(BanwatchError::GeoIpUpdate("no .mmdb file found in archive".into()))
}

/// Write `data` next to `target` and rename it into place
pub fn install_atomic(data: &[u8], target: &Path) -> Result<()> {
    let dir = match target.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| BanwatchError::Io(e.error))?;

    info!("Installed GeoIP database at {}", target.display());
    Ok(())
}
