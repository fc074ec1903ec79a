use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::BanwatchError;
use crate::monitor::LogTimezone;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub fail2ban: Fail2banConfig,

    #[serde(default)]
    pub geoip: GeoIpConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub charts: ChartConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load from the first config file found in default locations, or use defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/banwatch/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("banwatch/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay values from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary variable source. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(token) = var("BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(admins) = var("ADMINS") {
            self.telegram.admins = parse_list(&admins, "ADMINS")?;
        }
        if let Some(chat) = var("CHAT_ID") {
            self.telegram.chat_id = Some(parse_var(&chat, "CHAT_ID")?);
        }
        if let Some(thread) = var("MESSAGE_THREAD_ID") {
            self.telegram.message_thread_id = Some(parse_var(&thread, "MESSAGE_THREAD_ID")?);
        }

        if let Some(log_file) = var("LOG_FILE") {
            self.fail2ban.log_file = PathBuf::from(log_file);
        }
        if let Some(jails) = var("F2B_JAIL_NAMES") {
            self.fail2ban.jails = parse_list(&jails, "F2B_JAIL_NAMES")?;
        }
        if let Some(tz) = var("LOG_TIMEZONE") {
            self.fail2ban.log_timezone = parse_var(&tz, "LOG_TIMEZONE")?;
        }

        if let Some(level) = var("LOG_LEVEL") {
            self.general.log_level = level.to_lowercase();
        }
        if let Some(db) = var("DB_PATH") {
            self.general.db_path = PathBuf::from(db);
        }
        if let Some(secs) = var("BOT_SYNC_INTERVAL_SECONDS") {
            self.general.sync_interval_secs = parse_var(&secs, "BOT_SYNC_INTERVAL_SECONDS")?;
        }
        if let Some(hours) = var("DIGEST_INTERVAL_HOURS") {
            self.general.digest_interval_hours = parse_var(&hours, "DIGEST_INTERVAL_HOURS")?;
        }
        if let Some(days) = var("RETENTION_DAYS") {
            self.general.retention_days = parse_var(&days, "RETENTION_DAYS")?;
        }

        if let Some(path) = var("GEOIP_DB_PATH") {
            self.geoip.db_path = PathBuf::from(path);
        }
        if let Some(days) = var("GEOIP_UPDATE_DAYS") {
            self.geoip.update_days = parse_var(&days, "GEOIP_UPDATE_DAYS")?;
        }
        if let Some(size) = var("GEOIP_CACHE_SIZE") {
            self.geoip.cache_size = parse_var(&size, "GEOIP_CACHE_SIZE")?;
        }
        if let Some(secs) = var("GEOIP_DOWNLOAD_TIMEOUT_SECONDS") {
            self.geoip.download_timeout_secs = parse_var(&secs, "GEOIP_DOWNLOAD_TIMEOUT_SECONDS")?;
        }
        if let Some(id) = var("MAXMIND_ACCOUNT_ID") {
            self.geoip.account_id = Some(parse_var(&id, "MAXMIND_ACCOUNT_ID")?);
        }
        if let Some(key) = var("MAXMIND_LICENSE_KEY") {
            self.geoip.license_key = Some(key);
        }

        if let Some(items) = var("MAP_LEGEND_ITEMS") {
            self.charts.legend_items = parse_var(&items, "MAP_LEGEND_ITEMS")?;
        }

        Ok(())
    }

    /// File (explicit or discovered) plus environment overrides
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::load_or_default()?,
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Check the settings the chat bot cannot start without
    pub fn validate_for_bot(&self) -> crate::error::Result<()> {
        if self.telegram.bot_token.is_empty() {
            return Err(BanwatchError::ConfigurationMissing("BOT_TOKEN".into()));
        }
        if self.telegram.admins.is_empty() {
            return Err(BanwatchError::ConfigurationMissing("ADMINS".into()));
        }
        if self.telegram.chat_id.is_none() {
            return Err(BanwatchError::ConfigurationMissing("CHAT_ID".into()));
        }
        Ok(())
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.telegram.admins.contains(&user_id)
    }
}

fn parse_var<T>(raw: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .with_context(|| format!("Invalid value for {}: '{}'", key, raw))
}

fn parse_list<T>(raw: &str, key: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_var(s, key))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Path to the ban store
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How often the bot folds new log lines into the store
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Periodic digest to the notification chat (0 = disabled)
    #[serde(default)]
    pub digest_interval_hours: u64,

    /// Drop stored bans older than this many days (0 = keep forever)
    #[serde(default)]
    pub retention_days: u32,
}

impl GeneralConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn digest_interval(&self) -> Option<Duration> {
        (self.digest_interval_hours > 0)
            .then(|| Duration::from_secs(self.digest_interval_hours.saturating_mul(3600)))
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            sync_interval_secs: default_sync_interval(),
            digest_interval_hours: 0,
            retention_days: 0,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,

    /// User IDs allowed to talk to the bot
    #[serde(default)]
    pub admins: Vec<i64>,

    /// Chat that receives notices and digests
    #[serde(default)]
    pub chat_id: Option<i64>,

    /// Forum topic inside `chat_id`
    #[serde(default)]
    pub message_thread_id: Option<i64>,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Long-poll timeout for getUpdates
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            admins: Vec::new(),
            chat_id: None,
            message_thread_id: None,
            api_url: default_api_url(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

// Keep the token out of debug output
impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &crate::telegram::mask_token(&self.bot_token))
            .field("admins", &self.admins)
            .field("chat_id", &self.chat_id)
            .field("message_thread_id", &self.message_thread_id)
            .field("api_url", &self.api_url)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fail2banConfig {
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Jails queried by the status probe
    #[serde(default = "default_jails")]
    pub jails: Vec<String>,

    /// Override for the ban line regex; must capture `ip` and `jail`
    #[serde(default)]
    pub ban_pattern: Option<String>,

    /// Zone of log timestamps without an offset: `local`, `utc` or `+HH:MM`
    #[serde(default)]
    pub log_timezone: LogTimezone,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for Fail2banConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
            jails: default_jails(),
            ban_pattern: None,
            log_timezone: LogTimezone::Local,
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GeoIpConfig {
    #[serde(default = "default_geoip_path")]
    pub db_path: PathBuf,

    /// Age after which the database is refreshed
    #[serde(default = "default_update_days")]
    pub update_days: u32,

    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    #[serde(default)]
    pub account_id: Option<u64>,

    #[serde(default)]
    pub license_key: Option<String>,

    #[serde(default = "default_download_url")]
    pub download_url: String,
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            db_path: default_geoip_path(),
            update_days: default_update_days(),
            cache_size: default_cache_size(),
            download_timeout_secs: default_download_timeout(),
            account_id: None,
            license_key: None,
            download_url: default_download_url(),
        }
    }
}

impl fmt::Debug for GeoIpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoIpConfig")
            .field("db_path", &self.db_path)
            .field("update_days", &self.update_days)
            .field("cache_size", &self.cache_size)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("account_id", &self.account_id)
            .field("license_key", &self.license_key.as_ref().map(|_| "***"))
            .field("download_url", &self.download_url)
            .finish()
    }
}

/// Delivery retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartConfig {
    /// Countries drawn before the rest fold into "Other"
    #[serde(default = "default_legend_items")]
    pub legend_items: usize,

    #[serde(default = "default_chart_width")]
    pub width: u32,

    #[serde(default = "default_chart_height")]
    pub height: u32,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            legend_items: default_legend_items(),
            width: default_chart_width(),
            height: default_chart_height(),
        }
    }
}

// Default value functions
fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/banwatch/bans.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sync_interval() -> u64 {
    300
}

fn default_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/fail2ban.log")
}

fn default_jails() -> Vec<String> {
    vec!["sshd".to_string()]
}

fn default_command_timeout() -> u64 {
    10
}

fn default_geoip_path() -> PathBuf {
    PathBuf::from("/var/lib/banwatch/GeoLite2-City.mmdb")
}

fn default_update_days() -> u32 {
    28
}

fn default_cache_size() -> usize {
    1000
}

fn default_download_timeout() -> u64 {
    60
}

fn default_download_url() -> String {
    "https://download.maxmind.com".to_string()
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_legend_items() -> usize {
    20
}

fn default_chart_width() -> u32 {
    1200
}

fn default_chart_height() -> u32 {
    700
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.fail2ban.jails, vec!["sshd"]);
        assert_eq!(config.fail2ban.log_file, PathBuf::from("/var/log/fail2ban.log"));
        assert_eq!(config.geoip.update_days, 28);
        assert_eq!(config.geoip.cache_size, 1000);
        assert_eq!(config.charts.legend_items, 20);
        assert!(config.general.digest_interval().is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [telegram]
            bot_token = "123:abc"
            admins = [1, 2]
            chat_id = -100

            [fail2ban]
            jails = ["sshd", "nginx-http-auth"]
            "#,
        )
        .unwrap();

        assert_eq!(config.telegram.admins, vec![1, 2]);
        assert_eq!(config.telegram.chat_id, Some(-100));
        assert_eq!(config.fail2ban.jails.len(), 2);
        assert_eq!(config.telegram.api_url, "https://api.telegram.org");
        assert_eq!(config.general.sync_interval_secs, 300);
        assert!(config.validate_for_bot().is_ok());
    }

    #[test]
    fn test_config_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.general.retention_days = 90;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.general.retention_days, 90);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_from(env(&[
                ("BOT_TOKEN", "42:secret"),
                ("ADMINS", "111, 222"),
                ("CHAT_ID", "-1001"),
                ("MESSAGE_THREAD_ID", "7"),
                ("F2B_JAIL_NAMES", "sshd,recidive"),
                ("LOG_LEVEL", "DEBUG"),
                ("GEOIP_UPDATE_DAYS", "7"),
                ("MAXMIND_LICENSE_KEY", "key"),
                ("DIGEST_INTERVAL_HOURS", "24"),
                ("MAP_LEGEND_ITEMS", ""),
            ]))
            .unwrap();

        assert_eq!(config.telegram.bot_token, "42:secret");
        assert_eq!(config.telegram.admins, vec![111, 222]);
        assert_eq!(config.telegram.chat_id, Some(-1001));
        assert_eq!(config.telegram.message_thread_id, Some(7));
        assert_eq!(config.fail2ban.jails, vec!["sshd", "recidive"]);
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.geoip.update_days, 7);
        assert_eq!(config.geoip.license_key.as_deref(), Some("key"));
        assert_eq!(
            config.general.digest_interval(),
            Some(Duration::from_secs(24 * 3600))
        );
        // Empty values leave defaults alone
        assert_eq!(config.charts.legend_items, 20);
        assert!(config.is_admin(222));
        assert!(!config.is_admin(333));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = Config::default();
        let err = config
            .apply_env_from(env(&[("ADMINS", "111,bob")]))
            .unwrap_err();
        assert!(err.to_string().contains("ADMINS"));

        let err = config
            .apply_env_from(env(&[("LOG_TIMEZONE", "Europe/Nowhere")]))
            .unwrap_err();
        assert!(err.to_string().contains("LOG_TIMEZONE"));
    }

    #[test]
    fn test_log_timezone_setting() {
        assert_eq!(Config::default().fail2ban.log_timezone, LogTimezone::Local);

        let config: Config = toml::from_str(
            r#"
            [fail2ban]
            log_timezone = "+09:00"
            "#,
        )
        .unwrap();
        assert_eq!(config.fail2ban.log_timezone.to_string(), "+09:00");

        let shown = toml::to_string(&config).unwrap();
        assert!(shown.contains(r#"log_timezone = "+09:00""#));

        assert!(toml::from_str::<Config>("[fail2ban]\nlog_timezone = \"soon\"").is_err());

        let mut config = Config::default();
        config
            .apply_env_from(env(&[("LOG_TIMEZONE", "UTC")]))
            .unwrap();
        assert_eq!(config.fail2ban.log_timezone, LogTimezone::Utc);
    }

    #[test]
    fn test_digest_interval_saturates() {
        let mut config = Config::default();
        config.general.digest_interval_hours = u64::MAX;
        assert_eq!(
            config.general.digest_interval(),
            Some(Duration::from_secs(u64::MAX))
        );
    }

    #[test]
    fn test_validate_for_bot() {
        let mut config = Config::default();
        assert!(matches!(
            config.validate_for_bot(),
            Err(BanwatchError::ConfigurationMissing(ref k)) if k == "BOT_TOKEN"
        ));

        config.telegram.bot_token = "1:x".into();
        assert!(matches!(
            config.validate_for_bot(),
            Err(BanwatchError::ConfigurationMissing(ref k)) if k == "ADMINS"
        ));

        config.telegram.admins = vec![1];
        assert!(matches!(
            config.validate_for_bot(),
            Err(BanwatchError::ConfigurationMissing(ref k)) if k == "CHAT_ID"
        ));
    }

    #[test]
    fn test_debug_masks_secrets() {
        let mut config = Config::default();
        config.telegram.bot_token = "123456:ABCdef".into();
        config.geoip.license_key = Some("hunter2".into());

        let shown = format!("{:?}", config);
        assert!(!shown.contains("ABCdef"));
        assert!(!shown.contains("hunter2"));
    }
}
