//! fail2ban service status
//!
//! Everything here shells out to `systemctl` and `fail2ban-client`. The
//! commands go through [`CommandRunner`] so the parsers can be fed canned
//! output in tests.

use std::collections::BTreeMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Fail2banConfig;
use crate::error::{BanwatchError, Result};
use crate::models::{JailCounters, JailDetail, ServiceStatus};

const SERVICE: &str = "fail2ban";
const CLIENT: &str = "fail2ban-client";

/// Captured result of one subprocess
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Best human-readable reason for a failed command
    fn reason(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if text.is_empty() {
            "command exited with an error".to_string()
        } else {
            text.lines().next().unwrap_or(text).to_string()
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;
}

/// Runs real processes, killing any that outlive the timeout
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} timed out after {:?}", program, self.timeout),
                )
            })??;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub struct StatusProbe {
    runner: Arc<dyn CommandRunner>,
    jails: Vec<String>,
}

impl StatusProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, jails: Vec<String>) -> Self {
        Self { runner, jails }
    }

    pub fn from_config(config: &Fail2banConfig) -> Self {
        let runner = SystemRunner::new(Duration::from_secs(config.command_timeout_secs.max(1)));
        Self::new(Arc::new(runner), config.jails.clone())
    }

    /// Query the service. Fails only when the control interface is unreachable.
    pub async fn probe(&self) -> Result<ServiceStatus> {
        let ping = self
            .runner
            .run(CLIENT, &["ping"])
            .await
            .map_err(|e| BanwatchError::ProbeUnavailable(format!("cannot execute {}: {}", CLIENT, e)))?;
        if !ping.success {
            return Err(BanwatchError::ProbeUnavailable(ping.reason()));
        }

        let active = self.systemctl(&["is-active", SERVICE]).await;
        let enabled = self.systemctl(&["is-enabled", SERVICE]).await;
        let started = self
            .systemctl(&["show", SERVICE, "--property=ActiveEnterTimestamp"])
            .await;

        let version = match self.runner.run(CLIENT, &["--version"]).await {
            Ok(out) => parse_version(&out.stdout),
            Err(e) => {
                warn!("Failed to get fail2ban version: {}", e);
                "unknown".to_string()
            }
        };

        let mut jails = BTreeMap::new();
        for jail in &self.jails {
            jails.insert(jail.clone(), self.jail_detail(jail).await);
        }

        let status = ServiceStatus {
            // Without systemd, a daemon that answers ping is running
            running: active.as_deref().map_or(true, |s| s == "active"),
            enabled: enabled.as_deref() == Some("enabled"),
            version,
            started_at: started.as_deref().and_then(parse_active_enter_timestamp),
            jails,
        };

        info!(
            "Retrieved fail2ban status: running={}, enabled={}, version={}",
            status.running, status.enabled, status.version
        );
        Ok(status)
    }

    async fn jail_detail(&self, jail: &str) -> JailDetail {
        match self.runner.run(CLIENT, &["status", jail]).await {
            Ok(out) if out.success => JailDetail::Counters(parse_jail_status(&out.stdout)),
            Ok(out) => {
                debug!("Jail {} status failed: {}", jail, out.reason());
                JailDetail::Unavailable(out.reason())
            }
            Err(e) => JailDetail::Unavailable(e.to_string()),
        }
    }

    // stdout of a systemctl call, or None when systemctl itself could not run
    async fn systemctl(&self, args: &[&str]) -> Option<String> {
        match self.runner.run("systemctl", args).await {
            Ok(out) => Some(out.stdout.trim().to_string()),
            Err(e) => {
                warn!("systemctl {} failed: {}", args.join(" "), e);
                None
            }
        }
    }
}

/// Parse `fail2ban-client status <jail>`
pub fn parse_jail_status(output: &str) -> JailCounters {
    let mut counters = JailCounters::default();

    for line in output.lines() {
        let line = line.trim_start_matches(|c: char| c == '|' || c == '`' || c == '-' || c.is_whitespace());
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let number = || value.parse::<u64>().unwrap_or(0);

        match key.trim() {
            "Currently failed" => counters.currently_failed = number(),
            "Total failed" => counters.total_failed = number(),
            "Currently banned" => counters.currently_banned = number(),
            "Total banned" => counters.total_banned = number(),
            "File list" => {
                counters.file_list = value.split_whitespace().map(String::from).collect();
            }
            "Banned IP list" => {
                counters.banned_ips = value.split_whitespace().map(String::from).collect();
            }
            _ => {}
        }
    }

    counters
}

/// First line of `fail2ban-client --version`
pub fn parse_version(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Parse `ActiveEnterTimestamp=Mon 2024-03-11 09:15:02 UTC`
///
/// systemd prints the host's local zone; anything other than UTC/GMT is
/// read as local time.
pub fn parse_active_enter_timestamp(output: &str) -> Option<DateTime<Utc>> {
    let re = Regex::new(r"ActiveEnterTimestamp=\w{3} (\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})(?: (\S+))?").ok()?;
    let caps = re.captures(output)?;

    let naive = NaiveDateTime::parse_from_str(&caps[1], "%Y-%m-%d %H:%M:%S").ok()?;
    match caps.get(2).map(|m| m.as_str()) {
        None | Some("UTC") | Some("GMT") => Some(naive.and_utc()),
        Some(_) => Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SSHD_STATUS: &str = "Status for the jail: sshd
|- Filter
|  |- Currently failed:\t2
|  |- Total failed:\t57
|  `- File list:\t/var/log/auth.log
`- Actions
   |- Currently banned:\t2
   |- Total banned:\t14
   `- Banned IP list:\t203.0.113.4 198.51.100.7
";

    /// Canned outputs keyed by "program arg arg"; missing keys fail to spawn
    struct FakeRunner {
        outputs: HashMap<String, CommandOutput>,
    }

    impl FakeRunner {
        fn new(entries: &[(&str, bool, &str)]) -> Arc<Self> {
            let outputs = entries
                .iter()
                .map(|(cmd, success, stdout)| {
                    (
                        cmd.to_string(),
                        CommandOutput {
                            success: *success,
                            stdout: stdout.to_string(),
                            stderr: String::new(),
                        },
                    )
                })
                .collect();
            Arc::new(Self { outputs })
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
            let key = std::iter::once(program)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            self.outputs
                .get(&key)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, key))
        }
    }

    #[test]
    fn test_parse_jail_status() {
        let counters = parse_jail_status(SSHD_STATUS);
        assert_eq!(counters.currently_failed, 2);
        assert_eq!(counters.total_failed, 57);
        assert_eq!(counters.currently_banned, 2);
        assert_eq!(counters.total_banned, 14);
        assert_eq!(counters.file_list, vec!["/var/log/auth.log"]);
        assert_eq!(counters.banned_ips, vec!["203.0.113.4", "198.51.100.7"]);
    }

    #[test]
    fn test_parse_active_enter_timestamp() {
        let ts = parse_active_enter_timestamp("ActiveEnterTimestamp=Mon 2024-03-11 09:15:02 UTC\n").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-11T09:15:02+00:00");

        assert!(parse_active_enter_timestamp("ActiveEnterTimestamp=").is_none());
        assert!(parse_active_enter_timestamp("").is_none());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("\nFail2Ban v1.0.2\n"), "Fail2Ban v1.0.2");
        assert_eq!(parse_version(""), "unknown");
    }

    #[tokio::test]
    async fn test_probe_healthy() {
        let runner = FakeRunner::new(&[
            ("fail2ban-client ping", true, "Server replied: pong"),
            ("systemctl is-active fail2ban", true, "active\n"),
            ("systemctl is-enabled fail2ban", true, "enabled\n"),
            (
                "systemctl show fail2ban --property=ActiveEnterTimestamp",
                true,
                "ActiveEnterTimestamp=Mon 2024-03-11 09:15:02 UTC",
            ),
            ("fail2ban-client --version", true, "Fail2Ban v1.0.2"),
            ("fail2ban-client status sshd", true, SSHD_STATUS),
            ("fail2ban-client status recidive", false, "Sorry but the jail 'recidive' does not exist"),
        ]);

        let probe = StatusProbe::new(runner, vec!["sshd".into(), "recidive".into()]);
        let status = probe.probe().await.unwrap();

        assert!(status.running);
        assert!(status.enabled);
        assert_eq!(status.version, "Fail2Ban v1.0.2");
        assert!(status.started_at.is_some());
        assert!(matches!(status.jails["sshd"], JailDetail::Counters(ref c) if c.total_banned == 14));
        assert!(matches!(
            status.jails["recidive"],
            JailDetail::Unavailable(ref reason) if reason.contains("does not exist")
        ));
    }

    #[tokio::test]
    async fn test_probe_without_client() {
        let runner = FakeRunner::new(&[("systemctl is-active fail2ban", true, "inactive")]);
        let probe = StatusProbe::new(runner, vec!["sshd".into()]);

        assert!(matches!(
            probe.probe().await,
            Err(BanwatchError::ProbeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_daemon_down() {
        let runner = FakeRunner::new(&[(
            "fail2ban-client ping",
            false,
            "Failed to access socket path: /var/run/fail2ban/fail2ban.sock. Is fail2ban running?",
        )]);
        let probe = StatusProbe::new(runner, vec!["sshd".into()]);

        match probe.probe().await {
            Err(BanwatchError::ProbeUnavailable(reason)) => assert!(reason.contains("socket")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_system_runner_missing_binary() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let result = runner.run("banwatch-definitely-not-a-command", &[]).await;
        assert!(result.is_err());
    }
}
