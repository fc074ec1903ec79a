use std::io::{self, Write};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use banwatch::bot::{reply_texts, CommandHandler, Incoming};
use banwatch::chart::SvgChartRenderer;
use banwatch::config::Config;
use banwatch::database::Database;
use banwatch::models::JailDetail;
use banwatch::monitor::LogTimezone;
use banwatch::notify::ChatTarget;
use banwatch::period::Granularity;
use banwatch::status::{CommandOutput, CommandRunner, StatusProbe};
use banwatch::Banwatch;

const ADMIN: i64 = 7;

const LOG: &str = "\
2024-02-10 09:00:00,000 fail2ban.actions        [811]: NOTICE  [sshd] Ban 198.51.100.9
2024-03-14 09:00:00,000 fail2ban.actions        [811]: NOTICE  [sshd] Ban 198.51.100.8
2024-03-15 10:30:00,123 fail2ban.actions        [811]: NOTICE  [sshd] Ban 203.0.113.5
2024-03-15 10:31:00,000 fail2ban.filter         [811]: INFO    [sshd] Found 203.0.113.6 - 2024-03-15 10:31:00
2024-03-15 11:00:00,000 fail2ban.actions        [811]: NOTICE  [nginx-http-auth] Ban 2001:db8::1
2024-03-15 11:05:00,000 fail2ban.actions        [811]: NOTICE  [sshd] Unban 198.51.100.8
2024-03-15 11:10:00,000 fail2ban.actions        [811]: NOTICE  [sshd] Restore Ban 198.51.100.7
";

/// fail2ban answers ping and knows only the sshd jail; systemctl is absent
struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let ok = |stdout: &str| CommandOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        };
        match (program, args) {
            ("fail2ban-client", ["ping"]) => Ok(ok("Server replied: pong")),
            ("fail2ban-client", ["--version"]) => Ok(ok("Fail2Ban v1.0.2")),
            ("fail2ban-client", ["status", "sshd"]) => Ok(ok(
                "Status for the jail: sshd\n\
                 |- Filter\n\
                 |  |- Currently failed:\t1\n\
                 |  |- Total failed:\t9\n\
                 |  `- File list:\t/var/log/auth.log\n\
                 `- Actions\n   \
                    |- Currently banned:\t1\n   \
                    |- Total banned:\t3\n   \
                    `- Banned IP list:\t203.0.113.5\n",
            )),
            ("fail2ban-client", ["status", _]) => Ok(CommandOutput {
                success: false,
                stdout: String::new(),
                stderr: "Sorry but the jail does not exist".to_string(),
            }),
            _ => Err(io::Error::new(io::ErrorKind::NotFound, program.to_string())),
        }
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
}

fn setup(log: &str) -> (tempfile::TempDir, Arc<Banwatch>) {
    setup_in(log, LogTimezone::Utc)
}

fn setup_in(log: &str, log_timezone: LogTimezone) -> (tempfile::TempDir, Arc<Banwatch>) {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("fail2ban.log");
    std::fs::write(&log_path, log).unwrap();

    let mut config = Config::default();
    config.general.db_path = dir.path().join("bans.db");
    config.telegram.admins = vec![ADMIN];
    config.fail2ban.log_file = log_path;
    config.fail2ban.jails = vec!["sshd".into(), "postfix".into()];
    config.fail2ban.log_timezone = log_timezone;
    config.geoip.db_path = dir.path().join("GeoLite2-City.mmdb");

    let db = Database::open(&config.general.db_path).unwrap();
    let probe = StatusProbe::new(Arc::new(HostRunner), config.fail2ban.jails.clone());
    let charts = Box::new(SvgChartRenderer::new(&config.charts));
    let app = Banwatch::with_parts(config, db, probe, charts).unwrap();
    (dir, Arc::new(app))
}

#[test]
fn log_lines_become_period_stats() {
    let (_dir, app) = setup(LOG);

    assert_eq!(app.sync_log().unwrap(), 4);
    assert_eq!(app.sync_log().unwrap(), 0);

    let day = app.period_stats(Granularity::Day, now()).unwrap();
    assert_eq!((day.count, day.previous_count), (2, 1));

    let month = app.period_stats(Granularity::Month, now()).unwrap();
    assert_eq!((month.count, month.previous_count), (3, 1));

    let jails = app.jail_counts(&day.period).unwrap();
    assert_eq!(
        jails,
        vec![("nginx-http-auth".to_string(), 1), ("sshd".to_string(), 1)]
    );

    let buckets = app.breakdown(&day.period).unwrap();
    assert_eq!(buckets.len(), 24);
    assert_eq!(buckets[10].count, 1);
    assert_eq!(buckets[11].count, 1);
}

#[test]
fn host_local_log_times_land_in_the_right_hour() {
    // fail2ban on a +09:00 host logs 21:00 local for 12:00 UTC
    let log = "2024-03-15 21:00:10,000 fail2ban.actions        [811]: NOTICE  [sshd] Ban 203.0.113.40\n";
    let (_dir, app) = setup_in(log, "+09:00".parse().unwrap());
    assert_eq!(app.sync_log().unwrap(), 1);

    let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 30).unwrap();
    let hour = app.period_stats(Granularity::Hour, now).unwrap();
    assert_eq!((hour.count, hour.previous_count), (1, 0));

    let stored = app.database().latest().unwrap().unwrap();
    assert_eq!(stored.timestamp.to_rfc3339(), "2024-03-15T12:00:10+00:00");
}

#[test]
fn stats_at_the_calendar_edge_fail_cleanly() {
    let (_dir, app) = setup(LOG);
    app.sync_log().unwrap();
    assert!(app
        .period_stats(Granularity::Year, DateTime::<Utc>::MAX_UTC)
        .is_err());
}

#[test]
fn appended_lines_are_picked_up() {
    let (dir, app) = setup(LOG);
    assert_eq!(app.sync_log().unwrap(), 4);

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(dir.path().join("fail2ban.log"))
        .unwrap();
    writeln!(
        file,
        "2024-03-15 11:45:00,000 fail2ban.actions        [811]: NOTICE  [sshd] Ban 192.0.2.77"
    )
    .unwrap();

    assert_eq!(app.sync_log().unwrap(), 1);
    assert_eq!(app.database().count_all().unwrap(), 5);
    let latest = app.database().latest().unwrap().unwrap();
    assert_eq!(latest.ip.to_string(), "192.0.2.77");
}

#[test]
fn store_survives_restart() {
    let (dir, app) = setup(LOG);
    app.sync_log().unwrap();
    drop(app);

    let reopened = Database::open(dir.path().join("bans.db")).unwrap();
    assert_eq!(reopened.count_all().unwrap(), 4);
}

#[test]
fn unresolved_addresses_are_counted_as_unknown() {
    let (_dir, app) = setup(LOG);
    app.sync_log().unwrap();

    assert!(!app.geo().is_loaded());
    let tally = app.country_tally(None).unwrap();
    assert_eq!(tally.total(), 4);
    assert_eq!(tally.unknown, 4);
}

#[tokio::test]
async fn status_reports_jails_individually() {
    let (_dir, app) = setup(LOG);

    let status = app.service_status().await.unwrap();
    assert!(status.running);
    assert!(!status.enabled);
    assert_eq!(status.version, "Fail2Ban v1.0.2");

    match &status.jails["sshd"] {
        JailDetail::Counters(c) => {
            assert_eq!(c.total_banned, 3);
            assert_eq!(c.banned_ips, vec!["203.0.113.5"]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(status.jails["postfix"], JailDetail::Unavailable(_)));
}

#[tokio::test]
async fn bot_answers_from_synced_log() {
    let (_dir, app) = setup(LOG);
    app.sync_log().unwrap();
    let handler = CommandHandler::new(app);

    let compare = Incoming::Callback {
        user_id: ADMIN,
        callback_id: "1".into(),
        chat: Some(ChatTarget::new(ADMIN, None)),
        data: "period:compare:day".into(),
    };
    let replies = handler.handle(&compare, now()).await;
    let texts = reply_texts(&replies);
    assert!(texts[0].contains("Current: 2"));
    assert!(texts[0].contains("Previous: 1"));
    assert!(texts[0].contains("100.0%"));

    let status = Incoming::Command {
        user_id: ADMIN,
        chat: ChatTarget::new(ADMIN, None),
        text: "/status".into(),
    };
    let replies = handler.handle(&status, now()).await;
    let texts = reply_texts(&replies);
    assert!(texts[0].contains("Total banned: 3"));
    assert!(texts[0].contains("Jail postfix"));
}
