//! User-facing message text (Telegram HTML)

use std::fmt::Write;

use crate::geoip::UpdateOutcome;
use crate::models::{CountryTally, JailDetail, ServiceStatus};
use crate::period::{Granularity, PeriodStats, Trend};

const MAX_LISTED_IPS: usize = 20;
const MAX_LISTED_JAILS: usize = 10;

/// Escape text for `parse_mode=HTML`
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn welcome() -> String {
    "📊 <b>Welcome to fail2ban Monitor Bot!</b>\n\n\
     Available commands:\n\
     • /stats - view ban statistics\n\
     • /status - check service state\n\
     • /geo - view global geo stats\n\
     • /help - show this message"
        .to_string()
}

pub fn select_period() -> String {
    "📊 Select period:".to_string()
}

pub fn trend_arrow(trend: Trend) -> &'static str {
    match trend {
        Trend::Up => "↗️",
        Trend::Down => "↘️",
        Trend::Flat => "➡️",
    }
}

fn this_period(granularity: Granularity) -> String {
    format!("this {}", granularity.as_str())
}

/// Counts for the current period, optionally broken down by jail
pub fn period_stats(stats: &PeriodStats, jails: &[(String, u64)]) -> String {
    let g = stats.period.granularity;
    let mut text = format!(
        "<b>Bans {}</b>\n\nTotal: <b>{}</b>\nPeriod: {} (UTC)\n",
        this_period(g),
        stats.count,
        stats.period
    );

    if !jails.is_empty() {
        text.push_str("\nBy jail:\n");
        for (jail, count) in jails.iter().take(MAX_LISTED_JAILS) {
            let _ = writeln!(text, "• {}: {}", escape(jail), count);
        }
        if jails.len() > MAX_LISTED_JAILS {
            let _ = writeln!(text, "• … and {} more", jails.len() - MAX_LISTED_JAILS);
        }
    }

    text
}

pub fn comparison(stats: &PeriodStats) -> String {
    let label = stats.period.granularity.label();
    format!(
        "📊 <b>Comparison: {label} vs previous {lower}</b>\n\n\
         📌 Current: {current} ({current_range})\n\
         📌 Previous: {previous} ({previous_range})\n\
         📈 Change: {arrow} {change} ({percent:.1}%)",
        label = label,
        lower = label.to_lowercase(),
        current = stats.count,
        current_range = stats.period,
        previous = stats.previous_count,
        previous_range = stats.previous_period(),
        arrow = trend_arrow(stats.trend()),
        change = stats.delta().unsigned_abs(),
        percent = stats.percent_change(),
    )
}

/// Ranked list of countries with the unresolved share shown separately
pub fn top_countries(tally: &CountryTally, limit: usize, title: &str) -> String {
    let mut text = format!("🌍 <b>{}</b>\n\n", escape(title));

    if tally.is_empty() {
        text.push_str("No banned IPs found.");
        return text;
    }

    let total = tally.total() as f64;
    for (i, (code, country)) in tally.top(limit).iter().enumerate() {
        let _ = writeln!(
            text,
            "{}. {} ({}): {} ({:.1}%)",
            i + 1,
            escape(&country.name),
            escape(code),
            country.count,
            country.count as f64 / total * 100.0
        );
    }

    let shown: u64 = tally.top(limit).iter().map(|(_, c)| c.count).sum();
    let rest = tally.known() - shown;
    if rest > 0 {
        let _ = writeln!(text, "… other countries: {}", rest);
    }
    if tally.unknown > 0 {
        let _ = writeln!(text, "❔ Unknown: {}", tally.unknown);
    }
    let _ = write!(text, "\nTotal: <b>{}</b>", tally.total());

    text
}

pub fn geo_caption(granularity: Option<Granularity>) -> String {
    match granularity {
        Some(g) => format!("🌍 Geographic distribution - {}", this_period(g)),
        None => "🌍 Geographic distribution of banned IPs - All Time".to_string(),
    }
}

pub fn no_bans(granularity: Option<Granularity>) -> String {
    match granularity {
        Some(g) => format!("No banned IPs found {}.", this_period(g)),
        None => "No banned IPs found.".to_string(),
    }
}

fn flag(on: bool) -> &'static str {
    if on {
        "🟢"
    } else {
        "🔴"
    }
}

pub fn service_status(status: &ServiceStatus) -> String {
    let mut text = String::from("🛡️ <b>fail2ban Service Status</b>\n\n");
    let _ = writeln!(text, "Running: {}", flag(status.running));
    let _ = writeln!(text, "Enabled: {}", flag(status.enabled));
    let _ = writeln!(text, "📦 Version: {}", escape(&status.version));
    let started = status
        .started_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    let _ = writeln!(text, "⏱️ Started at: {}", started);

    for (name, detail) in &status.jails {
        let _ = write!(text, "\n🔐 <b>Jail {}</b>\n", escape(name));
        match detail {
            JailDetail::Counters(c) => {
                let _ = writeln!(text, "Currently failed: {}", c.currently_failed);
                let _ = writeln!(text, "Total failed: {}", c.total_failed);
                let _ = writeln!(text, "Currently banned: {}", c.currently_banned);
                let _ = writeln!(text, "Total banned: {}", c.total_banned);
                if !c.banned_ips.is_empty() {
                    let listed: Vec<String> = c
                        .banned_ips
                        .iter()
                        .take(MAX_LISTED_IPS)
                        .map(|ip| escape(ip))
                        .collect();
                    let _ = write!(text, "Banned IPs: <code>{}</code>", listed.join(" "));
                    if c.banned_ips.len() > MAX_LISTED_IPS {
                        let _ = write!(text, " … +{}", c.banned_ips.len() - MAX_LISTED_IPS);
                    }
                    text.push('\n');
                }
            }
            JailDetail::Unavailable(reason) => {
                let _ = writeln!(text, "⚠️ Could not get status: {}", escape(reason));
            }
        }
    }

    text
}

/// Degraded reply when the daemon cannot be queried
pub fn status_unavailable(reason: &str) -> String {
    format!(
        "🛡️ <b>fail2ban Service Status</b>\n\n\
         🔴 The fail2ban control interface is unavailable.\n\
         <i>{}</i>",
        escape(reason)
    )
}

/// Chat notice for a GeoIP refresh; nothing to say when already fresh
pub fn geoip_notice(outcome: &UpdateOutcome, update_days: u32) -> Option<String> {
    let body = match outcome {
        UpdateOutcome::UpToDate { .. } => return None,
        UpdateOutcome::Installed {
            previous: Some(prev),
            ..
        } => format!(
            "🔄 Updated GeoIP database\n📅 Previous update: {}\n\
             ✅ Successfully downloaded and installed new GeoIP database.\n\
             🔍 Next check in ~{} days.",
            prev.format("%Y-%m-%d"),
            update_days
        ),
        UpdateOutcome::Installed { previous: None, .. } => format!(
            "🆕 First-time GeoIP setup\n📂 Database created for the first time\n\
             ✅ Successfully downloaded and installed new GeoIP database.\n\
             🔍 Next check in ~{} days.",
            update_days
        ),
        UpdateOutcome::Failed(reason) => format!("❌ GeoIP update failed: {}", escape(reason)),
    };
    Some(format!("📦 <b>GeoIP Update</b>\n\n{}", body))
}

/// Periodic summary across several granularities
pub fn digest(stats: &[PeriodStats]) -> String {
    let mut text = String::from("🗓 <b>fail2ban digest</b>\n\n");
    for s in stats {
        let _ = writeln!(
            text,
            "{}: {} {} (previous {})",
            s.period.granularity.label(),
            s.count,
            trend_arrow(s.trend()),
            s.previous_count
        );
    }
    text
}

pub fn invalid_period(raw: &str) -> String {
    format!("Invalid period: <code>{}</code>.", escape(raw))
}

pub fn unknown_command() -> String {
    "Unknown command. Use /help to see what I can do.".to_string()
}

pub fn internal_error(what: &str) -> String {
    format!("⚠️ Could not {}. Please try again later.", escape(what))
}
