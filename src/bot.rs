//! Chat bot: command handling and the long-polling runner

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::BanwatchError;
use crate::format;
use crate::geoip::GeoIpUpdater;
use crate::monitor::start_monitoring;
use crate::notify::{ChatTarget, Dispatcher, InlineKeyboard, Outgoing, Payload, RetryPolicy};
use crate::period::{Granularity, Period};
use crate::telegram::{TelegramClient, Update};
use crate::Banwatch;

const GEOIP_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Slash commands the bot understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Stats,
    Status,
    Geo,
    Unknown(String),
}

impl Command {
    /// Parse `/name[@bot] [args]`. Returns `None` for text that is not a command.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.trim().split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name).to_lowercase();

        Some(match name.as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "stats" => Command::Stats,
            "status" => Command::Status,
            "geo" => Command::Geo,
            _ => Command::Unknown(name),
        })
    }
}

/// Inline button payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    StatsMenu,
    Show(Granularity),
    Compare(Granularity),
    Geo(Granularity),
    Unknown(String),
}

impl CallbackAction {
    /// Parse `stats_menu` or `period:<show|compare|geo>:<granularity>`
    pub fn parse(data: &str) -> Result<Self, BanwatchError> {
        if data == "stats_menu" {
            return Ok(CallbackAction::StatsMenu);
        }

        let mut parts = data.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("period"), Some(action), Some(raw)) => {
                let granularity = Granularity::from_str(raw)?;
                Ok(match action {
                    "show" => CallbackAction::Show(granularity),
                    "compare" => CallbackAction::Compare(granularity),
                    "geo" => CallbackAction::Geo(granularity),
                    _ => CallbackAction::Unknown(data.to_string()),
                })
            }
            _ => Ok(CallbackAction::Unknown(data.to_string())),
        }
    }

    pub fn data(&self) -> String {
        match self {
            CallbackAction::StatsMenu => "stats_menu".to_string(),
            CallbackAction::Show(g) => format!("period:show:{}", g),
            CallbackAction::Compare(g) => format!("period:compare:{}", g),
            CallbackAction::Geo(g) => format!("period:geo:{}", g),
            CallbackAction::Unknown(raw) => raw.clone(),
        }
    }
}

pub fn period_keyboard() -> InlineKeyboard {
    Granularity::ALL.iter().fold(InlineKeyboard::new(), |kb, g| {
        kb.row([(g.label().to_string(), CallbackAction::Show(*g).data())])
    })
}

fn period_actions_keyboard(g: Granularity) -> InlineKeyboard {
    InlineKeyboard::new()
        .row([(
            format!("📈 Compare with previous {}", g.as_str()),
            CallbackAction::Compare(g).data(),
        )])
        .row([(
            "🌏 Geo Stats for This Period".to_string(),
            CallbackAction::Geo(g).data(),
        )])
        .row([back_button()])
}

fn back_button() -> (String, String) {
    (
        "📅 Select another period".to_string(),
        CallbackAction::StatsMenu.data(),
    )
}

fn back_keyboard() -> InlineKeyboard {
    InlineKeyboard::new().row([back_button()])
}

/// A user action pulled out of a raw update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Command {
        user_id: i64,
        chat: ChatTarget,
        text: String,
    },
    Callback {
        user_id: i64,
        callback_id: String,
        chat: Option<ChatTarget>,
        data: String,
    },
}

impl Incoming {
    pub fn from_update(update: &Update) -> Option<Self> {
        if let Some(query) = &update.callback_query {
            return Some(Incoming::Callback {
                user_id: query.from.id,
                callback_id: query.id.clone(),
                chat: query
                    .message
                    .as_ref()
                    .map(|m| ChatTarget::new(m.chat.id, m.message_thread_id)),
                data: query.data.clone().unwrap_or_default(),
            });
        }

        let message = update.message.as_ref()?;
        let text = message.text.as_ref().filter(|t| t.starts_with('/'))?;
        Some(Incoming::Command {
            user_id: message.from.as_ref()?.id,
            chat: ChatTarget::new(message.chat.id, message.message_thread_id),
            text: text.clone(),
        })
    }

    pub fn user_id(&self) -> i64 {
        match self {
            Incoming::Command { user_id, .. } | Incoming::Callback { user_id, .. } => *user_id,
        }
    }
}

/// Turns admin commands into replies
pub struct CommandHandler {
    app: Arc<Banwatch>,
}

impl CommandHandler {
    pub fn new(app: Arc<Banwatch>) -> Self {
        Self { app }
    }

    /// Replies for one update. Non-admins get nothing.
    pub async fn handle(&self, incoming: &Incoming, now: DateTime<Utc>) -> Vec<Outgoing> {
        if !self.app.config().is_admin(incoming.user_id()) {
            warn!("Ignoring update from unauthorized user {}", incoming.user_id());
            return Vec::new();
        }

        match incoming {
            Incoming::Command { chat, text, user_id } => match Command::parse(text) {
                Some(command) => {
                    info!("User {} sent {:?}", user_id, command);
                    self.command(command, *chat, now).await
                }
                None => Vec::new(),
            },
            Incoming::Callback {
                callback_id,
                chat,
                data,
                user_id,
            } => {
                info!("User {} pressed {}", user_id, data);
                let target = chat.or_else(|| self.app.notify_target());
                let mut replies = vec![Outgoing::callback_answer(
                    target.unwrap_or(ChatTarget::new(*user_id, None)),
                    callback_id.clone(),
                )];
                match target {
                    Some(target) => replies.extend(self.callback(data, target, now)),
                    None => debug!("Callback {} has no chat to reply to", callback_id),
                }
                replies
            }
        }
    }

    async fn command(&self, command: Command, chat: ChatTarget, now: DateTime<Utc>) -> Vec<Outgoing> {
        match command {
            Command::Start | Command::Help => vec![Outgoing::text(chat, format::welcome())],
            Command::Stats => vec![self.period_menu(chat)],
            Command::Status => vec![self.status(chat).await],
            Command::Geo => self.geo(chat, None, now),
            Command::Unknown(_) => vec![Outgoing::text(chat, format::unknown_command())],
        }
    }

    fn callback(&self, data: &str, chat: ChatTarget, now: DateTime<Utc>) -> Vec<Outgoing> {
        match CallbackAction::parse(data) {
            Ok(CallbackAction::StatsMenu) => vec![self.period_menu(chat)],
            Ok(CallbackAction::Show(g)) => vec![self.show_period(chat, g, now)],
            Ok(CallbackAction::Compare(g)) => vec![self.compare(chat, g, now)],
            Ok(CallbackAction::Geo(g)) => self.geo(chat, Some(g), now),
            Ok(CallbackAction::Unknown(raw)) => {
                debug!("Unknown callback data {}", raw);
                vec![Outgoing::text(chat, format::unknown_command())]
            }
            Err(BanwatchError::InvalidGranularity(raw)) => {
                vec![Outgoing::text(chat, format::invalid_period(&raw)).with_keyboard(back_keyboard())]
            }
            Err(e) => vec![Outgoing::text(chat, format::invalid_period(&e.to_string()))],
        }
    }

    fn period_menu(&self, chat: ChatTarget) -> Outgoing {
        Outgoing::text(chat, format::select_period()).with_keyboard(period_keyboard())
    }

    fn show_period(&self, chat: ChatTarget, g: Granularity, now: DateTime<Utc>) -> Outgoing {
        let stats = match self.app.period_stats(g, now) {
            Ok(stats) => stats,
            Err(e) => return self.failure(chat, "load ban statistics", e),
        };
        let jails = self.app.jail_counts(&stats.period).unwrap_or_else(|e| {
            warn!("Failed to load per-jail counts: {}", e);
            Vec::new()
        });
        let text = format::period_stats(&stats, &jails);
        let keyboard = period_actions_keyboard(g);

        let chart = self
            .app
            .breakdown(&stats.period)
            .and_then(|buckets| Ok(self.app.charts().breakdown(&stats.period, &buckets)?));
        match chart {
            Ok(image) => Outgoing::image(chat, image, Some(text)).with_keyboard(keyboard),
            Err(e) => {
                warn!("Failed to render {} chart: {}", g, e);
                Outgoing::text(chat, format!("{}\nCould not generate chart.", text)).with_keyboard(keyboard)
            }
        }
    }

    fn compare(&self, chat: ChatTarget, g: Granularity, now: DateTime<Utc>) -> Outgoing {
        let stats = match self.app.period_stats(g, now) {
            Ok(stats) => stats,
            Err(e) => return self.failure(chat, "load ban statistics", e),
        };
        let text = format::comparison(&stats);

        match self.app.charts().comparison(&stats) {
            Ok(image) => Outgoing::image(chat, image, Some(text)).with_keyboard(back_keyboard()),
            Err(e) => {
                warn!("Failed to render comparison chart: {}", e);
                Outgoing::text(chat, text).with_keyboard(back_keyboard())
            }
        }
    }

    fn geo(&self, chat: ChatTarget, g: Option<Granularity>, now: DateTime<Utc>) -> Vec<Outgoing> {
        let period = match g.map(|g| Period::containing(g, now)).transpose() {
            Ok(period) => period,
            Err(e) => return vec![self.failure(chat, "load geo statistics", e.into())],
        };
        let tally = match self.app.country_tally(period.as_ref()) {
            Ok(tally) => tally,
            Err(e) => return vec![self.failure(chat, "load geo statistics", e)],
        };

        let keyboard = match g {
            Some(_) => back_keyboard(),
            None => InlineKeyboard::new().row([("🗺️ View by Period", CallbackAction::StatsMenu.data())]),
        };

        if tally.is_empty() {
            return vec![Outgoing::text(chat, format::no_bans(g)).with_keyboard(keyboard)];
        }

        let title = match &period {
            Some(p) => format!("Banned IPs by country, {} ({} UTC)", p.granularity.as_str(), p),
            None => "Banned IPs by country, all time".to_string(),
        };
        let legend = self.app.config().charts.legend_items;

        let mut replies = Vec::with_capacity(2);
        match self.app.charts().countries(&tally, &title) {
            Ok(image) => replies.push(Outgoing::image(chat, image, Some(format::geo_caption(g)))),
            Err(e) => warn!("Failed to render country chart: {}", e),
        }
        replies.push(Outgoing::text(chat, format::top_countries(&tally, legend, &title)).with_keyboard(keyboard));
        replies
    }

    async fn status(&self, chat: ChatTarget) -> Outgoing {
        let text = match self.app.service_status().await {
            Ok(status) => format::service_status(&status),
            Err(BanwatchError::ProbeUnavailable(reason)) => {
                warn!("fail2ban probe unavailable: {}", reason);
                format::status_unavailable(&reason)
            }
            Err(e) => {
                error!("Status probe failed: {}", e);
                format::internal_error("query fail2ban")
            }
        };
        Outgoing::text(chat, text).with_keyboard(back_keyboard())
    }

    fn failure(&self, chat: ChatTarget, what: &str, e: anyhow::Error) -> Outgoing {
        error!("Failed to {}: {:#}", what, e);
        Outgoing::text(chat, format::internal_error(what))
    }
}

/// Run the bot until Ctrl-C
pub async fn run(app: Arc<Banwatch>) -> Result<()> {
    let config = app.shared_config();
    config.validate_for_bot()?;

    let client = Arc::new(TelegramClient::new(&config.telegram)?);
    let me = client
        .get_me()
        .await
        .context("Telegram rejected the bot credentials")?;
    info!(
        "Connected to Telegram as @{}",
        me.username.as_deref().unwrap_or(&me.first_name)
    );

    let policy = RetryPolicy::from_config(&config.notify);
    let dispatcher = Dispatcher::new(client.clone(), policy);
    let handler = CommandHandler::new(app.clone());

    let mut tasks: Vec<JoinHandle<()>> = vec![
        spawn_log_sync(app.clone(), config.general.sync_interval()),
        spawn_geoip_refresh(app.clone(), dispatcher.clone())?,
    ];
    if let Some(every) = config.general.digest_interval() {
        tasks.push(spawn_digest(app.clone(), dispatcher.clone(), every));
    } else {
        info!("Periodic digest is disabled");
    }

    info!("Bot started, waiting for commands...");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut offset: Option<i64> = None;
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
            result = client.get_updates(offset) => match result {
                Ok(updates) => {
                    failures = 0;
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        let Some(incoming) = Incoming::from_update(&update) else {
                            continue;
                        };
                        let replies = handler.handle(&incoming, Utc::now()).await;
                        dispatcher.deliver_all(&replies).await;
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = policy.next_delay(failures, &e, &mut rand::thread_rng());
                    warn!("getUpdates failed: {}; retrying in {:?}", e, delay);
                    if backoff_or_shutdown(delay, &mut shutdown).await {
                        info!("Received shutdown signal");
                        break;
                    }
                }
            }
        }
    }

    for task in tasks {
        task.abort();
    }
    info!("Bot stopped");
    Ok(())
}

/// Wait out a retry delay. Returns true if `shutdown` fired first.
async fn backoff_or_shutdown<S>(delay: Duration, shutdown: &mut S) -> bool
where
    S: Future + Unpin,
{
    tokio::select! {
        _ = shutdown => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn spawn_log_sync(app: Arc<Banwatch>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path = app.config().fail2ban.log_file.clone();
        if let Err(e) = start_monitoring(&path, every, move || app.sync_log()).await {
            error!("Log monitoring stopped: {:#}", e);
        }
    })
}

fn spawn_geoip_refresh(app: Arc<Banwatch>, dispatcher: Dispatcher) -> Result<JoinHandle<()>> {
    let geoip = app.config().geoip.clone();
    let updater = GeoIpUpdater::new(&geoip)?;

    Ok(tokio::spawn(async move {
        let mut interval = tokio::time::interval(GEOIP_CHECK_INTERVAL);
        loop {
            interval.tick().await;
            let outcome = updater.refresh_if_needed(Utc::now()).await;
            let (Some(text), Some(target)) = (
                format::geoip_notice(&outcome, geoip.update_days),
                app.notify_target(),
            ) else {
                continue;
            };
            dispatcher.deliver(&Outgoing::text(target, text)).await;
        }
    }))
}

fn spawn_digest(app: Arc<Banwatch>, dispatcher: Dispatcher, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick fires immediately; the first digest waits a full interval
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(target) = app.notify_target() else {
                continue;
            };
            match app.digest(Utc::now()) {
                Ok(stats) => {
                    dispatcher.deliver(&Outgoing::text(target, format::digest(&stats))).await;
                }
                Err(e) => warn!("Failed to build digest: {:#}", e),
            }
        }
    })
}

/// Text of every text payload, for tests and logging
pub fn reply_texts(replies: &[Outgoing]) -> Vec<&str> {
    replies
        .iter()
        .filter_map(|r| match &r.payload {
            Payload::Text { text, .. } => Some(text.as_str()),
            Payload::Image { caption, .. } => caption.as_deref(),
            Payload::CallbackAnswer { .. } => None,
        })
        .collect()
}
