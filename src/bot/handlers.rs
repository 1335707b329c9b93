//! Command, free-text and button handlers.
//!
//! Handlers only touch the store and services on [`BotContext`] and return a
//! [`Reply`]; the dispatcher in `bot/mod.rs` does the sending.

use std::collections::HashSet;

use teloxide::utils::html::escape;
use tracing::{info, warn};

use super::conversation::{is_login_state, parse_delay, parse_saved_count, route, InputKind, Route};
use super::keyboards::{self, CallbackAction};
use super::{BotContext, Reply};
use crate::broadcast::{format_time, parse_time, Schedule, StartOutcome};
use crate::error::{AdError, Result};
use crate::store::{mask_phone, CachedGroup, ConversationState, MessageSource, UserId};
use crate::telegram::parse_post_link;

/// Bot commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Go,
    Stop,
    Stats,
    /// Admin user list, 1-based page
    Users(usize),
    Bd,
    Leaderboard,
    Cancel,
    Help,
    Unknown(String),
}

impl Command {
    /// Parse `/cmd`, `/cmd@botname` or `/cmd args`. `None` for plain text.
    pub fn parse(text: &str) -> Option<Self> {
        let first = text.split_whitespace().next()?;
        let name = first.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name).to_lowercase();
        Some(match name.as_str() {
            "start" => Command::Start,
            "go" => Command::Go,
            "stop" => Command::Stop,
            "stats" => Command::Stats,
            "users" => Command::Users(
                text.split_whitespace()
                    .nth(1)
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(1),
            ),
            "bd" => Command::Bd,
            "leaderboard" => Command::Leaderboard,
            "cancel" => Command::Cancel,
            "help" => Command::Help,
            _ => Command::Unknown(name),
        })
    }
}

const USERS_PER_PAGE: usize = 20;

const HELP: &str = "<b>📖 Help</b>\n\n\
    /start - main menu\n\
    /go - start broadcasting\n\
    /stop - stop broadcasting\n\
    /leaderboard - top broadcasters\n\
    /cancel - abort the current input\n\
    /help - this message\n\n\
    <b>Setup:</b> add an account, pick groups, put your ads in Saved Messages \
    (or set a post link), start the logger bot, then /go.";

impl BotContext {
    /// Everything except `/bd`, which needs the raw message.
    pub async fn handle_command(&self, user_id: UserId, command: Command) -> Result<Reply> {
        match command {
            Command::Start => self.main_menu(user_id).await,
            Command::Go => self.start_broadcast(user_id).await,
            Command::Stop => self.stop_broadcast(user_id).await,
            Command::Stats => {
                if !self.config.is_admin(user_id) {
                    return Ok(Reply::text("⛔ Admins only."));
                }
                self.admin_stats().await
            }
            Command::Users(page) => {
                if !self.config.is_admin(user_id) {
                    return Ok(Reply::text("⛔ Admins only."));
                }
                self.user_list(page).await
            }
            Command::Bd => Ok(Reply::text(
                "Reply to the message you want to send to every user with /bd.",
            )),
            Command::Leaderboard => self.leaderboard().await,
            Command::Cancel => self.cancel(user_id).await,
            Command::Help => Ok(Reply::with_keyboard(HELP, keyboards::back_to_main())),
            Command::Unknown(name) => Ok(Reply::text(format!(
                "Unknown command /{}. Try /help.",
                escape(&name)
            ))),
        }
    }

    pub async fn main_menu(&self, user_id: UserId) -> Result<Reply> {
        let user = self.store.get_user(user_id).await;
        let name = user
            .as_ref()
            .map(|u| u.display_name())
            .unwrap_or_else(|| user_id.to_string());
        let accounts = self.store.active_accounts(user_id).await.len();
        let groups = self.store.target_groups(user_id).await.len()
            + self.store.forum_groups(user_id).await.len();
        let running = self.supervisor.is_running(user_id).await;
        let phase = self.supervisor.phase(user_id).await;
        let logger = if self.store.logger_started(user_id).await {
            "✅ connected".to_string()
        } else {
            format!("❌ start @{}", escape(&self.config.logger_bot.username))
        };

        let text = format!(
            "<b>👋 Welcome, {}!</b>\n\n\
             📱 Accounts: {}\n\
             👥 Selected groups: {}\n\
             📡 Broadcast: {}\n\
             📝 Logger bot: {}",
            escape(&name),
            accounts,
            groups,
            phase,
            logger
        );
        Ok(Reply::with_keyboard(text, keyboards::main_menu(running)))
    }

    pub async fn start_broadcast(&self, user_id: UserId) -> Result<Reply> {
        let text = match self.supervisor.start(user_id).await {
            Ok(StartOutcome::Started(report)) => format!(
                "🚀 <b>Broadcast started</b>\n\n\
                 Accounts: {}\nTargets: {} ({} ready, {} may have issues)\n\
                 Sends per cycle: {}\n\nProgress goes to @{}.",
                report.accounts,
                report.targets,
                report.usable,
                report.restricted,
                report.sends_per_cycle,
                escape(&self.config.logger_bot.username)
            ),
            Ok(StartOutcome::AlreadyRunning) => "⚠️ A broadcast is already running. /stop it first.".into(),
            Ok(StartOutcome::LoggerNotStarted) => format!(
                "📝 Start the logger bot @{} first, then try again.",
                escape(&self.config.logger_bot.username)
            ),
            Ok(StartOutcome::NoAccounts) => "📱 Add an account first (Accounts → Add Account).".into(),
            Ok(StartOutcome::NoTargets) => {
                "👥 No usable groups. Select groups that match your broadcast mode.".into()
            }
            Ok(StartOutcome::Cancelled) => "⏹ Broadcast stopped before it started.".into(),
            Err(AdError::Credentials(msg)) => format!("🔑 {}", escape(&msg)),
            Err(e) => {
                warn!(user_id, "Broadcast start failed: {}", e);
                format!("❌ Could not start the broadcast: {}", escape(&e.to_string()))
            }
        };
        Ok(Reply::with_keyboard(text, keyboards::back_to_main()))
    }

    pub async fn stop_broadcast(&self, user_id: UserId) -> Result<Reply> {
        let was_running = self.supervisor.stop(user_id).await?;
        let text = if was_running {
            "⏹ Broadcast stopped."
        } else {
            "ℹ️ No broadcast was running."
        };
        Ok(Reply::with_keyboard(text, keyboards::main_menu(false)))
    }

    async fn cancel(&self, user_id: UserId) -> Result<Reply> {
        let state = self.store.conversation_state(user_id).await;
        if is_login_state(&state) {
            self.store.delete_temp(user_id, None).await?;
        }
        if state != ConversationState::Idle {
            self.store
                .set_conversation_state(user_id, ConversationState::Idle)
                .await?;
        }
        Ok(Reply::with_keyboard("❌ Cancelled.", keyboards::back_to_main()))
    }

    async fn admin_stats(&self) -> Result<Reply> {
        let stats = self.store.admin_stats().await;
        let live = self.supervisor.active_users().await.len();
        let text = format!(
            "<b>📊 Bot Statistics</b>\n\n\
             👤 Users: {}\n\
             📱 Accounts: {}\n\
             📝 Logger users: {}\n\
             ✅ Forwards: {}\n\
             ❌ Failed: {}\n\
             📨 Send attempts: {}\n\
             📡 Running: {} (live tasks: {})",
            stats.total_users,
            stats.total_accounts,
            stats.active_logger_users,
            stats.total_forwards,
            stats.total_failed,
            stats.total_broadcasts,
            stats.running_broadcasts,
            live
        );
        Ok(Reply::text(text))
    }

    async fn user_list(&self, page: usize) -> Result<Reply> {
        let page = page.max(1);
        let users = self.store.users_page(page - 1, USERS_PER_PAGE).await;
        if users.is_empty() {
            return Ok(Reply::text(format!("👤 No users on page {}.", page)));
        }
        let mut text = format!("<b>👤 Users (page {})</b>\n\n", page);
        for user in &users {
            let handle = user
                .username
                .as_ref()
                .map(|u| format!(" @{}", escape(u)))
                .unwrap_or_default();
            text.push_str(&format!(
                "<code>{}</code> {}{} ({})\n",
                user.user_id,
                escape(&user.display_name()),
                handle,
                user.user_type.as_str()
            ));
        }
        if users.len() == USERS_PER_PAGE {
            text.push_str(&format!("\nNext: /users {}", page + 1));
        }
        Ok(Reply::text(text))
    }

    async fn leaderboard(&self) -> Result<Reply> {
        let rows = self.store.leaderboard(10).await;
        if rows.is_empty() {
            return Ok(Reply::text("🏆 No broadcasts yet."));
        }
        let mut text = String::from("<b>🏆 Leaderboard</b>\n\n");
        for (rank, (user_id, name, sent)) in rows.iter().enumerate() {
            let medal = match rank {
                0 => "🥇".to_string(),
                1 => "🥈".to_string(),
                2 => "🥉".to_string(),
                n => format!("{}.", n + 1),
            };
            let name = name.clone().unwrap_or_else(|| user_id.to_string());
            text.push_str(&format!("{} {} - {} sent\n", medal, escape(&name), sent));
        }
        Ok(Reply::text(text))
    }

    // ------------------------------------------------------------------
    // Free text
    // ------------------------------------------------------------------

    /// Interpret a non-command message by the user's conversation state.
    pub async fn handle_text(&self, user_id: UserId, text: Option<&str>) -> Result<Option<Reply>> {
        let state = self.store.conversation_state(user_id).await;
        let kind = if text.is_some() {
            InputKind::Text
        } else {
            InputKind::NonText
        };
        let input = text.unwrap_or_default();
        let bounds = &self.config.broadcast;

        let reply = match (route(&state, kind), &state) {
            (Route::Ignore, _) => return Ok(None),
            (Route::Menu, _) => self.main_menu(user_id).await?,
            (Route::ExpectText, _) => Reply::text("✍️ Please send text, or /cancel."),
            (Route::ApiId, _) => self.submit_api_id(user_id, input).await?,
            (Route::ApiHash, ConversationState::AwaitingApiHash { api_id }) => {
                self.submit_api_hash(user_id, *api_id, input).await?
            }
            (Route::Phone, _) => self.submit_phone(user_id, input).await?,
            (Route::Otp, _) => self.submit_otp(user_id, input).await?,
            (Route::Password, _) => self.submit_password(user_id, input).await?,
            (Route::AdDelay, _) => match parse_delay(input, bounds.min_delay_secs, bounds.max_delay_secs) {
                Ok(secs) => {
                    self.store.set_ad_delay(user_id, secs).await?;
                    self.setting_saved(user_id, format!("Cycle interval set to {}s.", secs))
                        .await?
                }
                Err(msg) => Reply::text(format!("❌ {}", msg)),
            },
            (Route::GroupDelay, _) => match parse_delay(input, 1, bounds.max_delay_secs) {
                Ok(secs) => {
                    self.store.set_group_msg_delay(user_id, secs).await?;
                    self.setting_saved(user_id, format!("Message delay set to {}s.", secs))
                        .await?
                }
                Err(msg) => Reply::text(format!("❌ {}", msg)),
            },
            (Route::CycleTimeout, _) => {
                match parse_delay(input, bounds.min_delay_secs, bounds.max_delay_secs) {
                    Ok(secs) => {
                        self.store.set_cycle_timeout(user_id, secs).await?;
                        self.setting_saved(user_id, format!("Cooldown set to {}s.", secs))
                            .await?
                    }
                    Err(msg) => Reply::text(format!("❌ {}", msg)),
                }
            }
            (Route::SavedCount, _) => match parse_saved_count(input) {
                Ok(n) => {
                    self.store.set_saved_messages_count(user_id, i64::from(n)).await?;
                    self.store.reset_rotation(user_id).await?;
                    self.setting_saved(user_id, format!("Rotating through the last {} saved messages.", n))
                        .await?
                }
                Err(msg) => Reply::text(format!("❌ {}", msg)),
            },
            (Route::PostLink, _) => match parse_post_link(input) {
                Some(link) => {
                    let shown = escape(&link.link);
                    self.store.set_post_link(user_id, link).await?;
                    self.setting_saved(user_id, format!("Forwarding post {}.", shown))
                        .await?
                }
                None => Reply::text("❌ Send a link like https://t.me/channel/123."),
            },
            (Route::ScheduleStart, _) => match parse_time(input) {
                Some(start) => {
                    self.store
                        .set_conversation_state(
                            user_id,
                            ConversationState::AwaitingScheduleEnd {
                                start: format_time(start),
                            },
                        )
                        .await?;
                    Reply::text("🕒 Now send the end time (IST), e.g. <code>8:00 PM</code>.")
                }
                None => Reply::text("❌ Send a time like <code>8:00 AM</code>."),
            },
            (Route::ScheduleEnd, ConversationState::AwaitingScheduleEnd { start }) => {
                match Schedule::parse(start, input) {
                    Some(schedule) => {
                        self.store
                            .set_schedule(user_id, Some(schedule.to_window()))
                            .await?;
                        self.setting_saved(
                            user_id,
                            format!(
                                "Broadcasting only between {} and {} IST.",
                                format_time(schedule.start),
                                format_time(schedule.end)
                            ),
                        )
                        .await?
                    }
                    None => Reply::text("❌ Send a time like <code>8:00 PM</code>."),
                }
            }
            (Route::GroupSearch, _) => {
                self.store.set_group_search_filter(user_id, input).await?;
                self.store
                    .set_conversation_state(user_id, ConversationState::Idle)
                    .await?;
                self.groups_view(user_id, 0).await?
            }
            // State payload did not match its route; start over
            _ => {
                self.store
                    .set_conversation_state(user_id, ConversationState::Idle)
                    .await?;
                self.main_menu(user_id).await?
            }
        };
        Ok(Some(reply))
    }

    async fn setting_saved(&self, user_id: UserId, what: String) -> Result<Reply> {
        self.store
            .set_conversation_state(user_id, ConversationState::Idle)
            .await?;
        let mut reply = self.settings_view(user_id).await?;
        reply.text = format!("✅ {}\n\n{}", what, reply.text);
        Ok(reply)
    }

    // ------------------------------------------------------------------
    // Buttons
    // ------------------------------------------------------------------

    pub async fn handle_callback(&self, user_id: UserId, action: CallbackAction) -> Result<Option<Reply>> {
        let reply = match action {
            CallbackAction::Noop => return Ok(None),
            CallbackAction::MainMenu | CallbackAction::CheckJoin => self.main_menu(user_id).await?,
            CallbackAction::Settings => self.settings_view(user_id).await?,
            CallbackAction::Accounts => self.accounts_view(user_id).await?,
            CallbackAction::AddAccount => self.begin_login(user_id).await?,
            CallbackAction::DeleteAccount(id) => {
                match self.store.accounts(user_id).await.into_iter().find(|a| a.id == id) {
                    Some(account) => Reply::with_keyboard(
                        format!(
                            "🗑 Delete {}?\n\nDeleting your last account removes all your data \
                             (analytics are kept).",
                            mask_phone(&account.phone_number)
                        ),
                        keyboards::confirm_delete(&id),
                    ),
                    None => self.accounts_view(user_id).await?,
                }
            }
            CallbackAction::ConfirmDeleteAccount(id) => self.delete_account(user_id, &id).await?,
            CallbackAction::Mode => {
                let mode = self.store.broadcast_mode(user_id).await;
                Reply::with_keyboard(
                    format!("🎯 <b>Broadcast Mode</b>\n\nCurrent: {}", mode.label()),
                    keyboards::mode_menu(mode),
                )
            }
            CallbackAction::SetMode(mode) => {
                self.store.set_broadcast_mode(user_id, mode).await?;
                Reply::with_keyboard(
                    format!("✅ Mode set to {}", mode.label()),
                    keyboards::mode_menu(mode),
                )
            }
            CallbackAction::SetAdDelay => {
                self.prompt(user_id, ConversationState::AwaitingAdDelay, "⏱ Send the cycle interval in seconds.")
                    .await?
            }
            CallbackAction::SetGroupDelay => {
                self.prompt(
                    user_id,
                    ConversationState::AwaitingGroupDelay,
                    "⏳ Send the delay between two messages in seconds.",
                )
                .await?
            }
            CallbackAction::SetCycleTimeout => {
                self.prompt(
                    user_id,
                    ConversationState::AwaitingCycleTimeout,
                    "🧊 Send the cooldown (seconds) applied every few cycles.",
                )
                .await?
            }
            CallbackAction::SetSavedCount => {
                self.prompt(
                    user_id,
                    ConversationState::AwaitingSavedCount,
                    "🔁 How many of your latest saved messages should rotate? (1-20)",
                )
                .await?
            }
            CallbackAction::SetPostLink => {
                self.prompt(
                    user_id,
                    ConversationState::AwaitingPostLink,
                    "🔗 Send the post link, e.g. https://t.me/channel/123.",
                )
                .await?
            }
            CallbackAction::UseSavedMessages => {
                self.store.clear_post_link(user_id).await?;
                self.setting_saved(user_id, "Forwarding from Saved Messages.".into())
                    .await?
            }
            CallbackAction::SetSchedule => {
                self.prompt(
                    user_id,
                    ConversationState::AwaitingScheduleStart,
                    "🕒 Send the start time (IST), e.g. <code>8:00 AM</code>.",
                )
                .await?
            }
            CallbackAction::ClearSchedule => {
                self.store.set_schedule(user_id, None).await?;
                self.setting_saved(user_id, "Schedule removed, broadcasting all day.".into())
                    .await?
            }
            CallbackAction::Groups(page) => self.groups_view(user_id, page).await?,
            CallbackAction::ToggleGroup(group_id, page) => {
                self.toggle_group(user_id, group_id).await?;
                self.groups_view(user_id, page).await?
            }
            CallbackAction::RefreshGroups => match self.cache.refresh(user_id).await {
                Ok(snapshot) => {
                    let mut reply = self.groups_view(user_id, 0).await?;
                    reply.text = format!("🔄 Found {} groups.\n\n{}", snapshot.len(), reply.text);
                    reply
                }
                Err(e) => {
                    warn!(user_id, "Group refresh failed: {}", e);
                    Reply::text("❌ Could not load groups right now, try again later.")
                }
            },
            CallbackAction::SearchGroups => {
                self.prompt(
                    user_id,
                    ConversationState::AwaitingGroupSearch,
                    "🔍 Send part of a group name.",
                )
                .await?
            }
            CallbackAction::ClearSearch => {
                self.store.clear_group_search_filter(user_id).await?;
                self.groups_view(user_id, 0).await?
            }
            CallbackAction::ClearSelection => {
                self.store.clear_selected_groups(user_id).await?;
                self.groups_view(user_id, 0).await?
            }
            CallbackAction::StartBroadcast => self.start_broadcast(user_id).await?,
            CallbackAction::StopBroadcast => self.stop_broadcast(user_id).await?,
        };
        Ok(Some(reply))
    }

    async fn prompt(&self, user_id: UserId, state: ConversationState, text: &str) -> Result<Reply> {
        self.store.set_conversation_state(user_id, state).await?;
        Ok(Reply::text(format!("{}\n\n/cancel to abort.", text)))
    }

    pub async fn settings_view(&self, user_id: UserId) -> Result<Reply> {
        let ad_delay = self.store.ad_delay(user_id).await;
        let group_delay = self.store.group_msg_delay(user_id).await;
        let cooldown = self.store.cycle_timeout(user_id).await;
        let count = self.store.saved_messages_count(user_id).await;
        let post_link = self.store.post_link(user_id).await;
        let using_link =
            self.store.message_source(user_id).await == MessageSource::PostLink && post_link.is_some();
        let schedule = self.store.schedule(user_id).await;

        let source = match (&post_link, using_link) {
            (Some(link), true) => format!("Post link ({})", escape(&link.link)),
            _ => format!("Saved Messages (last {})", count),
        };
        let window = match &schedule {
            Some(w) => format!("{} - {} IST", w.start, w.end),
            None => "All day".to_string(),
        };
        let text = format!(
            "<b>⚙️ Settings</b>\n\n\
             ⏱ Cycle Interval: {}s\n\
             ⏳ Message Delay: {}s\n\
             🧊 Cooldown (every {} cycles): {}s\n\
             💬 Source: {}\n\
             🕒 Schedule: {}",
            ad_delay,
            group_delay,
            self.config.broadcast.cooldown_every_cycles,
            cooldown,
            source,
            window
        );
        Ok(Reply::with_keyboard(
            text,
            keyboards::settings_menu(schedule.is_some(), using_link),
        ))
    }

    async fn accounts_view(&self, user_id: UserId) -> Result<Reply> {
        let accounts = self.store.accounts(user_id).await;
        let (_, limit) = self.store.user_status(user_id).await;
        let mut text = format!("<b>📱 Accounts</b> ({}/{})\n\n", accounts.len(), limit);
        if accounts.is_empty() {
            text.push_str("No account linked yet.");
        }
        for a in &accounts {
            let status = if a.is_active { "🟢" } else { "🔴 re-login needed" };
            text.push_str(&format!("{} {}\n", status, mask_phone(&a.phone_number)));
        }
        let can_add = accounts.len() < limit as usize;
        Ok(Reply::with_keyboard(text, keyboards::accounts_menu(&accounts, can_add)))
    }

    async fn delete_account(&self, user_id: UserId, account_id: &str) -> Result<Reply> {
        self.supervisor.stop(user_id).await?;
        if !self.store.delete_account(user_id, account_id).await? {
            return self.accounts_view(user_id).await;
        }
        if self.store.account_count(user_id).await == 0 {
            self.store.delete_user_fully(user_id).await?;
            info!(user_id, "Last account deleted, user data wiped");
            return Ok(Reply::text(
                "🗑 Account deleted and your data removed. Send /start to begin again.",
            ));
        }
        let mut reply = self.accounts_view(user_id).await?;
        reply.text = format!("🗑 Account deleted.\n\n{}", reply.text);
        Ok(reply)
    }

    /// Selection page over the cached groups, honoring the search filter.
    pub async fn groups_view(&self, user_id: UserId, page: usize) -> Result<Reply> {
        if self.store.active_accounts(user_id).await.is_empty() {
            return Ok(Reply::with_keyboard(
                "📱 Add an account first to load your groups.",
                keyboards::back_to_main(),
            ));
        }
        let snapshot = self.cache.get(user_id).await?;
        let filter = self.store.group_search_filter(user_id).await;
        let selected: HashSet<i64> = self
            .store
            .target_groups(user_id)
            .await
            .iter()
            .map(|g| g.group_id)
            .chain(self.store.forum_groups(user_id).await.iter().map(|g| g.group_id))
            .collect();

        let mut all: Vec<&CachedGroup> = snapshot.groups.iter().chain(snapshot.forums.iter()).collect();
        all.sort_by_key(|g| g.title.to_lowercase());
        let shown: Vec<&CachedGroup> = match &filter {
            Some(f) => all
                .into_iter()
                .filter(|g| g.title.to_lowercase().contains(f.as_str()))
                .collect(),
            None => all,
        };

        let mut text = format!(
            "<b>👥 Select Groups</b>\n\nSelected: {} | Showing: {}",
            selected.len(),
            shown.len()
        );
        if let Some(f) = &filter {
            text.push_str(&format!("\n🔍 Filter: <code>{}</code>", escape(f)));
        }
        let keyboard = keyboards::groups_page(&shown, &|id| selected.contains(&id), page, filter.is_some());
        Ok(Reply::with_keyboard(text, keyboard))
    }

    /// Select or unselect a cached group. Forums keep their open topics.
    pub async fn toggle_group(&self, user_id: UserId, group_id: i64) -> Result<bool> {
        if self.store.remove_target_group(user_id, group_id).await?
            | self.store.remove_forum_group(user_id, group_id).await?
        {
            return Ok(false);
        }
        let snapshot = self.cache.get(user_id).await?;
        let Some(group) = snapshot.find(group_id) else {
            return Err(AdError::NotFound(format!("group {} not in cache", group_id)));
        };
        if group.kind.is_forum() {
            let topics = group.topics.iter().filter(|t| !t.closed).cloned().collect();
            self.store
                .add_forum_group(user_id, group_id, &group.title, topics)
                .await?;
        } else {
            self.store
                .add_target_group(user_id, group_id, &group.title)
                .await?;
        }
        Ok(true)
    }
}
