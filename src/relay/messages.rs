//! HTML log lines delivered through the logger bot.

use teloxide::utils::html::escape;

use crate::analyzer::{Analysis, RestrictionReason};
use crate::store::BroadcastMode;

pub fn analysis_start(mode: BroadcastMode, target_count: usize) -> String {
    let topics_line = if mode == BroadcastMode::ForumsOnly {
        "• Forum topics detection"
    } else {
        "• Forum topics status"
    };
    format!(
        "<b>🔍 ANALYZING GROUPS</b>\n\n\
         <b>Mode:</b> <b>{} Mode</b>\n\
         <b>Target Groups:</b> {} groups\n\n\
         <b>Checking for:</b>\n\
         • Access permissions\n\
         • Account bans/restrictions\n\
         • Group availability\n\
         {}\n\n\
         ⏳ <i>Please wait, analyzing all groups...</i>",
        mode.label(),
        target_count,
        topics_line
    )
}

pub fn analysis_complete(total_selected: usize, analysis: &Analysis) -> String {
    let filtered = analysis.targets.len();
    if analysis.restricted.is_empty() {
        return format!(
            "<b>✅ ALL GROUPS READY</b>\n\n\
             All {} selected groups (after mode filter) are ready for broadcasting!",
            filtered
        );
    }
    format!(
        "<b>📋 GROUP ANALYSIS COMPLETE</b>\n\n\
         ★ <b>ANALYSIS RESULTS</b>\n\
         \u{20}\u{20}→ Total Selected: {}\n\
         \u{20}\u{20}→ Ready to Send: {}\n\
         \u{20}\u{20}→ May Have Issues: {}\n\
         \u{20}\u{20}→ After Mode Filter: {}\n\n\
         <i>Will attempt to send to {} groups matching your broadcast mode. \
         Restricted groups will be marked as failed if sending fails.</i>",
        total_selected,
        analysis.usable.len(),
        analysis.restricted.len(),
        filtered,
        filtered
    )
}

/// Settings echoed back when a broadcast starts.
#[derive(Debug, Clone)]
pub struct StartedInfo {
    pub mode: BroadcastMode,
    pub post_link: bool,
    pub cycle_interval_secs: u64,
    pub group_delay_secs: u64,
    pub group_count: usize,
    pub total_topics: usize,
}

pub fn broadcast_started(info: &StartedInfo) -> String {
    let message_mode = if info.post_link {
        "Post Link"
    } else {
        "Saved Messages"
    };
    let mut msg = format!(
        "<b>🚀 BROADCAST STARTED</b>\n\n\
         ★ <b>BROADCAST SETTINGS</b>\n\
         \u{20}\u{20}→ Broadcast Mode: {}\n\
         \u{20}\u{20}→ Message Mode: {}\n\
         \u{20}\u{20}→ Cycle Interval: {}s\n\
         \u{20}\u{20}→ Message Delay: {}s\n\
         \u{20}\u{20}→ Target Groups: {}\n",
        info.mode.label(),
        message_mode,
        info.cycle_interval_secs,
        info.group_delay_secs,
        info.group_count
    );
    if info.mode == BroadcastMode::ForumsOnly && info.total_topics > 0 {
        msg.push_str(&format!("  → Total Topics: {}\n", info.total_topics));
    }
    msg.push_str("\nBroadcasting now...");
    msg
}

pub fn setup_complete(account_count: usize, usable_groups: usize, cycle_secs: u64, group_delay_secs: u64) -> String {
    format!(
        "<b>✅ Setup Complete</b>\n\n\
         Accounts: {}\n\
         Usable Groups: {}\n\
         Cycle: {}s | Group Delay: {}s\n\n\
         <b>Broadcasting now...</b>",
        account_count, usable_groups, cycle_secs, group_delay_secs
    )
}

pub fn cycle_summary(cycle: u64, sent: u64, failed: u64, next_in_secs: u64) -> String {
    format!(
        "<b>🔁 Cycle {} complete</b>\n\n\
         ✅ Sent: {}\n\
         ❌ Failed: {}\n\n\
         <i>Next cycle in {}s</i>",
        cycle, sent, failed, next_in_secs
    )
}

pub fn cooldown(cycle: u64, secs: u64) -> String {
    format!(
        "<b>😴 Cooldown</b>\n\nCycle {} reached, resting {}s before continuing.",
        cycle, secs
    )
}

pub fn schedule_paused(start: &str, end: &str) -> String {
    format!(
        "<b>⏸ Broadcast paused</b>\n\n\
         Outside your schedule ({} - {} IST). Will resume automatically.",
        escape(start),
        escape(end)
    )
}

pub fn schedule_resumed() -> String {
    "<b>▶️ Broadcast resumed</b>\n\nBack inside your schedule window.".to_string()
}

pub fn schedule_ended() -> String {
    "<b>🌙 Schedule ended</b>\n\nToday's window is over, broadcast stopped.".to_string()
}

pub fn sent(title: &str, topic: Option<&str>) -> String {
    match topic {
        Some(t) => format!("✅ Sent to <b>{}</b> › {}", escape(title), escape(t)),
        None => format!("✅ Sent to <b>{}</b>", escape(title)),
    }
}

pub fn rate_limited(title: &str, wait_secs: u64) -> String {
    format!(
        "⏳ Rate limited in <b>{}</b>, waiting {}s",
        escape(title),
        wait_secs
    )
}

pub fn group_dropped(title: &str, reason: &str) -> String {
    format!(
        "🚫 <b>{}</b> removed for this run: {}",
        escape(title),
        escape(reason)
    )
}

pub fn transient_failure(title: &str, reason: &str) -> String {
    format!(
        "⚠️ Failed in <b>{}</b>: {}\n<i>Will retry next cycle.</i>",
        escape(title),
        escape(reason)
    )
}

pub fn restricted_line(title: &str, reason: RestrictionReason) -> String {
    format!("• {} ({})", escape(title), reason)
}

pub fn no_messages() -> String {
    "<b>❌ No messages found</b>\n\n\
     Save the ads you want to send in your account's Saved Messages, \
     or set a post link, then start again."
        .to_string()
}

pub fn no_targets() -> String {
    "<b>❌ No usable groups</b>\n\nSelect groups matching your broadcast mode and try again."
        .to_string()
}

pub fn broadcast_stopped(cycles: u64) -> String {
    format!(
        "<b>⏹ Broadcast stopped</b>\n\nCompleted cycles: {}",
        cycles
    )
}

pub fn broadcast_crashed(error: &str) -> String {
    format!(
        "<b>💥 Broadcast stopped unexpectedly</b>\n\n<code>{}</code>\n\nUse /go to start again.",
        escape(error)
    )
}

pub fn admin_crash_report(user_id: i64, error: &str) -> String {
    format!(
        "<b>⚠️ Broadcast crash</b>\n\nUser: <code>{}</code>\nError: <code>{}</code>",
        user_id,
        escape(error)
    )
}

pub fn logger_not_started(logger_username: &str) -> String {
    format!(
        "<b>⚠️ Logger bot not started!</b>\n\nPlease start @{} to receive log updates.",
        escape(logger_username.trim_start_matches('@'))
    )
}

pub fn logger_welcome(main_bot_username: &str, bot_name: &str) -> String {
    format!(
        "<b>✨ Welcome to {} Logger! 📊</b>\n\n\
         Logs for your ad broadcasts will be sent here.\n\
         Start the main bot (@{}) to begin broadcasting! 🚀",
        escape(bot_name),
        escape(main_bot_username.trim_start_matches('@'))
    )
}
