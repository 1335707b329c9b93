//! Inline keyboards and the callback data they carry.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::store::{Account, BroadcastMode, CachedGroup, GroupId};

/// Groups shown per selection page.
pub const GROUPS_PER_PAGE: usize = 8;

/// Button actions, encoded as `scope:action[:arg]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    MainMenu,
    Settings,
    Accounts,
    AddAccount,
    DeleteAccount(String),
    ConfirmDeleteAccount(String),
    Mode,
    SetMode(BroadcastMode),
    SetAdDelay,
    SetGroupDelay,
    SetCycleTimeout,
    SetSavedCount,
    SetPostLink,
    UseSavedMessages,
    SetSchedule,
    ClearSchedule,
    Groups(usize),
    ToggleGroup(GroupId, usize),
    RefreshGroups,
    SearchGroups,
    ClearSearch,
    ClearSelection,
    StartBroadcast,
    StopBroadcast,
    CheckJoin,
    Noop,
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        let parts: Vec<&str> = data.split(':').collect();
        let action = match parts.as_slice() {
            ["menu", "main"] => Self::MainMenu,
            ["menu", "settings"] => Self::Settings,
            ["menu", "accounts"] => Self::Accounts,
            ["menu", "mode"] => Self::Mode,
            ["acc", "add"] => Self::AddAccount,
            ["acc", "del", id] => Self::DeleteAccount(id.to_string()),
            ["acc", "delok", id] => Self::ConfirmDeleteAccount(id.to_string()),
            ["mode", m] => Self::SetMode(BroadcastMode::parse(m)?),
            ["set", "ad_delay"] => Self::SetAdDelay,
            ["set", "group_delay"] => Self::SetGroupDelay,
            ["set", "cycle_timeout"] => Self::SetCycleTimeout,
            ["set", "saved_count"] => Self::SetSavedCount,
            ["set", "post_link"] => Self::SetPostLink,
            ["set", "saved_source"] => Self::UseSavedMessages,
            ["set", "schedule"] => Self::SetSchedule,
            ["set", "schedule_off"] => Self::ClearSchedule,
            ["grp", "page", page] => Self::Groups(page.parse().ok()?),
            ["grp", "t", id, page] => Self::ToggleGroup(id.parse().ok()?, page.parse().ok()?),
            ["grp", "refresh"] => Self::RefreshGroups,
            ["grp", "search"] => Self::SearchGroups,
            ["grp", "search_clear"] => Self::ClearSearch,
            ["grp", "clear"] => Self::ClearSelection,
            ["bc", "start"] => Self::StartBroadcast,
            ["bc", "stop"] => Self::StopBroadcast,
            ["join", "check"] => Self::CheckJoin,
            ["noop"] => Self::Noop,
            _ => return None,
        };
        Some(action)
    }
}

fn btn(text: &str, data: &str) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(text.to_string(), data.to_string())
}

fn url_btn(text: &str, url: &str) -> InlineKeyboardButton {
    match url.parse() {
        Ok(parsed) => InlineKeyboardButton::url(text.to_string(), parsed),
        Err(_) => btn(text, "noop"),
    }
}

pub fn main_menu(running: bool) -> InlineKeyboardMarkup {
    let broadcast = if running {
        btn("⏹ Stop Broadcast", "bc:stop")
    } else {
        btn("🚀 Start Broadcast", "bc:start")
    };
    InlineKeyboardMarkup::new(vec![
        vec![broadcast],
        vec![btn("👥 Groups", "grp:page:0"), btn("📱 Accounts", "menu:accounts")],
        vec![btn("⚙️ Settings", "menu:settings"), btn("🎯 Mode", "menu:mode")],
    ])
}

pub fn settings_menu(has_schedule: bool, post_link: bool) -> InlineKeyboardMarkup {
    let source = if post_link {
        btn("💾 Use Saved Messages", "set:saved_source")
    } else {
        btn("🔗 Use Post Link", "set:post_link")
    };
    let schedule = if has_schedule {
        btn("🕒 Remove Schedule", "set:schedule_off")
    } else {
        btn("🕒 Set Schedule", "set:schedule")
    };
    InlineKeyboardMarkup::new(vec![
        vec![btn("⏱ Cycle Interval", "set:ad_delay"), btn("⏳ Message Delay", "set:group_delay")],
        vec![btn("🧊 Cooldown", "set:cycle_timeout"), btn("🔁 Saved Count", "set:saved_count")],
        vec![source, schedule],
        vec![btn("⬅️ Back", "menu:main")],
    ])
}

pub fn mode_menu(current: BroadcastMode) -> InlineKeyboardMarkup {
    let mark = |mode: BroadcastMode| {
        if mode == current {
            format!("✅ {}", mode.label())
        } else {
            mode.label().to_string()
        }
    };
    InlineKeyboardMarkup::new(vec![
        vec![btn(&mark(BroadcastMode::GroupsOnly), "mode:groups_only")],
        vec![btn(&mark(BroadcastMode::ForumsOnly), "mode:forums_only")],
        vec![btn(&mark(BroadcastMode::Both), "mode:both")],
        vec![btn("⬅️ Back", "menu:main")],
    ])
}

pub fn accounts_menu(accounts: &[Account], can_add: bool) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = accounts
        .iter()
        .map(|a| {
            vec![btn(
                &format!("🗑 {}", crate::store::mask_phone(&a.phone_number)),
                &format!("acc:del:{}", a.id),
            )]
        })
        .collect();
    if can_add {
        rows.push(vec![btn("➕ Add Account", "acc:add")]);
    }
    rows.push(vec![btn("⬅️ Back", "menu:main")]);
    InlineKeyboardMarkup::new(rows)
}

pub fn confirm_delete(account_id: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        btn("✅ Yes, delete", &format!("acc:delok:{}", account_id)),
        btn("❌ No", "menu:accounts"),
    ]])
}

/// One page of cached groups with selection marks.
pub fn groups_page(
    groups: &[&CachedGroup],
    selected: &dyn Fn(GroupId) -> bool,
    page: usize,
    searching: bool,
) -> InlineKeyboardMarkup {
    let pages = groups.len().div_ceil(GROUPS_PER_PAGE).max(1);
    let page = page.min(pages - 1);

    let mut rows: Vec<Vec<InlineKeyboardButton>> = groups
        .iter()
        .skip(page * GROUPS_PER_PAGE)
        .take(GROUPS_PER_PAGE)
        .map(|g| {
            let mark = if selected(g.group_id) { "✅" } else { "▫️" };
            let kind = if g.kind.is_forum() { " 💬" } else { "" };
            let title: String = g.title.chars().take(40).collect();
            vec![btn(
                &format!("{} {}{}", mark, title, kind),
                &format!("grp:t:{}:{}", g.group_id, page),
            )]
        })
        .collect();

    let mut nav = Vec::new();
    if page > 0 {
        nav.push(btn("◀️", &format!("grp:page:{}", page - 1)));
    }
    nav.push(btn(&format!("{}/{}", page + 1, pages), "noop"));
    if page + 1 < pages {
        nav.push(btn("▶️", &format!("grp:page:{}", page + 1)));
    }
    rows.push(nav);

    let search = if searching {
        btn("✖️ Clear Search", "grp:search_clear")
    } else {
        btn("🔍 Search", "grp:search")
    };
    rows.push(vec![search, btn("🔄 Refresh", "grp:refresh")]);
    rows.push(vec![btn("🧹 Clear Selection", "grp:clear"), btn("⬅️ Back", "menu:main")]);
    InlineKeyboardMarkup::new(rows)
}

pub fn force_join(channel: &str, group: &str) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    if !channel.is_empty() {
        rows.push(vec![url_btn(
            "📢 Join Channel",
            &format!("https://t.me/{}", channel.trim_start_matches('@')),
        )]);
    }
    if !group.is_empty() {
        rows.push(vec![url_btn(
            "💬 Join Group",
            &format!("https://t.me/{}", group.trim_start_matches('@')),
        )]);
    }
    rows.push(vec![btn("✅ I've Joined", "join:check")]);
    InlineKeyboardMarkup::new(rows)
}

pub fn back_to_main() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![btn("⬅️ Main Menu", "menu:main")]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_callbacks() {
        assert_eq!(CallbackAction::parse("menu:main"), Some(CallbackAction::MainMenu));
        assert_eq!(
            CallbackAction::parse("grp:t:-100123:2"),
            Some(CallbackAction::ToggleGroup(-100123, 2))
        );
        assert_eq!(
            CallbackAction::parse("mode:forums_only"),
            Some(CallbackAction::SetMode(BroadcastMode::ForumsOnly))
        );
        assert_eq!(
            CallbackAction::parse("acc:delok:abc"),
            Some(CallbackAction::ConfirmDeleteAccount("abc".into()))
        );
        assert_eq!(CallbackAction::parse("mode:nope"), None);
        assert_eq!(CallbackAction::parse("grp:page:x"), None);
        assert_eq!(CallbackAction::parse(""), None);
    }

    #[test]
    fn test_callback_data_fits_telegram_limit() {
        let data = format!("grp:t:{}:{}", i64::MIN, usize::MAX);
        assert!(data.len() <= 64);
    }

    #[test]
    fn test_groups_page_navigation() {
        let groups: Vec<CachedGroup> = (0..10)
            .map(|i| CachedGroup {
                user_id: 1,
                group_id: -(i + 1),
                title: format!("G{}", i),
                username: None,
                kind: Default::default(),
                members_count: None,
                account_phone: "+1".into(),
                topics: vec![],
                cached_at: 0,
            })
            .collect();
        let refs: Vec<&CachedGroup> = groups.iter().collect();
        let kb = groups_page(&refs, &|id| id == -1, 0, false);
        // 8 group rows + nav + search + clear
        assert_eq!(kb.inline_keyboard.len(), GROUPS_PER_PAGE + 3);
        assert!(kb.inline_keyboard[0][0].text.starts_with("✅"));
        let last = groups_page(&refs, &|_| false, 5, false);
        // clamps to the last page, which holds 2 groups
        assert_eq!(last.inline_keyboard.len(), 2 + 3);
    }
}
