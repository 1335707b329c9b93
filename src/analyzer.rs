//! Pre-broadcast group analysis.
//!
//! Runs once per start request, per connected account. Each selected group is
//! probed concurrently and classified as usable or restricted. Restricted
//! groups stay in the target list: permissions may change before the send,
//! so only a live send failure removes a group.

use std::fmt;

use futures::future::join_all;
use serde::Serialize;
use tracing::debug;

use crate::error::SendError;
use crate::log_component;
use crate::store::{BroadcastMode, ForumGroup, ForumTopic, GroupId, TargetGroup};
use crate::telegram::TelegramClient;

/// A group the broadcast will attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub group_id: GroupId,
    pub title: String,
    pub is_forum: bool,
    /// Open topics; empty for plain groups
    pub topics: Vec<ForumTopic>,
}

impl Target {
    /// Number of forwards one cycle makes to this target.
    pub fn sends_per_cycle(&self) -> usize {
        if self.is_forum && !self.topics.is_empty() {
            self.topics.len()
        } else {
            1
        }
    }
}

/// Why a group is expected to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictionReason {
    WriteForbidden,
    NotMember,
    NoSendPermission,
}

impl fmt::Display for RestrictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestrictionReason::WriteForbidden => "write forbidden",
            RestrictionReason::NotMember => "not a member",
            RestrictionReason::NoSendPermission => "no send permission",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Restricted {
    pub target: Target,
    pub reason: RestrictionReason,
}

/// Result of [`analyze`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Analysis {
    pub usable: Vec<Target>,
    pub restricted: Vec<Restricted>,
    /// Usable and restricted, in input order, filtered by broadcast mode
    pub targets: Vec<Target>,
}

impl Analysis {
    pub fn total_sends_per_cycle(&self) -> usize {
        self.targets.iter().map(Target::sends_per_cycle).sum()
    }
}

/// Combine the user's selected plain groups and forums into one target list.
/// Stored forum topics are a fallback; [`analyze`] fetches live ones.
pub fn resolve_targets(groups: &[TargetGroup], forums: &[ForumGroup]) -> Vec<Target> {
    let mut targets: Vec<Target> = groups
        .iter()
        .map(|g| Target {
            group_id: g.group_id,
            title: g.title.clone(),
            is_forum: false,
            topics: Vec::new(),
        })
        .collect();
    for f in forums {
        if let Some(existing) = targets.iter_mut().find(|t| t.group_id == f.group_id) {
            existing.is_forum = true;
            existing.topics = open_topics(f.topics.clone());
            continue;
        }
        targets.push(Target {
            group_id: f.group_id,
            title: f.title.clone(),
            is_forum: true,
            topics: open_topics(f.topics.clone()),
        });
    }
    targets
}

fn open_topics(topics: Vec<ForumTopic>) -> Vec<ForumTopic> {
    topics.into_iter().filter(|t| !t.closed).collect()
}

enum Probe {
    Usable(Target),
    Restricted(Restricted),
}

async fn probe(client: &dyn TelegramClient, target: &Target) -> Probe {
    let mut target = target.clone();
    let info = match client.chat_info(target.group_id).await {
        Ok(info) => info,
        Err(SendError::Permanent(msg)) => {
            debug!(group_id = target.group_id, "Group write forbidden: {}", msg);
            return Probe::Restricted(Restricted {
                target,
                reason: RestrictionReason::WriteForbidden,
            });
        }
        Err(e) => {
            // Unresolved right now; let the send decide
            debug!(group_id = target.group_id, "Group probe inconclusive: {}", e);
            return Probe::Usable(target);
        }
    };

    if !info.title.is_empty() {
        target.title = info.title.clone();
    }
    target.is_forum = target.is_forum || info.is_forum;
    if target.is_forum {
        match client.forum_topics(target.group_id).await {
            Ok(topics) => target.topics = open_topics(topics),
            Err(e) => debug!(group_id = target.group_id, "Keeping stored topics: {}", e),
        }
    }

    if !info.is_member {
        return Probe::Restricted(Restricted {
            target,
            reason: RestrictionReason::NotMember,
        });
    }
    if info.send_messages_banned {
        return Probe::Restricted(Restricted {
            target,
            reason: RestrictionReason::NoSendPermission,
        });
    }
    Probe::Usable(target)
}

/// Probe every target concurrently with one account's client.
pub async fn analyze(
    client: &dyn TelegramClient,
    targets: &[Target],
    mode: BroadcastMode,
) -> Analysis {
    let probes = join_all(targets.iter().map(|t| probe(client, t))).await;

    let mut analysis = Analysis::default();
    for p in probes {
        let target = match p {
            Probe::Usable(t) => {
                analysis.usable.push(t.clone());
                t
            }
            Probe::Restricted(r) => {
                let t = r.target.clone();
                analysis.restricted.push(r);
                t
            }
        };
        if mode.includes(target.is_forum) {
            analysis.targets.push(target);
        }
    }

    log_component!(
        info,
        "analyzer",
        "Group analysis complete",
        usable = analysis.usable.len(),
        restricted = analysis.restricted.len(),
        targets = analysis.targets.len()
    );
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::{AccountCredentials, ChatInfo, ClientFactory, DialogKind, MemoryAccount, MemoryBackend};
    use std::sync::Arc;

    fn target(id: GroupId, forum: bool) -> Target {
        Target {
            group_id: id,
            title: format!("g{}", id),
            is_forum: forum,
            topics: Vec::new(),
        }
    }

    async fn client(account: MemoryAccount) -> Arc<dyn TelegramClient> {
        let backend = MemoryBackend::new();
        backend.add_account("s", account);
        backend
            .connect(&AccountCredentials {
                phone: "+1".into(),
                api_id: 1,
                api_hash: "h".into(),
                session: "s".into(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_restricted_groups_stay_targets() {
        let mut account = MemoryAccount::new(1, "+1")
            .with_group(-1, "Open", DialogKind::Supergroup)
            .with_group(-2, "Muted", DialogKind::Supergroup);
        account.chats.get_mut(&-2).unwrap().send_messages_banned = true;
        account.chats.insert(
            -3,
            ChatInfo {
                id: -3,
                title: "Left".into(),
                is_member: false,
                is_forum: false,
                send_messages_banned: false,
            },
        );
        let client = client(account).await;

        // -4 is unknown to the account: CHANNEL_PRIVATE → write forbidden
        let targets = vec![target(-1, false), target(-2, false), target(-3, false), target(-4, false)];
        let a = analyze(client.as_ref(), &targets, BroadcastMode::Both).await;

        assert_eq!(a.usable.len(), 1);
        assert_eq!(a.restricted.len(), 3);
        assert_eq!(a.restricted[0].reason, RestrictionReason::NoSendPermission);
        assert_eq!(a.restricted[1].reason, RestrictionReason::NotMember);
        assert_eq!(a.restricted[2].reason, RestrictionReason::WriteForbidden);
        let ids: Vec<GroupId> = a.targets.iter().map(|t| t.group_id).collect();
        assert_eq!(ids, vec![-1, -2, -3, -4]);
    }

    #[tokio::test]
    async fn test_mode_filter_and_live_topics() {
        let account = MemoryAccount::new(1, "+1")
            .with_group(-1, "Plain", DialogKind::Supergroup)
            .with_group(-2, "Forum", DialogKind::Forum)
            .with_topics(
                -2,
                vec![
                    ForumTopic { id: 1, title: "a".into(), closed: false },
                    ForumTopic { id: 2, title: "b".into(), closed: true },
                    ForumTopic { id: 3, title: "c".into(), closed: false },
                ],
            );
        let client = client(account).await;
        let targets = vec![target(-1, false), target(-2, true)];

        let forums = analyze(client.as_ref(), &targets, BroadcastMode::ForumsOnly).await;
        assert_eq!(forums.targets.len(), 1);
        assert_eq!(forums.targets[0].topics.len(), 2);
        assert_eq!(forums.total_sends_per_cycle(), 2);

        let groups = analyze(client.as_ref(), &targets, BroadcastMode::GroupsOnly).await;
        assert_eq!(groups.targets.len(), 1);
        assert_eq!(groups.targets[0].group_id, -1);
        assert_eq!(groups.usable.len(), 2);
    }

    #[test]
    fn test_resolve_targets_merges_forums() {
        let groups = vec![TargetGroup {
            user_id: 1,
            group_id: -1,
            title: "A".into(),
            added_at: 0,
        }];
        let forums = vec![ForumGroup {
            user_id: 1,
            group_id: -2,
            title: "F".into(),
            topics: vec![
                ForumTopic { id: 1, title: "x".into(), closed: false },
                ForumTopic { id: 2, title: "y".into(), closed: true },
            ],
            added_at: 0,
        }];
        let targets = resolve_targets(&groups, &forums);
        assert_eq!(targets.len(), 2);
        assert!(!targets[0].is_forum);
        assert!(targets[1].is_forum);
        assert_eq!(targets[1].topics.len(), 1);
    }
}
