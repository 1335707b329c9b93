//! Message rotation and per-account working sets.

use crate::analyzer::Target;
use crate::store::{GroupId, MessageSource, PostLink};
use crate::telegram::{MessageRef, SavedMessage};

/// Most recent saved messages considered for rotation.
pub const SAVED_WINDOW: usize = 20;

/// Pick the message for this cycle.
///
/// A post link always wins when it is the configured source. Otherwise the
/// newest saved messages (newest first, as the client returns them) are put in
/// chronological order, cut to `count`, and indexed by `rotation`.
pub fn select_message(
    source: MessageSource,
    post_link: Option<&PostLink>,
    saved: &[SavedMessage],
    rotation: u32,
    count: u32,
) -> Option<MessageRef> {
    if source == MessageSource::PostLink {
        if let Some(link) = post_link {
            return Some(MessageRef::Post {
                from_peer: link.from_peer.clone(),
                message_id: link.message_id,
            });
        }
    }

    let mut window: Vec<&SavedMessage> = saved.iter().take(SAVED_WINDOW).collect();
    window.reverse();
    window.truncate(count.max(1) as usize);
    if window.is_empty() {
        return None;
    }
    let index = rotation as usize % window.len();
    Some(MessageRef::Saved {
        message_id: window[index].id,
    })
}

/// Targets one account still sends to during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingSet {
    targets: Vec<Target>,
}

impl WorkingSet {
    pub fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn contains(&self, group_id: GroupId) -> bool {
        self.targets.iter().any(|t| t.group_id == group_id)
    }

    /// Remove a group for the rest of the run.
    pub fn drop_group(&mut self, group_id: GroupId) -> bool {
        let before = self.targets.len();
        self.targets.retain(|t| t.group_id != group_id);
        self.targets.len() < before
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
