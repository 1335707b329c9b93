//! Target groups, forum groups and the per-user dialog cache.

use std::collections::HashSet;

use super::models::*;
use super::Store;
use crate::error::Result;
use crate::utils::time::now_ts;

impl Store {
    // ------------------------------------------------------------------
    // Target groups
    // ------------------------------------------------------------------

    /// Select a plain group. Re-adding the same group keeps one record and
    /// takes the latest title.
    pub async fn add_target_group(&self, user_id: UserId, group_id: GroupId, title: &str) -> Result<()> {
        self.mutate(|doc| {
            match doc
                .target_groups
                .iter_mut()
                .find(|g| g.user_id == user_id && g.group_id == group_id)
            {
                Some(g) => g.title = title.to_string(),
                None => doc.target_groups.push(TargetGroup {
                    user_id,
                    group_id,
                    title: title.to_string(),
                    added_at: now_ts(),
                }),
            }
        })
        .await
    }

    pub async fn remove_target_group(&self, user_id: UserId, group_id: GroupId) -> Result<bool> {
        self.mutate(|doc| {
            let before = doc.target_groups.len();
            doc.target_groups
                .retain(|g| !(g.user_id == user_id && g.group_id == group_id));
            doc.target_groups.len() < before
        })
        .await
    }

    pub async fn target_groups(&self, user_id: UserId) -> Vec<TargetGroup> {
        self.read(|doc| {
            doc.target_groups
                .iter()
                .filter(|g| g.user_id == user_id)
                .cloned()
                .collect()
        })
        .await
    }

    // ------------------------------------------------------------------
    // Forum groups
    // ------------------------------------------------------------------

    /// Select a forum with its topics. Upsert on (user, group).
    pub async fn add_forum_group(
        &self,
        user_id: UserId,
        group_id: GroupId,
        title: &str,
        topics: Vec<ForumTopic>,
    ) -> Result<()> {
        self.mutate(|doc| {
            match doc
                .forum_groups
                .iter_mut()
                .find(|g| g.user_id == user_id && g.group_id == group_id)
            {
                Some(g) => {
                    g.title = title.to_string();
                    g.topics = topics;
                }
                None => doc.forum_groups.push(ForumGroup {
                    user_id,
                    group_id,
                    title: title.to_string(),
                    topics,
                    added_at: now_ts(),
                }),
            }
        })
        .await
    }

    pub async fn remove_forum_group(&self, user_id: UserId, group_id: GroupId) -> Result<bool> {
        self.mutate(|doc| {
            let before = doc.forum_groups.len();
            doc.forum_groups
                .retain(|g| !(g.user_id == user_id && g.group_id == group_id));
            doc.forum_groups.len() < before
        })
        .await
    }

    pub async fn forum_group(&self, user_id: UserId, group_id: GroupId) -> Option<ForumGroup> {
        self.read(|doc| {
            doc.forum_groups
                .iter()
                .find(|g| g.user_id == user_id && g.group_id == group_id)
                .cloned()
        })
        .await
    }

    pub async fn forum_groups(&self, user_id: UserId) -> Vec<ForumGroup> {
        self.read(|doc| {
            doc.forum_groups
                .iter()
                .filter(|g| g.user_id == user_id)
                .cloned()
                .collect()
        })
        .await
    }

    /// Drop every selected group and forum of the user.
    pub async fn clear_selected_groups(&self, user_id: UserId) -> Result<()> {
        self.mutate(|doc| {
            doc.target_groups.retain(|g| g.user_id != user_id);
            doc.forum_groups.retain(|g| g.user_id != user_id);
        })
        .await
    }

    // ------------------------------------------------------------------
    // Dialog cache
    // ------------------------------------------------------------------

    /// Upsert `groups` into the user's cache keyed by group id (first entry
    /// of a batch wins). Entries not in the batch are kept.
    pub async fn save_groups_to_cache(&self, user_id: UserId, groups: Vec<CachedGroup>) -> Result<usize> {
        if groups.is_empty() {
            return Ok(0);
        }
        self.mutate(|doc| {
            let mut seen = HashSet::new();
            let mut saved = 0;
            for mut g in groups {
                if !seen.insert(g.group_id) {
                    continue;
                }
                g.user_id = user_id;
                match doc
                    .groups_cache
                    .iter_mut()
                    .find(|c| c.user_id == user_id && c.group_id == g.group_id)
                {
                    Some(existing) => *existing = g,
                    None => doc.groups_cache.push(g),
                }
                saved += 1;
            }
            saved
        })
        .await
    }

    /// Add only groups not already cached. Returns how many were added.
    pub async fn add_new_groups_to_cache(&self, user_id: UserId, groups: Vec<CachedGroup>) -> Result<usize> {
        self.mutate(|doc| {
            let mut known: HashSet<GroupId> = doc
                .groups_cache
                .iter()
                .filter(|g| g.user_id == user_id)
                .map(|g| g.group_id)
                .collect();
            let mut added = 0;
            for mut g in groups {
                if known.insert(g.group_id) {
                    g.user_id = user_id;
                    doc.groups_cache.push(g);
                    added += 1;
                }
            }
            added
        })
        .await
    }

    pub async fn cached_groups(&self, user_id: UserId) -> Vec<CachedGroup> {
        self.read(|doc| {
            doc.groups_cache
                .iter()
                .filter(|g| g.user_id == user_id)
                .cloned()
                .collect()
        })
        .await
    }

    /// Drop cached groups of the user whose id is not in `keep`.
    pub async fn prune_groups_cache(&self, user_id: UserId, keep: &HashSet<GroupId>) -> Result<usize> {
        self.mutate(|doc| {
            let before = doc.groups_cache.len();
            doc.groups_cache
                .retain(|g| g.user_id != user_id || keep.contains(&g.group_id));
            before - doc.groups_cache.len()
        })
        .await
    }

    pub async fn delete_groups_cache(&self, user_id: UserId) -> Result<()> {
        self.mutate(|doc| doc.groups_cache.retain(|g| g.user_id != user_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(group_id: GroupId, title: &str) -> CachedGroup {
        CachedGroup {
            user_id: 0,
            group_id,
            title: title.to_string(),
            username: None,
            kind: GroupKind::Supergroup,
            members_count: None,
            account_phone: "+1".into(),
            topics: Vec::new(),
            cached_at: 0,
        }
    }

    #[tokio::test]
    async fn test_add_target_group_idempotent_latest_title() {
        let store = Store::new_memory();
        store.add_target_group(1, -100, "Old").await.unwrap();
        store.add_target_group(1, -100, "New").await.unwrap();

        let groups = store.target_groups(1).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].title, "New");
    }

    #[tokio::test]
    async fn test_target_groups_scoped_by_user() {
        let store = Store::new_memory();
        store.add_target_group(1, -100, "A").await.unwrap();
        store.add_target_group(2, -100, "A").await.unwrap();
        assert!(store.remove_target_group(1, -100).await.unwrap());
        assert!(store.target_groups(1).await.is_empty());
        assert_eq!(store.target_groups(2).await.len(), 1);
    }

    #[tokio::test]
    async fn test_forum_group_upsert_replaces_topics() {
        let store = Store::new_memory();
        let t = |id| ForumTopic {
            id,
            title: format!("t{}", id),
            closed: false,
        };
        store.add_forum_group(1, -5, "F", vec![t(1)]).await.unwrap();
        store.add_forum_group(1, -5, "F2", vec![t(1), t(2)]).await.unwrap();

        let forums = store.forum_groups(1).await;
        assert_eq!(forums.len(), 1);
        assert_eq!(forums[0].title, "F2");
        assert_eq!(forums[0].topics.len(), 2);
        assert!(store.forum_group(1, -5).await.is_some());
    }

    #[tokio::test]
    async fn test_clear_selected_groups() {
        let store = Store::new_memory();
        store.add_target_group(1, -1, "A").await.unwrap();
        store.add_forum_group(1, -2, "F", vec![]).await.unwrap();
        store.clear_selected_groups(1).await.unwrap();
        assert!(store.target_groups(1).await.is_empty());
        assert!(store.forum_groups(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_save_cache_upserts_and_dedups() {
        let store = Store::new_memory();
        store.save_groups_to_cache(1, vec![cached(-1, "a")]).await.unwrap();
        let saved = store
            .save_groups_to_cache(1, vec![cached(-2, "b"), cached(-2, "dup"), cached(-1, "a2")])
            .await
            .unwrap();
        assert_eq!(saved, 2);

        let cache = store.cached_groups(1).await;
        let ids: Vec<GroupId> = cache.iter().map(|g| g.group_id).collect();
        assert_eq!(ids, vec![-1, -2]);
        assert_eq!(cache[0].title, "a2");
        assert_eq!(cache[1].title, "b");
        assert_eq!(cache[1].user_id, 1);
    }

    #[tokio::test]
    async fn test_save_empty_batch_keeps_cache() {
        let store = Store::new_memory();
        store.save_groups_to_cache(1, vec![cached(-1, "a")]).await.unwrap();
        assert_eq!(store.save_groups_to_cache(1, Vec::new()).await.unwrap(), 0);
        assert_eq!(store.cached_groups(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_new_groups_is_additive_only() {
        let store = Store::new_memory();
        store.save_groups_to_cache(1, vec![cached(-1, "a")]).await.unwrap();
        let added = store
            .add_new_groups_to_cache(1, vec![cached(-1, "renamed"), cached(-2, "b")])
            .await
            .unwrap();
        assert_eq!(added, 1);

        let cache = store.cached_groups(1).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache[0].title, "a");

        store.delete_groups_cache(1).await.unwrap();
        assert!(store.cached_groups(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_listed_and_other_users() {
        let store = Store::new_memory();
        store
            .save_groups_to_cache(1, vec![cached(-1, "a"), cached(-2, "b")])
            .await
            .unwrap();
        store.save_groups_to_cache(2, vec![cached(-1, "a")]).await.unwrap();
        let keep: HashSet<GroupId> = [-2].into_iter().collect();
        assert_eq!(store.prune_groups_cache(1, &keep).await.unwrap(), 1);
        assert_eq!(store.cached_groups(1).await[0].group_id, -2);
        assert_eq!(store.cached_groups(2).await.len(), 1);
    }
}
