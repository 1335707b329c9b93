//! User profile, settings and rotation pointer.

use tracing::debug;

use super::models::*;
use super::Store;
use crate::error::{AdError, Result};
use crate::utils::time::now_ts;

impl Store {
    /// Create the user if missing, otherwise refresh name fields and
    /// last-interaction time. Returns the stored record.
    pub async fn create_user(
        &self,
        user_id: UserId,
        username: Option<String>,
        first_name: Option<String>,
    ) -> Result<User> {
        self.mutate(|doc| {
            let user = doc
                .users
                .entry(user_id)
                .or_insert_with(|| User::new(user_id, None, None));
            if username.is_some() {
                user.username = username;
            }
            if first_name.is_some() {
                user.first_name = first_name;
            }
            user.last_interaction = now_ts();
            user.clone()
        })
        .await
    }

    pub async fn get_user(&self, user_id: UserId) -> Option<User> {
        self.read(|doc| doc.users.get(&user_id).cloned()).await
    }

    pub async fn all_users(&self) -> Vec<User> {
        self.read(|doc| doc.users.values().cloned().collect()).await
    }

    /// Users in id order, `limit` per page starting at page 0. A zero
    /// `limit` returns everyone.
    pub async fn users_page(&self, page: usize, limit: usize) -> Vec<User> {
        if limit == 0 {
            return self.all_users().await;
        }
        self.read(|doc| {
            doc.users
                .values()
                .skip(page.saturating_mul(limit))
                .take(limit)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn user_ids(&self) -> Vec<UserId> {
        self.read(|doc| doc.users.keys().copied().collect()).await
    }

    /// Apply `f` to an existing user.
    async fn update_user<T>(
        &self,
        user_id: UserId,
        f: impl FnOnce(&mut User) -> T,
    ) -> Result<T> {
        self.mutate(|doc| match doc.users.get_mut(&user_id) {
            Some(user) => Ok(f(user)),
            None => Err(AdError::NotFound(format!("user {}", user_id))),
        })
        .await?
    }

    pub async fn touch_user(&self, user_id: UserId) -> Result<()> {
        self.update_user(user_id, |u| u.last_interaction = now_ts())
            .await
    }

    // ------------------------------------------------------------------
    // Conversation state
    // ------------------------------------------------------------------

    pub async fn conversation_state(&self, user_id: UserId) -> ConversationState {
        self.read(|doc| {
            doc.users
                .get(&user_id)
                .map(|u| u.state.clone())
                .unwrap_or_default()
        })
        .await
    }

    pub async fn set_conversation_state(
        &self,
        user_id: UserId,
        state: ConversationState,
    ) -> Result<()> {
        debug!(user_id, ?state, "Conversation state");
        self.update_user(user_id, |u| u.state = state).await
    }

    // ------------------------------------------------------------------
    // Tier
    // ------------------------------------------------------------------

    /// `(user_type, accounts_limit)`; free with one account when unknown.
    pub async fn user_status(&self, user_id: UserId) -> (UserType, u32) {
        self.read(|doc| {
            doc.users
                .get(&user_id)
                .map(|u| (u.user_type, u.accounts_limit))
                .unwrap_or((UserType::Free, 1))
        })
        .await
    }

    pub async fn set_user_status(
        &self,
        user_id: UserId,
        user_type: UserType,
        accounts_limit: u32,
    ) -> Result<()> {
        self.update_user(user_id, |u| {
            u.user_type = user_type;
            u.accounts_limit = accounts_limit;
        })
        .await
    }

    // ------------------------------------------------------------------
    // Broadcast preferences
    // ------------------------------------------------------------------

    pub async fn broadcast_mode(&self, user_id: UserId) -> BroadcastMode {
        self.read(|doc| {
            doc.users
                .get(&user_id)
                .map(|u| u.broadcast_mode)
                .unwrap_or_default()
        })
        .await
    }

    pub async fn set_broadcast_mode(&self, user_id: UserId, mode: BroadcastMode) -> Result<()> {
        self.update_user(user_id, |u| {
            u.broadcast_mode = mode;
            u.forum_only = mode == BroadcastMode::ForumsOnly;
        })
        .await
    }

    pub async fn set_forum_only(&self, user_id: UserId, forum_only: bool) -> Result<()> {
        self.update_user(user_id, |u| {
            u.forum_only = forum_only;
            if forum_only {
                u.broadcast_mode = BroadcastMode::ForumsOnly;
            } else if u.broadcast_mode == BroadcastMode::ForumsOnly {
                u.broadcast_mode = BroadcastMode::Both;
            }
        })
        .await
    }

    pub async fn message_source(&self, user_id: UserId) -> MessageSource {
        self.read(|doc| {
            doc.users
                .get(&user_id)
                .map(|u| u.message_source)
                .unwrap_or_default()
        })
        .await
    }

    pub async fn post_link(&self, user_id: UserId) -> Option<PostLink> {
        self.read(|doc| doc.users.get(&user_id).and_then(|u| u.post_link.clone()))
            .await
    }

    /// Switch the user to forwarding a fixed post.
    pub async fn set_post_link(&self, user_id: UserId, link: PostLink) -> Result<()> {
        self.update_user(user_id, |u| {
            u.post_link = Some(link);
            u.message_source = MessageSource::PostLink;
        })
        .await
    }

    /// Switch back to saved messages.
    pub async fn clear_post_link(&self, user_id: UserId) -> Result<()> {
        self.update_user(user_id, |u| {
            u.post_link = None;
            u.message_source = MessageSource::SavedMessages;
        })
        .await
    }

    /// Number of saved messages rotated through. Non-positive or unset values
    /// read as the configured default.
    pub async fn saved_messages_count(&self, user_id: UserId) -> u32 {
        let default = self.defaults().saved_messages;
        self.read(|doc| {
            match doc.users.get(&user_id).and_then(|u| u.saved_messages_count) {
                Some(n) if n > 0 => u32::try_from(n).unwrap_or(default),
                _ => default,
            }
        })
        .await
    }

    pub async fn set_saved_messages_count(&self, user_id: UserId, count: i64) -> Result<()> {
        self.update_user(user_id, |u| u.saved_messages_count = Some(count))
            .await
    }

    /// Register an ad by message id. `Ok(false)` when
    /// [`MAX_SAVED_ADS`] are already stored.
    pub async fn add_saved_message(&self, user_id: UserId, message_id: i32, text: &str) -> Result<bool> {
        let added = self
            .update_user(user_id, |u| {
                if u.saved_messages.len() >= MAX_SAVED_ADS {
                    return false;
                }
                u.saved_messages.push(SavedAd {
                    message_id,
                    text: text.to_string(),
                    added_at: now_ts(),
                });
                true
            })
            .await?;
        if !added {
            debug!(user_id, "Saved ad list full");
        }
        Ok(added)
    }

    pub async fn saved_messages(&self, user_id: UserId) -> Vec<SavedAd> {
        self.read(|doc| {
            doc.users
                .get(&user_id)
                .map(|u| u.saved_messages.clone())
                .unwrap_or_default()
        })
        .await
    }

    /// Drop every registered ad. Returns whether there were any.
    pub async fn clear_saved_messages(&self, user_id: UserId) -> Result<bool> {
        self.mutate(|doc| match doc.users.get_mut(&user_id) {
            Some(u) if !u.saved_messages.is_empty() => {
                u.saved_messages.clear();
                true
            }
            _ => false,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Vouch
    // ------------------------------------------------------------------

    pub async fn has_vouch_sent(&self, user_id: UserId) -> bool {
        self.read(|doc| doc.users.get(&user_id).is_some_and(|u| u.has_joined_vouch))
            .await
    }

    pub async fn set_vouch_sent(&self, user_id: UserId) -> Result<()> {
        self.update_user(user_id, |u| u.has_joined_vouch = true).await
    }

    // ------------------------------------------------------------------
    // Rotation
    // ------------------------------------------------------------------

    pub async fn current_rotation(&self, user_id: UserId) -> u32 {
        self.read(|doc| {
            doc.users
                .get(&user_id)
                .map(|u| u.ad_cycle_index)
                .unwrap_or(0)
        })
        .await
    }

    /// Advance the rotation pointer to `(current + 1) mod count`.
    pub async fn advance_rotation(&self, user_id: UserId, count: u32) -> Result<u32> {
        let count = count.max(1);
        self.update_user(user_id, |u| {
            u.ad_cycle_index = (u.ad_cycle_index % count + 1) % count;
            u.ad_cycle_index
        })
        .await
    }

    pub async fn reset_rotation(&self, user_id: UserId) -> Result<()> {
        self.update_user(user_id, |u| u.ad_cycle_index = 0).await
    }

    // ------------------------------------------------------------------
    // Schedule
    // ------------------------------------------------------------------

    pub async fn schedule(&self, user_id: UserId) -> Option<ScheduleWindow> {
        self.read(|doc| doc.users.get(&user_id).and_then(|u| u.schedule.clone()))
            .await
    }

    pub async fn set_schedule(
        &self,
        user_id: UserId,
        schedule: Option<ScheduleWindow>,
    ) -> Result<()> {
        self.update_user(user_id, |u| u.schedule = schedule).await
    }

    // ------------------------------------------------------------------
    // API credentials
    // ------------------------------------------------------------------

    /// Store the user's application credentials (hash already sealed).
    pub async fn store_api_credentials(
        &self,
        user_id: UserId,
        creds: ApiCredentials,
    ) -> Result<()> {
        self.update_user(user_id, |u| u.api_credentials = Some(creds))
            .await
    }

    pub async fn api_credentials(&self, user_id: UserId) -> Option<ApiCredentials> {
        self.read(|doc| {
            doc.users
                .get(&user_id)
                .and_then(|u| u.api_credentials.clone())
        })
        .await
    }

    pub async fn has_api_credentials(&self, user_id: UserId) -> bool {
        self.api_credentials(user_id).await.is_some()
    }

    pub async fn clear_api_credentials(&self, user_id: UserId) -> Result<()> {
        self.update_user(user_id, |u| u.api_credentials = None).await
    }

    // ------------------------------------------------------------------
    // Group search filter
    // ------------------------------------------------------------------

    pub async fn group_search_filter(&self, user_id: UserId) -> Option<String> {
        self.read(|doc| {
            doc.users
                .get(&user_id)
                .and_then(|u| u.group_search_filter.clone())
        })
        .await
    }

    pub async fn set_group_search_filter(&self, user_id: UserId, filter: &str) -> Result<()> {
        let filter = filter.trim().to_lowercase();
        self.update_user(user_id, |u| {
            u.group_search_filter = (!filter.is_empty()).then_some(filter)
        })
        .await
    }

    pub async fn clear_group_search_filter(&self, user_id: UserId) -> Result<()> {
        self.update_user(user_id, |u| u.group_search_filter = None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_user_is_upsert() {
        let store = Store::new_memory();
        store.create_user(1, Some("a".into()), None).await.unwrap();
        store.set_user_status(1, UserType::Premium, 5).await.unwrap();
        let user = store.create_user(1, None, Some("Ann".into())).await.unwrap();

        assert_eq!(user.username.as_deref(), Some("a"));
        assert_eq!(user.first_name.as_deref(), Some("Ann"));
        assert_eq!(user.accounts_limit, 5);
        assert_eq!(store.all_users().await.len(), 1);
    }

    #[tokio::test]
    async fn test_users_page_in_id_order() {
        let store = Store::new_memory();
        for id in [5, 1, 3, 2, 4] {
            store.create_user(id, None, None).await.unwrap();
        }
        let ids = |users: Vec<User>| users.iter().map(|u| u.user_id).collect::<Vec<_>>();
        assert_eq!(ids(store.users_page(0, 2).await), vec![1, 2]);
        assert_eq!(ids(store.users_page(2, 2).await), vec![5]);
        assert!(store.users_page(3, 2).await.is_empty());
        assert_eq!(store.users_page(7, 0).await.len(), 5);
    }

    #[tokio::test]
    async fn test_saved_ads_capped_at_three() {
        let store = Store::new_memory();
        store.create_user(1, None, None).await.unwrap();
        for id in 1..=3 {
            assert!(store.add_saved_message(1, id, "ad").await.unwrap());
        }
        assert!(!store.add_saved_message(1, 4, "extra").await.unwrap());
        let ids: Vec<i32> = store.saved_messages(1).await.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        assert!(store.clear_saved_messages(1).await.unwrap());
        assert!(!store.clear_saved_messages(1).await.unwrap());
        assert!(store.saved_messages(1).await.is_empty());
        assert!(store.add_saved_message(1, 9, "").await.unwrap());
    }

    #[tokio::test]
    async fn test_vouch_flag() {
        let store = Store::new_memory();
        assert!(!store.has_vouch_sent(1).await);
        store.create_user(1, None, None).await.unwrap();
        assert!(!store.has_vouch_sent(1).await);
        store.set_vouch_sent(1).await.unwrap();
        assert!(store.has_vouch_sent(1).await);
        assert!(matches!(
            store.set_vouch_sent(2).await.unwrap_err(),
            AdError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_update_missing_user_is_not_found() {
        let store = Store::new_memory();
        let err = store.touch_user(9).await.unwrap_err();
        assert!(matches!(err, AdError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_defaults_for_unknown_user() {
        let store = Store::new_memory();
        assert_eq!(store.conversation_state(3).await, ConversationState::Idle);
        assert_eq!(store.user_status(3).await, (UserType::Free, 1));
        assert_eq!(store.broadcast_mode(3).await, BroadcastMode::Both);
        assert_eq!(store.message_source(3).await, MessageSource::SavedMessages);
        assert_eq!(store.saved_messages_count(3).await, 3);
        assert_eq!(store.current_rotation(3).await, 0);
    }

    #[tokio::test]
    async fn test_saved_messages_count_non_positive_reads_default() {
        let store = Store::new_memory();
        store.create_user(1, None, None).await.unwrap();
        store.set_saved_messages_count(1, 0).await.unwrap();
        assert_eq!(store.saved_messages_count(1).await, 3);
        store.set_saved_messages_count(1, -4).await.unwrap();
        assert_eq!(store.saved_messages_count(1).await, 3);
        store.set_saved_messages_count(1, 7).await.unwrap();
        assert_eq!(store.saved_messages_count(1).await, 7);
    }

    #[tokio::test]
    async fn test_rotation_wraps_modulo_count() {
        let store = Store::new_memory();
        store.create_user(1, None, None).await.unwrap();
        for n in 1..=7u32 {
            let idx = store.advance_rotation(1, 3).await.unwrap();
            assert_eq!(idx, n % 3);
        }
        store.reset_rotation(1).await.unwrap();
        assert_eq!(store.current_rotation(1).await, 0);
    }

    #[tokio::test]
    async fn test_post_link_switches_source() {
        let store = Store::new_memory();
        store.create_user(1, None, None).await.unwrap();
        let link = PostLink {
            link: "https://t.me/deals/15".into(),
            from_peer: "deals".into(),
            message_id: 15,
        };
        store.set_post_link(1, link.clone()).await.unwrap();
        assert_eq!(store.message_source(1).await, MessageSource::PostLink);
        assert_eq!(store.post_link(1).await, Some(link));

        store.clear_post_link(1).await.unwrap();
        assert_eq!(store.message_source(1).await, MessageSource::SavedMessages);
        assert!(store.post_link(1).await.is_none());
    }

    #[tokio::test]
    async fn test_forum_only_tracks_mode() {
        let store = Store::new_memory();
        store.create_user(1, None, None).await.unwrap();
        store.set_forum_only(1, true).await.unwrap();
        assert_eq!(store.broadcast_mode(1).await, BroadcastMode::ForumsOnly);
        store.set_forum_only(1, false).await.unwrap();
        assert_eq!(store.broadcast_mode(1).await, BroadcastMode::Both);
    }

    #[tokio::test]
    async fn test_api_credentials_store_and_clear() {
        let store = Store::new_memory();
        store.create_user(1, None, None).await.unwrap();
        assert!(!store.has_api_credentials(1).await);
        store
            .store_api_credentials(
                1,
                ApiCredentials {
                    api_id: 123,
                    api_hash_sealed: "sealed".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(store.api_credentials(1).await.unwrap().api_id, 123);
        store.clear_api_credentials(1).await.unwrap();
        assert!(!store.has_api_credentials(1).await);
    }

    #[tokio::test]
    async fn test_group_search_filter_normalised() {
        let store = Store::new_memory();
        store.create_user(1, None, None).await.unwrap();
        store.set_group_search_filter(1, "  Crypto ").await.unwrap();
        assert_eq!(store.group_search_filter(1).await.as_deref(), Some("crypto"));
        store.set_group_search_filter(1, "   ").await.unwrap();
        assert!(store.group_search_filter(1).await.is_none());
    }
}
