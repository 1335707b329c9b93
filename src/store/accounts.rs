//! Logged-in Telegram accounts.

use tracing::info;
use uuid::Uuid;

use super::models::*;
use super::Store;
use crate::error::Result;
use crate::utils::time::now_ts;

impl Store {
    /// Add an account for the user, re-using the record if the phone is
    /// already registered. Returns `None` when the user's quota is full.
    pub async fn add_account(&self, user_id: UserId, new: NewAccount) -> Result<Option<Account>> {
        let added = self
            .mutate(|doc| {
                let limit = doc
                    .users
                    .get(&user_id)
                    .map(|u| u.accounts_limit)
                    .unwrap_or(1) as usize;

                if let Some(existing) = doc
                    .accounts
                    .iter_mut()
                    .find(|a| a.user_id == user_id && a.phone_number == new.phone_number)
                {
                    existing.session_sealed = new.session_sealed;
                    existing.api_id = new.api_id;
                    existing.api_hash_sealed = new.api_hash_sealed;
                    existing.first_name = new.first_name;
                    existing.last_name = new.last_name;
                    existing.is_active = true;
                    return Some(existing.clone());
                }

                let count = doc.accounts.iter().filter(|a| a.user_id == user_id).count();
                if count >= limit {
                    return None;
                }

                let account = Account {
                    id: Uuid::new_v4().to_string(),
                    user_id,
                    phone_number: new.phone_number,
                    first_name: new.first_name,
                    last_name: new.last_name,
                    session_sealed: new.session_sealed,
                    api_id: new.api_id,
                    api_hash_sealed: new.api_hash_sealed,
                    is_active: true,
                    created_at: now_ts(),
                };
                doc.accounts.push(account.clone());
                Some(account)
            })
            .await?;

        if let Some(account) = &added {
            info!(user_id, phone = %mask_phone(&account.phone_number), "Account stored");
        }
        Ok(added)
    }

    pub async fn accounts(&self, user_id: UserId) -> Vec<Account> {
        self.read(|doc| {
            doc.accounts
                .iter()
                .filter(|a| a.user_id == user_id)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn active_accounts(&self, user_id: UserId) -> Vec<Account> {
        self.read(|doc| {
            doc.accounts
                .iter()
                .filter(|a| a.user_id == user_id && a.is_active)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn account_count(&self, user_id: UserId) -> usize {
        self.read(|doc| doc.accounts.iter().filter(|a| a.user_id == user_id).count())
            .await
    }

    pub async fn all_accounts_count(&self) -> usize {
        self.read(|doc| doc.accounts.len()).await
    }

    /// Mark an account unusable (revoked session, undecryptable secret).
    pub async fn deactivate_account(&self, user_id: UserId, account_id: &str) -> Result<bool> {
        self.mutate(|doc| {
            match doc
                .accounts
                .iter_mut()
                .find(|a| a.user_id == user_id && a.id == account_id)
            {
                Some(a) => {
                    a.is_active = false;
                    true
                }
                None => false,
            }
        })
        .await
    }

    pub async fn delete_account(&self, user_id: UserId, account_id: &str) -> Result<bool> {
        self.mutate(|doc| {
            let before = doc.accounts.len();
            doc.accounts
                .retain(|a| !(a.user_id == user_id && a.id == account_id));
            doc.accounts.len() < before
        })
        .await
    }

    pub async fn delete_all_accounts(&self, user_id: UserId) -> Result<usize> {
        self.mutate(|doc| {
            let before = doc.accounts.len();
            doc.accounts.retain(|a| a.user_id != user_id);
            before - doc.accounts.len()
        })
        .await
    }
}

/// `+1555****0123` style masking for logs.
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() <= 6 {
        return "*".repeat(chars.len());
    }
    let head: String = chars.iter().take(4).collect();
    let tail: String = chars.iter().skip(chars.len() - 4).collect();
    format!("{}****{}", head, tail)
}
