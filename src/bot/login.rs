//! Phone login: API id → API hash → phone → code → optional 2FA password.
//!
//! The pending login (bridge login id, phone, API id, request time) lives in
//! temp data between steps. Any failure clears it and resets the
//! conversation, except rejected API credentials, which are purged and asked
//! for again.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::conversation::{normalize_otp, parse_api_hash, parse_api_id, parse_phone};
use super::{keyboards, BotContext, Reply};
use crate::error::{AuthError, Result};
use crate::log_component;
use crate::store::{mask_phone, ApiCredentials, ConversationState, NewAccount, UserId};
use crate::telegram::{LoggedIn, LoginStep};
use crate::utils::time::now_ts;

const PENDING_LOGIN: &str = "pending_login";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingLogin {
    login_id: String,
    phone: String,
    requested_at: i64,
}

/// API credentials in usable form.
struct ApiPair {
    api_id: i32,
    api_hash: String,
    api_hash_sealed: String,
}

impl BotContext {
    /// Entry point of the "Add Account" button.
    pub async fn begin_login(&self, user_id: UserId) -> Result<Reply> {
        let (_, limit) = self.store.user_status(user_id).await;
        if self.store.account_count(user_id).await >= limit as usize {
            return Ok(Reply::text(format!(
                "❌ Account limit reached ({}). Delete an account first.",
                limit
            )));
        }
        self.store.delete_temp(user_id, Some(PENDING_LOGIN)).await?;

        if self.api_pair(user_id).await?.is_some() {
            self.store
                .set_conversation_state(user_id, ConversationState::AwaitingPhone)
                .await?;
            return Ok(Reply::text(
                "📱 <b>Add Account</b>\n\nSend the phone number with country code, \
                 e.g. <code>+919876543210</code>.\n\n/cancel to abort.",
            ));
        }
        self.store
            .set_conversation_state(user_id, ConversationState::AwaitingApiId)
            .await?;
        Ok(Reply::text(
            "🔑 <b>API Credentials</b>\n\nGet them at https://my.telegram.org → API development tools.\n\n\
             Send your <b>API ID</b>.\n\n/cancel to abort.",
        ))
    }

    pub async fn submit_api_id(&self, user_id: UserId, input: &str) -> Result<Reply> {
        let api_id = match parse_api_id(input) {
            Ok(id) => id,
            Err(msg) => return Ok(Reply::text(format!("❌ {}", msg))),
        };
        self.store
            .set_conversation_state(user_id, ConversationState::AwaitingApiHash { api_id })
            .await?;
        Ok(Reply::text("✅ API ID saved. Now send your <b>API hash</b>."))
    }

    pub async fn submit_api_hash(&self, user_id: UserId, api_id: i32, input: &str) -> Result<Reply> {
        let api_hash = match parse_api_hash(input) {
            Ok(hash) => hash,
            Err(msg) => return Ok(Reply::text(format!("❌ {}", msg))),
        };
        self.store
            .store_api_credentials(
                user_id,
                ApiCredentials {
                    api_id,
                    api_hash_sealed: self.vault.encrypt(&api_hash)?,
                },
            )
            .await?;
        self.store
            .set_conversation_state(user_id, ConversationState::AwaitingPhone)
            .await?;
        Ok(Reply::text(
            "✅ Credentials saved.\n\nSend the phone number with country code, \
             e.g. <code>+919876543210</code>.",
        ))
    }

    pub async fn submit_phone(&self, user_id: UserId, input: &str) -> Result<Reply> {
        let phone = match parse_phone(input) {
            Ok(p) => p,
            Err(msg) => return Ok(Reply::text(format!("❌ {}", msg))),
        };
        let Some(api) = self.api_pair(user_id).await? else {
            return self.ask_api_credentials_again(user_id).await;
        };

        match self
            .factory
            .request_code(api.api_id, &api.api_hash, &phone)
            .await
        {
            Ok(login_id) => {
                let pending = PendingLogin {
                    login_id,
                    phone: phone.clone(),
                    requested_at: now_ts(),
                };
                self.store
                    .set_temp(user_id, PENDING_LOGIN, serde_json::to_value(&pending)?)
                    .await?;
                self.store
                    .set_conversation_state(user_id, ConversationState::AwaitingOtp { phone })
                    .await?;
                let len = self.config.features.otp_length;
                let example: String = (1..=len).map(|d| format!("{} ", d % 10)).collect();
                Ok(Reply::text(format!(
                    "📨 Code sent to your Telegram app.\n\nSend it with spaces between digits, \
                     e.g. <code>{}</code>",
                    example.trim_end()
                )))
            }
            Err(AuthError::InvalidApiCredentials) => self.ask_api_credentials_again(user_id).await,
            Err(e) => self.abort(user_id, &e).await,
        }
    }

    pub async fn submit_otp(&self, user_id: UserId, input: &str) -> Result<Reply> {
        let Some(pending) = self.pending_login(user_id).await else {
            return self.abort(user_id, &AuthError::CodeExpired).await;
        };
        if now_ts() - pending.requested_at > self.config.features.otp_expiry_secs as i64 {
            return self.abort(user_id, &AuthError::CodeExpired).await;
        }
        let Some(code) = normalize_otp(input, self.config.features.otp_length) else {
            return Ok(Reply::text(format!(
                "❌ Send the {}-digit code with spaces, e.g. <code>1 2 3 4 5</code>.",
                self.config.features.otp_length
            )));
        };

        match self.factory.submit_code(&pending.login_id, &code).await {
            Ok(LoginStep::Done(logged_in)) => self.finish(user_id, &pending.phone, logged_in).await,
            Ok(LoginStep::PasswordRequired) => {
                self.store
                    .set_conversation_state(
                        user_id,
                        ConversationState::AwaitingPassword {
                            phone: pending.phone,
                        },
                    )
                    .await?;
                Ok(Reply::text("🔐 Two-step verification is on. Send your password."))
            }
            Err(AuthError::InvalidCode) => Ok(Reply::text("❌ Wrong code, try again.")),
            Err(e) => self.abort(user_id, &e).await,
        }
    }

    pub async fn submit_password(&self, user_id: UserId, input: &str) -> Result<Reply> {
        let Some(pending) = self.pending_login(user_id).await else {
            return self.abort(user_id, &AuthError::CodeExpired).await;
        };
        match self
            .factory
            .submit_password(&pending.login_id, input.trim())
            .await
        {
            Ok(logged_in) => self.finish(user_id, &pending.phone, logged_in).await,
            Err(AuthError::InvalidPassword) => Ok(Reply::text("❌ Wrong password, try again.")),
            Err(e) => self.abort(user_id, &e).await,
        }
    }

    async fn finish(&self, user_id: UserId, phone: &str, logged_in: LoggedIn) -> Result<Reply> {
        let Some(api) = self.api_pair(user_id).await? else {
            return self.ask_api_credentials_again(user_id).await;
        };
        let new = NewAccount {
            phone_number: logged_in.me.phone.clone().unwrap_or_else(|| phone.to_string()),
            first_name: logged_in.me.first_name.clone(),
            last_name: logged_in.me.last_name.clone(),
            session_sealed: self.vault.encrypt(&logged_in.session)?,
            api_id: api.api_id,
            api_hash_sealed: api.api_hash_sealed,
        };
        let added = self.store.add_account(user_id, new).await?;
        self.store.delete_temp(user_id, Some(PENDING_LOGIN)).await?;
        self.store
            .set_conversation_state(user_id, ConversationState::Idle)
            .await?;

        let Some(account) = added else {
            return Ok(Reply::text("❌ Account limit reached. Delete an account first."));
        };
        log_component!(info, "bot", "Account linked", user_id = user_id);
        info!(user_id, phone = %mask_phone(&account.phone_number), "Account login complete");

        let cache = self.cache.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.refresh(user_id).await {
                warn!(user_id, "Group cache refresh after login failed: {}", e);
            }
        });

        Ok(Reply::with_keyboard(
            format!(
                "✅ <b>Account added</b>\n\n{} is ready. Loading your groups in the background...",
                mask_phone(&account.phone_number)
            ),
            keyboards::back_to_main(),
        ))
    }

    async fn abort(&self, user_id: UserId, err: &AuthError) -> Result<Reply> {
        warn!(user_id, "Login aborted: {}", err);
        self.store.delete_temp(user_id, Some(PENDING_LOGIN)).await?;
        self.store
            .set_conversation_state(user_id, ConversationState::Idle)
            .await?;
        Ok(Reply::with_keyboard(
            format!("❌ {}\n\nStart again from Accounts → Add Account.", err),
            keyboards::back_to_main(),
        ))
    }

    async fn ask_api_credentials_again(&self, user_id: UserId) -> Result<Reply> {
        self.store.clear_api_credentials(user_id).await?;
        self.store.delete_temp(user_id, Some(PENDING_LOGIN)).await?;
        self.store
            .set_conversation_state(user_id, ConversationState::AwaitingApiId)
            .await?;
        Ok(Reply::text(
            "❌ Telegram rejected the API ID / API hash. They were removed.\n\n\
             Send your <b>API ID</b> again.",
        ))
    }

    async fn pending_login(&self, user_id: UserId) -> Option<PendingLogin> {
        let value = self.store.get_temp(user_id, PENDING_LOGIN).await?;
        serde_json::from_value(value).ok()
    }

    /// The user's own credentials, else the bot-wide defaults.
    async fn api_pair(&self, user_id: UserId) -> Result<Option<ApiPair>> {
        if let Some(creds) = self.store.api_credentials(user_id).await {
            match self.vault.decrypt(&creds.api_hash_sealed) {
                Ok(api_hash) => {
                    return Ok(Some(ApiPair {
                        api_id: creds.api_id,
                        api_hash,
                        api_hash_sealed: creds.api_hash_sealed,
                    }))
                }
                Err(e) => {
                    warn!(user_id, "Stored API hash unreadable, discarding: {}", e);
                    self.store.clear_api_credentials(user_id).await?;
                }
            }
        }
        let bot = &self.config.bot;
        if bot.api_id > 0 && !bot.api_hash.is_empty() {
            return Ok(Some(ApiPair {
                api_id: bot.api_id,
                api_hash: bot.api_hash.clone(),
                api_hash_sealed: self.vault.encrypt(&bot.api_hash)?,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use crate::bot::tests::context;
    use crate::store::ConversationState;
    use crate::telegram::Me;

    fn me() -> Me {
        Me {
            id: 77,
            first_name: Some("Ann".into()),
            last_name: None,
            username: None,
            phone: Some("+15550009".into()),
        }
    }

    #[tokio::test]
    async fn test_full_login_with_password() {
        let (ctx, backend) = context().await;
        backend.script_login("12345", Some("hunter2"), "sess-77", me());

        ctx.begin_login(1).await.unwrap();
        assert_eq!(ctx.store.conversation_state(1).await, ConversationState::AwaitingApiId);
        ctx.submit_api_id(1, "1234").await.unwrap();
        ctx.submit_api_hash(1, 1234, "0123456789abcdef0123456789abcdef")
            .await
            .unwrap();
        ctx.submit_phone(1, "+15550009").await.unwrap();
        assert!(matches!(
            ctx.store.conversation_state(1).await,
            ConversationState::AwaitingOtp { .. }
        ));

        ctx.submit_otp(1, "1 2 3 4 5").await.unwrap();
        assert!(matches!(
            ctx.store.conversation_state(1).await,
            ConversationState::AwaitingPassword { .. }
        ));
        let reply = ctx.submit_password(1, "hunter2").await.unwrap();
        assert!(reply.text.contains("Account added"));

        let accounts = ctx.store.accounts(1).await;
        assert_eq!(accounts.len(), 1);
        assert_eq!(ctx.vault.decrypt(&accounts[0].session_sealed).unwrap(), "sess-77");
        assert_eq!(ctx.store.conversation_state(1).await, ConversationState::Idle);
        assert!(ctx.store.get_temp(1, super::PENDING_LOGIN).await.is_none());
    }

    #[tokio::test]
    async fn test_wrong_code_keeps_flow_and_bad_input_rejected() {
        let (ctx, backend) = context().await;
        backend.script_login("12345", None, "sess", me());
        ctx.begin_login(1).await.unwrap();
        ctx.submit_api_id(1, "1").await.unwrap();
        ctx.submit_api_hash(1, 1, "0123456789abcdef0123456789abcdef")
            .await
            .unwrap();
        ctx.submit_phone(1, "+15550009").await.unwrap();

        let reply = ctx.submit_otp(1, "99").await.unwrap();
        assert!(reply.text.contains("5-digit"));
        let reply = ctx.submit_otp(1, "5 4 3 2 1").await.unwrap();
        assert!(reply.text.contains("Wrong code"));
        let reply = ctx.submit_otp(1, "12345").await.unwrap();
        assert!(reply.text.contains("Account added"));
    }

    #[tokio::test]
    async fn test_missing_pending_login_resets() {
        let (ctx, _) = context().await;
        ctx.store
            .set_conversation_state(1, ConversationState::AwaitingOtp { phone: "+1".into() })
            .await
            .unwrap();
        let reply = ctx.submit_otp(1, "12345").await.unwrap();
        assert!(reply.text.contains("expired"));
        assert_eq!(ctx.store.conversation_state(1).await, ConversationState::Idle);
    }
}
