//! In-memory Telegram backend for testing.
//!
//! Accounts are keyed by their session string. Every forward attempt is
//! recorded, and failures are scripted as raw error text that goes through
//! the same classifier as the bridge.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::errors::{classify_auth_error, classify_error_message};
use super::{
    AccountCredentials, ChatInfo, ClientFactory, Dialog, DialogKind, LoggedIn, LoginStep, Me,
    MessageRef, SavedMessage, TelegramClient,
};
use crate::error::{AuthError, SendError};
use crate::store::{ForumTopic, GroupId};

/// Scripted state of one account.
#[derive(Debug, Clone)]
pub struct MemoryAccount {
    pub me: Me,
    pub dialogs: Vec<Dialog>,
    pub topics: HashMap<GroupId, Vec<ForumTopic>>,
    pub chats: HashMap<GroupId, ChatInfo>,
    /// Newest first
    pub saved: Vec<SavedMessage>,
}

impl MemoryAccount {
    pub fn new(id: i64, phone: &str) -> Self {
        Self {
            me: Me {
                id,
                first_name: Some(format!("acc{}", id)),
                last_name: None,
                username: None,
                phone: Some(phone.to_string()),
            },
            dialogs: Vec::new(),
            topics: HashMap::new(),
            chats: HashMap::new(),
            saved: Vec::new(),
        }
    }

    /// Add a group the account is a member of and may post to.
    pub fn with_group(mut self, id: GroupId, title: &str, kind: DialogKind) -> Self {
        self.dialogs.push(Dialog {
            id,
            title: title.to_string(),
            username: None,
            kind,
            members_count: Some(100),
        });
        self.chats.insert(
            id,
            ChatInfo {
                id,
                title: title.to_string(),
                is_member: true,
                is_forum: kind == DialogKind::Forum,
                send_messages_banned: false,
            },
        );
        self
    }

    pub fn with_topics(mut self, group: GroupId, topics: Vec<ForumTopic>) -> Self {
        self.topics.insert(group, topics);
        self
    }

    /// Saved message ids, given newest first.
    pub fn with_saved(mut self, ids: &[i32]) -> Self {
        self.saved = ids
            .iter()
            .map(|&id| SavedMessage {
                id,
                date: i64::from(id),
            })
            .collect();
        self
    }
}

/// One recorded forward attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardAttempt {
    pub session: String,
    pub message: MessageRef,
    pub to: GroupId,
    pub topic: Option<i32>,
    pub ok: bool,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, MemoryAccount>,
    connect_errors: HashMap<String, String>,
    forward_errors: HashMap<(String, GroupId), String>,
    attempts: Vec<ForwardAttempt>,
    connects: usize,
    disconnects: usize,
    login: Option<ScriptedLogin>,
}

#[derive(Clone)]
struct ScriptedLogin {
    code: String,
    password: Option<String>,
    session: String,
    me: Me,
}

/// In-memory [`ClientFactory`].
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_account(&self, session: &str, account: MemoryAccount) {
        self.state().accounts.insert(session.to_string(), account);
    }

    /// Make `connect` fail for this session with the given error text.
    pub fn fail_connect(&self, session: &str, error: &str) {
        self.state()
            .connect_errors
            .insert(session.to_string(), error.to_string());
    }

    /// Make every forward from `session` to `group` fail with the given error text.
    pub fn fail_forward(&self, session: &str, group: GroupId, error: &str) {
        self.state()
            .forward_errors
            .insert((session.to_string(), group), error.to_string());
    }

    pub fn clear_forward_failure(&self, session: &str, group: GroupId) {
        self.state()
            .forward_errors
            .remove(&(session.to_string(), group));
    }

    pub fn attempts(&self) -> Vec<ForwardAttempt> {
        self.state().attempts.clone()
    }

    pub fn attempts_to(&self, group: GroupId) -> usize {
        self.state().attempts.iter().filter(|a| a.to == group).count()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// Script the login flow: `code` is accepted, `password` (when set) is
    /// then required, and the login yields `session`.
    pub fn script_login(&self, code: &str, password: Option<&str>, session: &str, me: Me) {
        self.state().login = Some(ScriptedLogin {
            code: code.to_string(),
            password: password.map(str::to_string),
            session: session.to_string(),
            me,
        });
    }

    fn scripted_login(&self) -> Result<ScriptedLogin, AuthError> {
        self.state()
            .login
            .clone()
            .ok_or_else(|| AuthError::Other("no login in progress".into()))
    }
}

#[async_trait]
impl ClientFactory for MemoryBackend {
    async fn connect(&self, creds: &AccountCredentials) -> Result<Arc<dyn TelegramClient>, SendError> {
        let mut state = self.state();
        if let Some(err) = state.connect_errors.get(&creds.session) {
            return Err(classify_error_message(err));
        }
        if !state.accounts.contains_key(&creds.session) {
            return Err(SendError::SessionInvalid("AUTH_KEY_UNREGISTERED".into()));
        }
        state.connects += 1;
        Ok(Arc::new(MemoryClient {
            backend: self.clone(),
            session: creds.session.clone(),
        }))
    }

    async fn request_code(&self, _api_id: i32, api_hash: &str, phone: &str) -> Result<String, AuthError> {
        if api_hash.is_empty() {
            return Err(classify_auth_error("API_ID_INVALID"));
        }
        if !phone.starts_with('+') {
            return Err(classify_auth_error("PHONE_NUMBER_INVALID"));
        }
        self.scripted_login()?;
        Ok(format!("login-{}", phone))
    }

    async fn submit_code(&self, _login_id: &str, code: &str) -> Result<LoginStep, AuthError> {
        let login = self.scripted_login()?;
        if code != login.code {
            return Err(classify_auth_error("PHONE_CODE_INVALID"));
        }
        if login.password.is_some() {
            return Ok(LoginStep::PasswordRequired);
        }
        Ok(LoginStep::Done(LoggedIn {
            session: login.session,
            me: login.me,
        }))
    }

    async fn submit_password(&self, _login_id: &str, password: &str) -> Result<LoggedIn, AuthError> {
        let login = self.scripted_login()?;
        if login.password.as_deref() != Some(password) {
            return Err(classify_auth_error("PASSWORD_HASH_INVALID"));
        }
        Ok(LoggedIn {
            session: login.session,
            me: login.me,
        })
    }
}

/// A client connected to the [`MemoryBackend`].
pub struct MemoryClient {
    backend: MemoryBackend,
    session: String,
}

impl MemoryClient {
    fn account(&self) -> Result<MemoryAccount, SendError> {
        self.backend
            .state()
            .accounts
            .get(&self.session)
            .cloned()
            .ok_or_else(|| SendError::SessionInvalid("AUTH_KEY_UNREGISTERED".into()))
    }
}

#[async_trait]
impl TelegramClient for MemoryClient {
    async fn me(&self) -> Result<Me, SendError> {
        Ok(self.account()?.me)
    }

    async fn dialogs(&self) -> Result<Vec<Dialog>, SendError> {
        Ok(self.account()?.dialogs)
    }

    async fn forum_topics(&self, chat: GroupId) -> Result<Vec<ForumTopic>, SendError> {
        Ok(self.account()?.topics.get(&chat).cloned().unwrap_or_default())
    }

    async fn chat_info(&self, chat: GroupId) -> Result<ChatInfo, SendError> {
        self.account()?
            .chats
            .get(&chat)
            .cloned()
            .ok_or_else(|| classify_error_message("CHANNEL_PRIVATE"))
    }

    async fn saved_messages(&self, limit: u32) -> Result<Vec<SavedMessage>, SendError> {
        let mut saved = self.account()?.saved;
        saved.truncate(limit as usize);
        Ok(saved)
    }

    async fn forward(
        &self,
        message: &MessageRef,
        to: GroupId,
        topic: Option<i32>,
    ) -> Result<(), SendError> {
        let mut state = self.backend.state();
        let failure = state
            .forward_errors
            .get(&(self.session.clone(), to))
            .cloned();
        state.attempts.push(ForwardAttempt {
            session: self.session.clone(),
            message: message.clone(),
            to,
            topic,
            ok: failure.is_none(),
        });
        match failure {
            Some(err) => Err(classify_error_message(&err)),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) {
        self.backend.state().disconnects += 1;
    }
}
