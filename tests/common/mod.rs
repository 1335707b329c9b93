//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use adcaster::analyzer::Target;
use adcaster::broadcast::{BroadcastSupervisor, EngineAccount, EngineConfig, WorkingSet};
use adcaster::relay::{DeliveryError, DmSender, LogRelay};
use adcaster::store::{GroupId, NewAccount, Store, UserId};
use adcaster::telegram::{AccountCredentials, ClientFactory, MemoryAccount, MemoryBackend};
use adcaster::vault::Vault;

pub const USER: UserId = 1;
pub const SESSION: &str = "sess-1";
pub const PHONE: &str = "+15550001";

/// A [`DmSender`] that keeps every message it is asked to deliver.
#[derive(Clone, Default)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<(i64, String)>>>,
}

impl RecordingSender {
    pub fn messages(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts_to(&self, chat_id: i64) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(id, _)| *id == chat_id)
            .map(|(_, text)| text)
            .collect()
    }
}

#[async_trait]
impl DmSender for RecordingSender {
    async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }

    async fn ping(&self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

pub struct Harness {
    pub store: Store,
    pub vault: Arc<Vault>,
    pub backend: MemoryBackend,
    pub sender: RecordingSender,
    pub relay: LogRelay,
}

impl Harness {
    /// User [`USER`] with the logger started and no accounts yet.
    pub async fn new() -> Self {
        let store = Store::new_memory();
        store
            .create_user(USER, Some("ann".into()), Some("Ann".into()))
            .await
            .unwrap();
        store.set_logger_status(USER, true).await.unwrap();
        let sender = RecordingSender::default();
        let relay = LogRelay::new(store.clone(), Arc::new(sender.clone()) as Arc<dyn DmSender>);
        Self {
            store,
            vault: Arc::new(Vault::from_key(&[9u8; 32]).unwrap()),
            backend: MemoryBackend::new(),
            sender,
            relay,
        }
    }

    /// Register `account` under [`SESSION`] and store it for [`USER`].
    pub async fn link(&self, account: MemoryAccount) -> String {
        self.backend.add_account(SESSION, account);
        let stored = self
            .store
            .add_account(
                USER,
                NewAccount {
                    phone_number: PHONE.into(),
                    first_name: None,
                    last_name: None,
                    session_sealed: self.vault.encrypt(SESSION).unwrap(),
                    api_id: 1,
                    api_hash_sealed: self.vault.encrypt("hash").unwrap(),
                },
            )
            .await
            .unwrap()
            .unwrap();
        stored.id
    }

    pub fn supervisor(&self) -> BroadcastSupervisor {
        BroadcastSupervisor::with_engine_config(
            self.store.clone(),
            self.vault.clone(),
            Arc::new(self.backend.clone()),
            self.relay.clone(),
            EngineConfig::default(),
            vec![],
        )
    }

    /// A connected engine account that sends to `targets`.
    pub async fn engine_account(&self, account_id: &str, targets: Vec<Target>) -> EngineAccount {
        let client = self
            .backend
            .connect(&AccountCredentials {
                phone: PHONE.into(),
                api_id: 1,
                api_hash: "hash".into(),
                session: SESSION.into(),
            })
            .await
            .unwrap();
        EngineAccount {
            account_id: account_id.to_string(),
            phone: PHONE.into(),
            client,
            working_set: WorkingSet::new(targets),
        }
    }
}

pub fn group(id: GroupId, title: &str) -> Target {
    Target {
        group_id: id,
        title: title.to_string(),
        is_forum: false,
        topics: Vec::new(),
    }
}
