//! MTProto bridge backend.
//!
//! User-account sessions live in an external bridge process that speaks
//! MTProto. adcaster talks to it over plain HTTP with JSON bodies. Sessions
//! are opaque strings owned by adcaster (sealed at rest in the store) and
//! handed to the bridge on connect.
//!
//! # Bridge Protocol (JSON over HTTP)
//!
//! Clients:
//! ```text
//! POST   /v1/clients                    {"api_id":1,"api_hash":"..","session":".."} -> {"client_id":"c1"}
//! GET    /v1/clients/{id}/me            -> {"id":42,"first_name":"..","username":"..","phone":".."}
//! GET    /v1/clients/{id}/dialogs       -> {"dialogs":[{"id":-100..,"title":"..","kind":"forum","members_count":10}]}
//! GET    /v1/clients/{id}/chats/{chat}  -> {"id":..,"title":"..","is_member":true,"is_forum":false,"send_messages_banned":false}
//! GET    /v1/clients/{id}/chats/{chat}/topics -> {"topics":[{"id":1,"title":"General","closed":false}]}
//! GET    /v1/clients/{id}/saved?limit=20 -> {"messages":[{"id":9,"date":1707900000}]}
//! POST   /v1/clients/{id}/forward       {"message":{"source":"saved","message_id":9},"to":-100..,"top_msg_id":null} -> {}
//! DELETE /v1/clients/{id}
//! ```
//!
//! Login:
//! ```text
//! POST /v1/login/code            {"api_id":1,"api_hash":"..","phone":"+1.."} -> {"login_id":"l1"}
//! POST /v1/login/{id}/code       {"code":"12345"} -> {"status":"done","session":"..","me":{..}} | {"status":"password_required"}
//! POST /v1/login/{id}/password   {"password":".."} -> {"status":"done","session":"..","me":{..}}
//! ```
//!
//! Failures come back with a non-2xx status and `{"error":"FLOOD_WAIT_30"}`;
//! the text is classified into [`SendError`] / [`AuthError`] right here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::errors::{classify_auth_error, classify_error_message};
use super::{
    AccountCredentials, ChatInfo, ClientFactory, Dialog, LoggedIn, LoginStep, Me, MessageRef,
    SavedMessage, TelegramClient,
};
use crate::config::BridgeConfig;
use crate::error::{AdError, AuthError, Result, SendError};
use crate::store::{ForumTopic, GroupId};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct CreatedClient {
    client_id: String,
}

#[derive(Debug, Deserialize)]
struct DialogList {
    #[serde(default)]
    dialogs: Vec<Dialog>,
}

#[derive(Debug, Deserialize)]
struct TopicList {
    #[serde(default)]
    topics: Vec<ForumTopic>,
}

#[derive(Debug, Deserialize)]
struct SavedList {
    #[serde(default)]
    messages: Vec<SavedMessage>,
}

#[derive(Debug, Deserialize)]
struct LoginStarted {
    login_id: String,
}

#[derive(Debug, Deserialize)]
struct LoginReply {
    status: String,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    me: Option<Me>,
}

#[derive(Debug, Serialize)]
struct ForwardRequest<'a> {
    message: &'a MessageRef,
    to: GroupId,
    top_msg_id: Option<i32>,
}

/// Empty success body; the bridge may send `{}` or nothing.
#[derive(Debug, Default, Deserialize)]
struct Ack {}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Send a request and decode the JSON body. Errors are the raw failure text,
/// ready for classification.
async fn call<T: DeserializeOwned + Default>(req: RequestBuilder) -> std::result::Result<T, String> {
    let resp = req.send().await.map_err(|e| {
        if e.is_timeout() {
            format!("bridge request timed out: {}", e)
        } else if e.is_connect() {
            format!("bridge connection failed: {}", e)
        } else {
            format!("bridge network error: {}", e)
        }
    })?;

    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| format!("bridge network error: {}", e))?;

    if !status.is_success() {
        return Err(match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => err.error,
            Err(_) => format!("bridge HTTP {}: {}", status.as_u16(), body.trim()),
        });
    }

    if body.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&body).map_err(|e| format!("invalid bridge response: {}", e))
}

fn send_err(msg: String) -> SendError {
    classify_error_message(&msg)
}

fn auth_err(msg: String) -> AuthError {
    classify_auth_error(&msg)
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Connects accounts and runs logins against the bridge.
pub struct BridgeClientFactory {
    http: Client,
    base_url: String,
}

impl BridgeClientFactory {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        let base_url = config.url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(AdError::Config("bridge.url is empty".into()));
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ClientFactory for BridgeClientFactory {
    async fn connect(
        &self,
        creds: &AccountCredentials,
    ) -> std::result::Result<Arc<dyn TelegramClient>, SendError> {
        let body = json!({
            "api_id": creds.api_id,
            "api_hash": creds.api_hash,
            "session": creds.session,
        });
        let created: CreatedClient =
            call_required(self.http.post(self.url("/v1/clients")).json(&body))
                .await
                .map_err(send_err)?;
        debug!(phone = %creds.phone, client_id = %created.client_id, "Bridge client connected");
        Ok(Arc::new(BridgeClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            client_id: created.client_id,
        }))
    }

    async fn request_code(
        &self,
        api_id: i32,
        api_hash: &str,
        phone: &str,
    ) -> std::result::Result<String, AuthError> {
        let body = json!({ "api_id": api_id, "api_hash": api_hash, "phone": phone });
        let started: LoginStarted =
            call_required(self.http.post(self.url("/v1/login/code")).json(&body))
                .await
                .map_err(auth_err)?;
        Ok(started.login_id)
    }

    async fn submit_code(
        &self,
        login_id: &str,
        code: &str,
    ) -> std::result::Result<LoginStep, AuthError> {
        let reply: LoginReply = call_required(
            self.http
                .post(self.url(&format!("/v1/login/{}/code", login_id)))
                .json(&json!({ "code": code })),
        )
        .await
        .map_err(auth_err)?;
        if reply.status == "password_required" {
            return Ok(LoginStep::PasswordRequired);
        }
        logged_in(reply).map(LoginStep::Done)
    }

    async fn submit_password(
        &self,
        login_id: &str,
        password: &str,
    ) -> std::result::Result<LoggedIn, AuthError> {
        let reply: LoginReply = call_required(
            self.http
                .post(self.url(&format!("/v1/login/{}/password", login_id)))
                .json(&json!({ "password": password })),
        )
        .await
        .map_err(auth_err)?;
        if reply.status == "password_required" {
            return Err(AuthError::InvalidPassword);
        }
        logged_in(reply)
    }
}

fn logged_in(reply: LoginReply) -> std::result::Result<LoggedIn, AuthError> {
    match (reply.status.as_str(), reply.session, reply.me) {
        ("done", Some(session), Some(me)) => Ok(LoggedIn { session, me }),
        (status, _, _) => Err(AuthError::Other(format!(
            "unexpected login reply from bridge: {}",
            status
        ))),
    }
}

/// Like [`call`] for bodies that have no sensible default.
async fn call_required<T: DeserializeOwned>(req: RequestBuilder) -> std::result::Result<T, String> {
    let value: serde_json::Value = call(req).await?;
    serde_json::from_value(value).map_err(|e| format!("invalid bridge response: {}", e))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One account connected through the bridge.
pub struct BridgeClient {
    http: Client,
    base_url: String,
    client_id: String,
}

impl BridgeClient {
    fn url(&self, path: &str) -> String {
        format!("{}/v1/clients/{}{}", self.base_url, self.client_id, path)
    }
}

#[async_trait]
impl TelegramClient for BridgeClient {
    async fn me(&self) -> std::result::Result<Me, SendError> {
        call_required(self.http.get(self.url("/me")))
            .await
            .map_err(send_err)
    }

    async fn dialogs(&self) -> std::result::Result<Vec<Dialog>, SendError> {
        let list: DialogList = call_required(self.http.get(self.url("/dialogs")))
            .await
            .map_err(send_err)?;
        Ok(list.dialogs)
    }

    async fn forum_topics(&self, chat: GroupId) -> std::result::Result<Vec<ForumTopic>, SendError> {
        let list: TopicList =
            call_required(self.http.get(self.url(&format!("/chats/{}/topics", chat))))
                .await
                .map_err(send_err)?;
        Ok(list.topics)
    }

    async fn chat_info(&self, chat: GroupId) -> std::result::Result<ChatInfo, SendError> {
        call_required(self.http.get(self.url(&format!("/chats/{}", chat))))
            .await
            .map_err(send_err)
    }

    async fn saved_messages(&self, limit: u32) -> std::result::Result<Vec<SavedMessage>, SendError> {
        let list: SavedList = call_required(
            self.http
                .get(self.url("/saved"))
                .query(&[("limit", limit)]),
        )
        .await
        .map_err(send_err)?;
        Ok(list.messages)
    }

    async fn forward(
        &self,
        message: &MessageRef,
        to: GroupId,
        topic: Option<i32>,
    ) -> std::result::Result<(), SendError> {
        let body = ForwardRequest {
            message,
            to,
            top_msg_id: topic,
        };
        let _: Ack = call(self.http.post(self.url("/forward")).json(&body))
            .await
            .map_err(send_err)?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Err(e) = call::<Ack>(self.http.delete(self.url(""))).await {
            debug!(client_id = %self.client_id, "Bridge disconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use serde_json::Value;
    use std::collections::HashMap;

    async fn spawn_bridge() -> BridgeClientFactory {
        let app = Router::new()
            .route(
                "/v1/clients",
                post(|Json(body): Json<Value>| async move {
                    if body["session"] == "revoked" {
                        (
                            StatusCode::UNAUTHORIZED,
                            Json(json!({"error": "AUTH_KEY_UNREGISTERED"})),
                        )
                    } else {
                        (StatusCode::OK, Json(json!({"client_id": "c1"})))
                    }
                }),
            )
            .route(
                "/v1/clients/{id}/dialogs",
                get(|| async {
                    Json(json!({"dialogs": [
                        {"id": -1001, "title": "Deals", "kind": "forum", "members_count": 40},
                        {"id": 7, "title": "Bob", "kind": "user"}
                    ]}))
                }),
            )
            .route(
                "/v1/clients/{id}/saved",
                get(|Query(q): Query<HashMap<String, u32>>| async move {
                    let n = q.get("limit").copied().unwrap_or(0);
                    let msgs: Vec<Value> = (0..n.min(2))
                        .map(|i| json!({"id": 10 - i as i32, "date": 0}))
                        .collect();
                    Json(json!({ "messages": msgs }))
                }),
            )
            .route(
                "/v1/clients/{id}/forward",
                post(|Json(body): Json<Value>| async move {
                    if body["to"] == -1002 {
                        (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": "FLOOD_WAIT_30"})),
                        )
                    } else {
                        (StatusCode::OK, Json(json!({})))
                    }
                }),
            )
            .route("/v1/clients/{id}", delete(|| async { StatusCode::NO_CONTENT }))
            .route(
                "/v1/login/code",
                post(|| async { Json(json!({"login_id": "l1"})) }),
            )
            .route(
                "/v1/login/{id}/code",
                post(|Path(_id): Path<String>, Json(body): Json<Value>| async move {
                    match body["code"].as_str() {
                        Some("11111") => (
                            StatusCode::OK,
                            Json(json!({"status": "password_required"})),
                        ),
                        Some("22222") => (
                            StatusCode::OK,
                            Json(json!({"status": "done", "session": "s", "me": {"id": 5}})),
                        ),
                        _ => (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": "PHONE_CODE_INVALID"})),
                        ),
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        BridgeClientFactory::new(&BridgeConfig {
            url: format!("http://{}/", addr),
            timeout_secs: 5,
        })
        .unwrap()
    }

    fn creds(session: &str) -> AccountCredentials {
        AccountCredentials {
            phone: "+15550001".into(),
            api_id: 1,
            api_hash: "h".into(),
            session: session.into(),
        }
    }

    #[test]
    fn test_rejects_empty_url() {
        let err = BridgeClientFactory::new(&BridgeConfig {
            url: "".into(),
            timeout_secs: 5,
        });
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_connect_and_list_dialogs() {
        let factory = spawn_bridge().await;
        assert!(!factory.base_url().ends_with('/'));
        let client = factory.connect(&creds("ok")).await.unwrap();
        let dialogs = client.dialogs().await.unwrap();
        assert_eq!(dialogs.len(), 2);
        assert_eq!(dialogs[0].kind, crate::telegram::DialogKind::Forum);
        assert_eq!(dialogs[0].members_count, Some(40));

        let saved = client.saved_messages(20).await.unwrap();
        assert_eq!(saved.len(), 2);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_classifies_revoked_session() {
        let factory = spawn_bridge().await;
        let err = factory.connect(&creds("revoked")).await.err().unwrap();
        assert!(matches!(err, SendError::SessionInvalid(_)));
    }

    #[tokio::test]
    async fn test_forward_error_is_classified() {
        let factory = spawn_bridge().await;
        let client = factory.connect(&creds("ok")).await.unwrap();
        let msg = MessageRef::Saved { message_id: 3 };
        client.forward(&msg, -1001, Some(4)).await.unwrap();
        let err = client.forward(&msg, -1002, None).await.unwrap_err();
        assert_eq!(err, SendError::RateLimited { wait_secs: 30 });
    }

    #[tokio::test]
    async fn test_login_flow() {
        let factory = spawn_bridge().await;
        let login = factory.request_code(1, "h", "+1").await.unwrap();
        assert_eq!(login, "l1");

        assert!(matches!(
            factory.submit_code(&login, "11111").await.unwrap(),
            LoginStep::PasswordRequired
        ));
        match factory.submit_code(&login, "22222").await.unwrap() {
            LoginStep::Done(done) => {
                assert_eq!(done.session, "s");
                assert_eq!(done.me.id, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            factory.submit_code(&login, "00000").await.unwrap_err(),
            AuthError::InvalidCode
        );
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_transient() {
        let factory = BridgeClientFactory::new(&BridgeConfig {
            url: "http://127.0.0.1:9".into(),
            timeout_secs: 2,
        })
        .unwrap();
        let err = factory.connect(&creds("ok")).await.err().unwrap();
        assert!(matches!(err, SendError::Transient(_)), "{:?}", err);
    }
}
