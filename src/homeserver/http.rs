use std::time::Duration;

use async_trait::async_trait;
use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::{HomeserverApi, MessagesPage, MinimalStateEvent, MinimalTimelineEvent};
use crate::{Error, Result};

/// Default `HomeserverApi` implementation: a thin reqwest wrapper around the
/// client-server API, authenticated as the appservice's sender user. Not a
/// general Matrix client SDK — just enough surface for enforcement, the ACL
/// compiler, and the evaluator's startup load.
pub struct ReqwestHomeserverApi {
    client: reqwest::Client,
    base_url: String,
    as_token: String,
    sender_localpart: String,
    server_name: String,
}

impl ReqwestHomeserverApi {
    pub fn new(base_url: String, as_token: String, sender_localpart: String, server_name: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url,
            as_token,
            sender_localpart,
            server_name,
        })
    }

    fn sender_mxid(&self) -> String {
        format!("@{}:{}", self.sender_localpart, self.server_name)
    }

    fn authed_url(&self, path: &str, as_user: Option<&str>) -> String {
        format!(
            "{}{}?access_token={}&user_id={}",
            self.base_url,
            path,
            self.as_token,
            urlencoding_minimal(as_user.unwrap_or(&self.sender_mxid()))
        )
    }

    async fn put(&self, path: &str, body: serde_json::Value) -> Result<()> {
        self.put_as(path, None, body).await
    }

    async fn put_as(&self, path: &str, as_user: Option<&str>, body: serde_json::Value) -> Result<()> {
        let url = self.authed_url(path, as_user);
        let resp = self.client.put(url).json(&body).send().await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), path, "homeserver request failed");
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.authed_url(path, None);
        Ok(self.client.get(url).send().await?)
    }
}

fn urlencoding_minimal(s: &str) -> String {
    s.replace(':', "%3A").replace('@', "%40").replace('!', "%21")
}

fn txn_id() -> String {
    format!("meowlnir-{}", crate::utils::millis_since_unix_epoch())
}

#[derive(Deserialize)]
struct StateEventWire {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    state_key: String,
    event_id: OwnedEventId,
    sender: OwnedUserId,
    #[serde(default)]
    origin_server_ts: u64,
    content: Box<serde_json::value::RawValue>,
}

#[derive(Deserialize)]
struct TimelineEventWire {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    state_key: Option<String>,
    event_id: OwnedEventId,
    sender: OwnedUserId,
    #[serde(default)]
    origin_server_ts: u64,
    content: Box<serde_json::value::RawValue>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    chunk: Vec<TimelineEventWire>,
    end: Option<String>,
}

#[derive(Deserialize)]
struct JoinedMembersResponse {
    joined: std::collections::HashMap<OwnedUserId, serde_json::Value>,
}

#[async_trait]
impl HomeserverApi for ReqwestHomeserverApi {
    async fn ban(&self, room_id: &OwnedRoomId, user_id: &OwnedUserId, reason: &str) -> Result<()> {
        self.put(
            &format!("/_matrix/client/v3/rooms/{room_id}/ban"),
            json!({ "user_id": user_id, "reason": reason }),
        )
        .await
    }

    async fn unban(&self, room_id: &OwnedRoomId, user_id: &OwnedUserId) -> Result<()> {
        self.put(
            &format!("/_matrix/client/v3/rooms/{room_id}/unban"),
            json!({ "user_id": user_id }),
        )
        .await
    }

    async fn kick(&self, room_id: &OwnedRoomId, user_id: &OwnedUserId, reason: &str) -> Result<()> {
        self.put(
            &format!("/_matrix/client/v3/rooms/{room_id}/kick"),
            json!({ "user_id": user_id, "reason": reason }),
        )
        .await
    }

    async fn redact_event(&self, room_id: &OwnedRoomId, event_id: &OwnedEventId, reason: &str) -> Result<()> {
        self.put(
            &format!("/_matrix/client/v3/rooms/{room_id}/redact/{event_id}/{}", txn_id()),
            json!({ "reason": reason }),
        )
        .await
    }

    async fn send_state_event(
        &self,
        room_id: &OwnedRoomId,
        event_type: &str,
        state_key: &str,
        content: serde_json::Value,
    ) -> Result<()> {
        self.put(
            &format!("/_matrix/client/v3/rooms/{room_id}/state/{event_type}/{state_key}"),
            content,
        )
        .await
    }

    async fn get_state_event(
        &self,
        room_id: &OwnedRoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let resp = self
            .get(&format!("/_matrix/client/v3/rooms/{room_id}/state/{event_type}/{state_key}"))
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::BadServerResponse("homeserver returned an error status"));
        }
        Ok(Some(resp.json().await?))
    }

    async fn room_state(&self, room_id: &OwnedRoomId) -> Result<Vec<MinimalStateEvent>> {
        let resp = self.get(&format!("/_matrix/client/v3/rooms/{room_id}/state")).await?;
        if !resp.status().is_success() {
            return Err(Error::BadServerResponse("homeserver returned an error status"));
        }
        let events: Vec<StateEventWire> = resp.json().await?;
        Ok(events
            .into_iter()
            .map(|e| MinimalStateEvent {
                event_type: e.event_type,
                state_key: e.state_key,
                event_id: e.event_id,
                sender: e.sender,
                origin_server_ts: e.origin_server_ts,
                content: e.content,
            })
            .collect())
    }

    async fn joined_members(&self, room_id: &OwnedRoomId) -> Result<Vec<OwnedUserId>> {
        let resp = self
            .get(&format!("/_matrix/client/v3/rooms/{room_id}/joined_members"))
            .await?;
        if !resp.status().is_success() {
            return Err(Error::BadServerResponse("homeserver returned an error status"));
        }
        let body: JoinedMembersResponse = resp.json().await?;
        Ok(body.joined.into_keys().collect())
    }

    async fn send_notice(&self, room_id: &OwnedRoomId, markdown_body: &str) -> Result<()> {
        self.put(
            &format!("/_matrix/client/v3/rooms/{room_id}/send/m.room.message/{}", txn_id()),
            json!({
                "msgtype": "m.notice",
                "body": markdown_body,
                "format": "org.matrix.custom.html",
                "formatted_body": markdown_body,
            }),
        )
        .await
    }

    async fn join_room(&self, room_id: &OwnedRoomId) -> Result<()> {
        self.put(&format!("/_matrix/client/v3/join/{room_id}"), json!({})).await
    }

    async fn leave_room_as(&self, room_id: &OwnedRoomId, user_id: &OwnedUserId) -> Result<()> {
        self.put_as(
            &format!("/_matrix/client/v3/rooms/{room_id}/leave"),
            Some(user_id.as_str()),
            json!({}),
        )
        .await
    }

    async fn messages_page(&self, room_id: &OwnedRoomId, from: Option<&str>) -> Result<MessagesPage> {
        let mut path = format!("/_matrix/client/v3/rooms/{room_id}/messages?dir=b&limit=50");
        if let Some(from) = from {
            path.push_str("&from=");
            path.push_str(from);
        }
        let resp = self.get(&path).await?;
        if !resp.status().is_success() {
            return Err(Error::BadServerResponse("homeserver returned an error status"));
        }
        let body: MessagesResponse = resp.json().await?;
        Ok(MessagesPage {
            events: body
                .chunk
                .into_iter()
                .map(|e| MinimalTimelineEvent {
                    event_type: e.event_type,
                    state_key: e.state_key,
                    event_id: e.event_id,
                    sender: e.sender,
                    origin_server_ts: e.origin_server_ts,
                    content: e.content,
                })
                .collect(),
            end: body.end,
        })
    }

    /// Fallback strategy 3 from the enforcement design: paginate recent
    /// history backward, stop at `since_ms` or an empty page, skip state
    /// events and redactions.
    async fn recent_events_by_sender(
        &self,
        room_id: &OwnedRoomId,
        sender: &OwnedUserId,
        since_ms: u64,
    ) -> Result<Vec<OwnedEventId>> {
        let mut matched = Vec::new();
        let mut from: Option<String> = None;
        loop {
            let page = self.messages_page(room_id, from.as_deref()).await?;
            if page.events.is_empty() {
                break;
            }
            let mut hit_boundary = false;
            for event in &page.events {
                if event.origin_server_ts < since_ms {
                    hit_boundary = true;
                    break;
                }
                if event.state_key.is_some() || event.event_type == "m.room.redaction" {
                    continue;
                }
                if &event.sender == sender {
                    matched.push(event.event_id.clone());
                }
            }
            if hit_boundary {
                break;
            }
            match page.end {
                Some(end) => from = Some(end),
                None => break,
            }
        }
        Ok(matched)
    }

    async fn whoami(&self) -> Result<()> {
        let resp = self.get("/_matrix/client/v3/account/whoami").await?;
        if !resp.status().is_success() {
            return Err(Error::AppserviceHandshakeRejected("homeserver rejected the appservice as_token"));
        }
        Ok(())
    }
}
