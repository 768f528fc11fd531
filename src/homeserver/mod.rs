pub mod http;

use async_trait::async_trait;
use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde_json::value::RawValue;

use crate::Result;

/// One state event as returned by a full-room-state fetch: just enough shape
/// to feed `PolicyStore`/the evaluator without committing this crate to a
/// general-purpose Matrix client SDK.
pub struct MinimalStateEvent {
    pub event_type: String,
    pub state_key: String,
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    pub origin_server_ts: u64,
    pub content: Box<RawValue>,
}

/// One timeline event as returned by a `/messages` page.
pub struct MinimalTimelineEvent {
    pub event_type: String,
    pub state_key: Option<String>,
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    pub origin_server_ts: u64,
    pub content: Box<RawValue>,
}

pub struct MessagesPage {
    pub events: Vec<MinimalTimelineEvent>,
    /// Pagination token for the next (older) page; `None` at the start of
    /// the room.
    pub end: Option<String>,
}

/// External collaborator: the subset of a Matrix client/appservice SDK this
/// crate actually drives. Not a general-purpose Matrix client — ban/redact/
/// invite/ACL/notice calls, state reads, and backward pagination only, the
/// surface enforcement, the ACL compiler, and the evaluator's startup load
/// need.
#[async_trait]
pub trait HomeserverApi: Send + Sync {
    async fn ban(&self, room_id: &OwnedRoomId, user_id: &OwnedUserId, reason: &str) -> Result<()>;
    async fn unban(&self, room_id: &OwnedRoomId, user_id: &OwnedUserId) -> Result<()>;
    async fn kick(&self, room_id: &OwnedRoomId, user_id: &OwnedUserId, reason: &str) -> Result<()>;
    async fn redact_event(&self, room_id: &OwnedRoomId, event_id: &OwnedEventId, reason: &str) -> Result<()>;
    async fn send_state_event(
        &self,
        room_id: &OwnedRoomId,
        event_type: &str,
        state_key: &str,
        content: serde_json::Value,
    ) -> Result<()>;
    async fn get_state_event(
        &self,
        room_id: &OwnedRoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<serde_json::Value>>;
    /// Full room state, used by the evaluator's startup/reconciliation load
    /// and by the policy store's `add_full_state`.
    async fn room_state(&self, room_id: &OwnedRoomId) -> Result<Vec<MinimalStateEvent>>;
    async fn joined_members(&self, room_id: &OwnedRoomId) -> Result<Vec<OwnedUserId>>;
    async fn send_notice(&self, room_id: &OwnedRoomId, markdown_body: &str) -> Result<()>;
    async fn join_room(&self, room_id: &OwnedRoomId) -> Result<()>;
    async fn leave_room_as(&self, room_id: &OwnedRoomId, user_id: &OwnedUserId) -> Result<()>;
    /// One backward page of `/messages`, used by the redaction fallback
    /// strategy (paginate recent history, 24h window).
    async fn messages_page(&self, room_id: &OwnedRoomId, from: Option<&str>) -> Result<MessagesPage>;
    async fn recent_events_by_sender(
        &self,
        room_id: &OwnedRoomId,
        sender: &OwnedUserId,
        since_ms: u64,
    ) -> Result<Vec<OwnedEventId>>;
    /// Confirms the appservice's `as_token` is accepted by the homeserver
    /// before the HTTP listener starts accepting transaction pushes.
    async fn whoami(&self) -> Result<()>;
}
