use axum::extract::Path;
use ruma::{serde::Raw, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedUserId, UInt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::auth::AppserviceAuth;
use crate::{
    service::{policy::store::parse_raw_policy_event, protections::MessageContext},
    services, Error, Result,
};

#[derive(Deserialize)]
pub struct RawTransactionEvent {
    #[serde(rename = "type")]
    event_type: String,
    room_id: OwnedRoomId,
    sender: OwnedUserId,
    event_id: OwnedEventId,
    origin_server_ts: u64,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    redacts: Option<OwnedEventId>,
    #[serde(default)]
    content: Value,
}

#[derive(Deserialize)]
pub struct Transaction {
    events: Vec<RawTransactionEvent>,
}

fn member_context(event: &RawTransactionEvent) -> (OwnedUserId, String) {
    let membership = event.content.get("membership").and_then(Value::as_str).unwrap_or("leave").to_owned();
    (event.sender.clone(), membership)
}

fn message_body(event: &RawTransactionEvent) -> (Option<&str>, usize, bool) {
    let body = event.content.get("body").and_then(Value::as_str);
    let mention_count = event
        .content
        .get("m.mentions")
        .and_then(|m| m.get("user_ids"))
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let has_media = matches!(
        event.content.get("msgtype").and_then(Value::as_str),
        Some("m.image" | "m.video" | "m.audio" | "m.file")
    );
    (body, mention_count, has_media)
}

/// `PUT /_matrix/app/v1/transactions/{txnId}`: the homeserver's push side of
/// the appservice transport. Every event in the batch is routed through the
/// dispatcher exactly as a pull-based sync stream would (§4.I); the
/// homeserver handles retry/at-least-once delivery, this handler only needs
/// to be idempotent, which every downstream `Service` already is.
pub async fn push_transaction(Path(_txn_id): Path<String>, _auth: AppserviceAuth, axum::Json(body): axum::Json<Transaction>) -> Result<axum::Json<Value>> {
    for event in body.events {
        if let Some(redacts) = &event.redacts {
            services().dispatcher.dispatch_redaction(&event.room_id, redacts).await;
            continue;
        }

        if let Some(state_key) = &event.state_key {
            if crate::service::policy::store::classify_event_type(&event.event_type).is_some() {
                let Ok(ts) = UInt::try_from(event.origin_server_ts) else {
                    warn!(event_id = %event.event_id, "origin_server_ts overflowed, skipping policy event");
                    continue;
                };
                let content = Raw::from_json(serde_json::value::to_raw_value(&event.content).map_err(|_| {
                    Error::BadRequest(ruma::api::client::error::ErrorKind::BadJson, "policy event content is not valid JSON")
                })?);
                if let Some(policy_event) = parse_raw_policy_event(
                    &event.event_type,
                    state_key,
                    event.room_id.clone(),
                    event.event_id.clone(),
                    event.sender.clone(),
                    MilliSecondsSinceUnixEpoch(ts),
                    content,
                ) {
                    services().dispatcher.dispatch_policy_event(&policy_event).await;
                }
                continue;
            }

            if event.event_type == "m.room.member" {
                let (user_id, membership) = member_context(&event);
                services().dispatcher.dispatch_member(&event.room_id, &user_id, &membership).await;
                continue;
            }

            if event.event_type == "m.room.power_levels"
                || event.event_type == crate::service::evaluator::WATCHED_LISTS_EVENT_TYPE
                || event.event_type == crate::service::evaluator::PROTECTED_ROOMS_EVENT_TYPE
            {
                services()
                    .dispatcher
                    .dispatch_config_event(&event.room_id, &event.event_type, event.content.clone())
                    .await;
                continue;
            }
            continue;
        }

        if event.event_type == "m.room.message" {
            if services().registry.is_management_room(&event.room_id) {
                if let Some(body) = event.content.get("body").and_then(Value::as_str) {
                    if let Some(reply) = services().dispatcher.dispatch_management_message(&event.room_id, &event.sender, body).await {
                        if let Some(evaluator) = services().dispatcher.evaluator_for_management_room(&event.room_id) {
                            let _ = evaluator.homeserver.send_notice(&event.room_id, &reply).await;
                        }
                    }
                }
                continue;
            }

            let (body_text, mention_count, has_media) = message_body(&event);
            let ctx = MessageContext {
                sender: &event.sender,
                room_id: &event.room_id,
                body: body_text,
                mention_count,
                has_media,
            };
            services().dispatcher.dispatch_message(&event.event_id, ctx).await;
        }
    }

    Ok(axum::Json(json!({})))
}
