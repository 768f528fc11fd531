use ruma::{OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::auth::AdmissionAuth;
use crate::{services, Error, Result};

/// `{}` on success, matching the empty-object shape every admission callback
/// replies with on allow (§6, "Response is `{}` with 200 on allow").
fn allowed() -> Value {
    json!({})
}

fn forbidden(reason: String) -> Error {
    Error::Forbidden(reason)
}

#[derive(Deserialize)]
pub struct UserMayInviteBody {
    inviter: OwnedUserId,
    invitee: OwnedUserId,
    room_id: OwnedRoomId,
}

pub async fn user_may_invite(_auth: AdmissionAuth, axum::Json(body): axum::Json<UserMayInviteBody>) -> Result<axum::Json<Value>> {
    services()
        .dispatcher
        .dispatch_user_may_invite(&body.inviter, &body.invitee, &body.room_id)
        .await
        .map_err(forbidden)?;
    Ok(axum::Json(allowed()))
}

#[derive(Deserialize)]
pub struct FederatedUserMayInviteBody {
    event: Value,
}

/// Same decision as `user_may_invite`, but fed a full invite event instead of
/// three loose fields — the inviter/invitee/room are pulled out of it.
pub async fn federated_user_may_invite(
    _auth: AdmissionAuth,
    axum::Json(body): axum::Json<FederatedUserMayInviteBody>,
) -> Result<axum::Json<Value>> {
    let inviter: OwnedUserId = body
        .event
        .get("sender")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::BadRequest(ruma::api::client::error::ErrorKind::BadJson, "missing sender"))?
        .try_into()
        .map_err(|_| Error::BadRequest(ruma::api::client::error::ErrorKind::BadJson, "invalid sender"))?;
    let invitee: OwnedUserId = body
        .event
        .get("state_key")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::BadRequest(ruma::api::client::error::ErrorKind::BadJson, "missing state_key"))?
        .try_into()
        .map_err(|_| Error::BadRequest(ruma::api::client::error::ErrorKind::BadJson, "invalid state_key"))?;
    let room_id: OwnedRoomId = body
        .event
        .get("room_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::BadRequest(ruma::api::client::error::ErrorKind::BadJson, "missing room_id"))?
        .try_into()
        .map_err(|_| Error::BadRequest(ruma::api::client::error::ErrorKind::BadJson, "invalid room_id"))?;

    services()
        .dispatcher
        .dispatch_user_may_invite(&inviter, &invitee, &room_id)
        .await
        .map_err(forbidden)?;
    Ok(axum::Json(allowed()))
}

#[derive(Deserialize)]
pub struct UserMayJoinRoomBody {
    user: OwnedUserId,
    room: OwnedRoomId,
    #[serde(default)]
    #[allow(dead_code)]
    is_invited: bool,
}

pub async fn user_may_join_room(_auth: AdmissionAuth, axum::Json(body): axum::Json<UserMayJoinRoomBody>) -> Result<axum::Json<Value>> {
    services()
        .dispatcher
        .dispatch_accept_make_join(&body.room, &body.user)
        .await
        .map_err(forbidden)?;
    Ok(axum::Json(allowed()))
}

#[derive(Deserialize)]
pub struct AcceptMakeJoinBody {
    room: OwnedRoomId,
    user: OwnedUserId,
}

pub async fn accept_make_join(_auth: AdmissionAuth, axum::Json(body): axum::Json<AcceptMakeJoinBody>) -> Result<axum::Json<Value>> {
    services()
        .dispatcher
        .dispatch_accept_make_join(&body.room, &body.user)
        .await
        .map_err(forbidden)?;
    Ok(axum::Json(allowed()))
}

#[derive(Deserialize)]
pub struct PingBody {
    #[allow(dead_code)]
    id: String,
}

#[derive(Serialize)]
pub struct PingResponse {
    duration_ms: u64,
}

/// Liveness probe the homeserver can issue after (re-)registering the
/// appservice, to confirm meowlnir is reachable before wiring up the rest of
/// the admission surface.
pub async fn ping(_auth: AdmissionAuth, axum::Json(_body): axum::Json<PingBody>) -> axum::Json<PingResponse> {
    axum::Json(PingResponse { duration_ms: 0 })
}

#[derive(Deserialize)]
pub struct ReportBody {
    sender: OwnedUserId,
    target_user: OwnedUserId,
    room: OwnedRoomId,
    event: ruma::OwnedEventId,
    #[serde(default)]
    reason: String,
}

/// `HandleReport`: the homeserver forwards an abuse report here instead of
/// (or in addition to) its own moderator queue.
pub async fn report(_auth: AdmissionAuth, axum::Json(body): axum::Json<ReportBody>) -> axum::Json<Value> {
    services()
        .dispatcher
        .dispatch_report(&body.sender, &body.target_user, &body.room, &body.event, &body.reason)
        .await;
    axum::Json(allowed())
}
