use axum::{extract::Path, http::request::Parts};
use base64::Engine;
use bytes::Bytes;
use ruma::{api::client::error::ErrorKind, CanonicalJsonObject, CanonicalJsonValue, OwnedEventId, OwnedRoomId, OwnedUserId};
use serde_json::{json, Value};
use tracing::warn;

use super::auth::XMatrixVerified;
use crate::{
    service::{policyserver::Recommendation, protections::MessageContext},
    services,
    utils::sha256,
    Error, Result,
};

const MAX_PDU_BYTES: usize = 64 * 1024;

fn normalize_event_id(raw: &str) -> Result<OwnedEventId> {
    let with_sigil = if raw.starts_with('$') { raw.to_owned() } else { format!("${raw}") };
    OwnedEventId::try_from(with_sigil).map_err(|_| Error::BadRequest(ErrorKind::InvalidParam, "malformed event id"))
}

/// Recomputes the base64url(SHA-256(canonical JSON)) this crate treats as the
/// event id, over the PDU with `signatures`/`unsigned` stripped (§6's
/// simplified identity check — not the full room-version-dependent reference
/// hash algorithm).
fn verify_event_id(event_id: &OwnedEventId, pdu: &CanonicalJsonObject) -> Result<()> {
    let mut stripped = pdu.clone();
    stripped.remove("signatures");
    stripped.remove("unsigned");
    let bytes = serde_json::to_vec(&stripped).map_err(|_| Error::BadRequest(ErrorKind::BadJson, "pdu failed to canonicalize"))?;
    let digest = sha256(&bytes);
    let computed = format!("${}", base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest));
    if computed != event_id.as_str() {
        return Err(Error::EventIdMismatch(event_id.as_str().to_owned(), computed));
    }
    Ok(())
}

fn string_field(obj: &CanonicalJsonObject, key: &str) -> Option<String> {
    match obj.get(key) {
        Some(CanonicalJsonValue::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Pulls just enough of the PDU's `content` to run the message protection
/// chain in dry-run mode, mirroring the live `HandleMessage` path.
fn message_context_fields(pdu: &CanonicalJsonObject) -> (Option<String>, usize, bool) {
    let Some(CanonicalJsonValue::Object(content)) = pdu.get("content") else {
        return (None, 0, false);
    };
    let body = string_field(content, "body");
    let mention_count = match content.get("m.mentions") {
        Some(CanonicalJsonValue::Object(mentions)) => match mentions.get("user_ids") {
            Some(CanonicalJsonValue::Array(ids)) => ids.len(),
            _ => 0,
        },
        _ => 0,
    };
    let has_media = matches!(
        string_field(content, "msgtype").as_deref(),
        Some("m.image" | "m.video" | "m.audio" | "m.file")
    );
    (body, mention_count, has_media)
}

/// `HandleLegacyCheck` / `HandleCachedCheck` / `HandleSign` (§4.H), folded
/// into the one endpoint the policy-server wire protocol exposes: a tiny
/// body means "use the cached decision", otherwise the body is the PDU to
/// evaluate (and sign, if a signing key is configured).
pub async fn check_event(Path(event_id_raw): Path<String>, parts: Parts, body: Bytes) -> Result<axum::Json<Value>> {
    if body.len() > MAX_PDU_BYTES {
        return Err(Error::PduTooLarge);
    }

    let event_id = normalize_event_id(&event_id_raw)?;

    let canonical_body: CanonicalJsonValue =
        serde_json::from_slice(&body).map_err(|_| Error::BadRequest(ErrorKind::BadJson, "body is not valid JSON"))?;

    let XMatrixVerified { origin } = XMatrixVerified::verify(&parts, &canonical_body).await?;

    if body.len() <= 2 {
        let recommendation = services().policyserver.handle_cached_check(&event_id).await.unwrap_or_else(|| {
            warn!(%event_id, "cached check requested with no prior evaluation, defaulting to spam");
            Recommendation::Spam
        });
        return Ok(axum::Json(json!({ "recommendation": recommendation.as_str() })));
    }

    let CanonicalJsonValue::Object(pdu) = canonical_body else {
        return Err(Error::BadRequest(ErrorKind::BadJson, "pdu body must be a JSON object"));
    };
    verify_event_id(&event_id, &pdu)?;

    let sender: OwnedUserId = string_field(&pdu, "sender")
        .ok_or_else(|| Error::BadRequest(ErrorKind::BadJson, "pdu missing sender"))?
        .try_into()
        .map_err(|_| Error::BadRequest(ErrorKind::BadJson, "pdu sender is not a valid user id"))?;
    let room_id: OwnedRoomId = string_field(&pdu, "room_id")
        .ok_or_else(|| Error::BadRequest(ErrorKind::BadJson, "pdu missing room_id"))?
        .try_into()
        .map_err(|_| Error::BadRequest(ErrorKind::BadJson, "pdu room_id is not a valid room id"))?;

    let (body_text, mention_count, has_media) = message_context_fields(&pdu);
    let message_ctx = MessageContext {
        sender: &sender,
        room_id: &room_id,
        body: body_text.as_deref(),
        mention_count,
        has_media,
    };

    let evaluator = services().dispatcher.protector_for(&room_id);
    let (recommendation, signature) = match &evaluator {
        Some(evaluator) => {
            let list_ids = evaluator.watched_list_ids();
            if services().globals.config.signing_key_path.is_some() {
                let (recommendation, signature) = services()
                    .policyserver
                    .handle_sign(
                        &event_id,
                        pdu.clone(),
                        &sender,
                        services().policy_store,
                        &list_ids,
                        &evaluator.protections,
                        &message_ctx,
                        services().globals.keypair(),
                        services().globals.server_name().as_str(),
                    )
                    .await?;
                (recommendation, signature)
            } else {
                let (recommendation, _) = services()
                    .policyserver
                    .handle_legacy_check(&event_id, &sender, services().policy_store, &list_ids, &evaluator.protections, &message_ctx)
                    .await;
                (recommendation, None)
            }
        }
        None => (Recommendation::Ok, None),
    };

    if recommendation == Recommendation::Spam && services().globals.config.always_redact && origin != sender.server_name() {
        if let Some(evaluator) = &evaluator {
            if services().policyserver.should_redact(&event_id) {
                if let Err(e) = evaluator.homeserver.redact_event(&room_id, &event_id, "flagged spam by policy server").await {
                    warn!(%event_id, error = %e, "policy-server redaction followup failed");
                }
            }
        }
    }

    let mut response = json!({ "recommendation": recommendation.as_str() });
    if let Some(signature) = signature {
        response["signature"] = json!(signature);
    }
    Ok(axum::Json(response))
}
