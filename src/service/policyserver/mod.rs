pub mod data;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

pub use data::{Data, SqliteData};
use parking_lot::Mutex as SyncMutex;
use ruma::{
    signatures::{sign_json, Ed25519KeyPair},
    CanonicalJsonObject, OwnedEventId, OwnedRoomId, OwnedUserId,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    service::{
        policy::PolicyStore,
        protections::{MessageContext, ProtectionChain},
    },
    utils::millis_since_unix_epoch,
    Result,
};

/// The policy server's own recommendation vocabulary — distinct from
/// `policy::Recommendation` because `ok`/`spam` is the event-level admission
/// verdict, not a rule's prescribed action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recommendation {
    Ok,
    Spam,
}

impl Recommendation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Spam => "spam",
        }
    }
}

struct CacheEntry {
    recommendation: Option<Recommendation>,
    last_accessed_ms: u64,
}

const CACHE_TTL_MS: u64 = 5 * 60 * 1000;
const SWEEP_MIN_INTERVAL_MS: u64 = 60 * 1000;
const SWEEP_SIZE_THRESHOLD: usize = 10_000;

/// Per-event admission cache, signing, and redaction-followup dedup. One
/// instance is shared process-wide; the per-event_id lock inside each cache
/// entry guarantees at most one concurrent evaluation per event (§4.H, §9).
pub struct Service {
    data: &'static dyn Data,
    cache: SyncMutex<HashMap<OwnedEventId, Arc<Mutex<CacheEntry>>>>,
    already_redacted: SyncMutex<HashSet<OwnedEventId>>,
    last_sweep_ms: SyncMutex<u64>,
}

impl Service {
    pub fn new(data: &'static dyn Data) -> Self {
        Self {
            data,
            cache: SyncMutex::new(HashMap::new()),
            already_redacted: SyncMutex::new(HashSet::new()),
            last_sweep_ms: SyncMutex::new(0),
        }
    }

    fn entry_for(&self, event_id: &OwnedEventId) -> Arc<Mutex<CacheEntry>> {
        let mut cache = self.cache.lock();
        let entry = cache
            .entry(event_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CacheEntry {
                    recommendation: None,
                    last_accessed_ms: millis_since_unix_epoch(),
                }))
            })
            .clone();
        self.maybe_sweep(&mut cache);
        entry
    }

    /// Evicts entries idle for longer than `CACHE_TTL_MS`, but only once the
    /// cache has grown past a size threshold and at least a minute has
    /// passed since the last sweep (§3's eviction rule).
    fn maybe_sweep(&self, cache: &mut HashMap<OwnedEventId, Arc<Mutex<CacheEntry>>>) {
        if cache.len() < SWEEP_SIZE_THRESHOLD {
            return;
        }
        let now = millis_since_unix_epoch();
        let mut last_sweep = self.last_sweep_ms.lock();
        if now.saturating_sub(*last_sweep) < SWEEP_MIN_INTERVAL_MS {
            return;
        }
        *last_sweep = now;
        cache.retain(|_, entry| {
            entry
                .try_lock()
                .map(|guard| now.saturating_sub(guard.last_accessed_ms) < CACHE_TTL_MS)
                .unwrap_or(true)
        });
    }

    /// `HandleCachedCheck`: returns the cached recommendation without
    /// evaluating anything, for callers that already know this event was
    /// checked once (request body is the 2-byte "use cache" sentinel).
    pub async fn handle_cached_check(&self, event_id: &OwnedEventId) -> Option<Recommendation> {
        let entry = self.entry_for(event_id);
        entry.lock().await.recommendation
    }

    /// `HandleLegacyCheck`: matches the sender and sender's homeserver
    /// against the watched lists, falling back to the dry-run protection
    /// chain when no rule fires. Returns the recommendation and whether this
    /// call is the one that computed it for the first time (callers use that
    /// to decide whether to enqueue a redaction).
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_legacy_check(
        &self,
        event_id: &OwnedEventId,
        sender: &OwnedUserId,
        store: &PolicyStore,
        list_ids: &[OwnedRoomId],
        protections: &ProtectionChain,
        message_ctx: &MessageContext<'_>,
    ) -> (Recommendation, bool) {
        let entry = self.entry_for(event_id);
        let mut guard = entry.lock().await;

        if let Some(cached) = guard.recommendation {
            guard.last_accessed_ms = millis_since_unix_epoch();
            return (cached, false);
        }

        let user_banned = store
            .match_user(list_ids, sender.as_str())
            .recommendations()
            .ban_or_unban
            .is_some_and(|r| r.recommendation.is_ban_family() && r.recommendation != crate::service::policy::rule::Recommendation::Unban);
        let server_banned = store
            .match_server(list_ids, sender.server_name().as_str())
            .recommendations()
            .ban_or_unban
            .is_some_and(|r| r.recommendation.is_ban_family() && r.recommendation != crate::service::policy::rule::Recommendation::Unban);

        let recommendation = if user_banned || server_banned {
            Recommendation::Spam
        } else if protections.check_message(message_ctx).is_some() {
            Recommendation::Spam
        } else {
            Recommendation::Ok
        };

        guard.recommendation = Some(recommendation);
        guard.last_accessed_ms = millis_since_unix_epoch();
        (recommendation, true)
    }

    /// True only the first time this event is marked for redaction; callers
    /// must still check the origin-server exemption themselves before
    /// trusting this.
    pub fn should_redact(&self, event_id: &OwnedEventId) -> bool {
        self.already_redacted.lock().insert(event_id.clone())
    }

    /// `HandleSign`: returns a cached persisted signature, or computes the
    /// recommendation and signs the canonical PDU when it's `ok`.
    pub async fn handle_sign(
        &self,
        event_id: &OwnedEventId,
        mut canonical_pdu: CanonicalJsonObject,
        sender: &OwnedUserId,
        store: &PolicyStore,
        list_ids: &[OwnedRoomId],
        protections: &ProtectionChain,
        message_ctx: &MessageContext<'_>,
        keypair: &Ed25519KeyPair,
        server_name: &str,
    ) -> Result<(Recommendation, Option<String>)> {
        if let Some(existing) = self.data.get_signature(event_id)? {
            return Ok((Recommendation::Ok, Some(existing)));
        }

        let (recommendation, _) = self
            .handle_legacy_check(event_id, sender, store, list_ids, protections, message_ctx)
            .await;

        if recommendation != Recommendation::Ok {
            return Ok((recommendation, None));
        }

        sign_json(server_name, keypair, &mut canonical_pdu)
            .map_err(|e| crate::Error::SigningFailed(e.to_string()))?;
        let signature = serde_json::to_value(&canonical_pdu)
            .ok()
            .and_then(|v| v.get("signatures").cloned())
            .and_then(|v| v.get(server_name).cloned())
            .and_then(|keys| keys.as_object().and_then(|o| o.values().next().cloned()))
            .and_then(|v| v.as_str().map(str::to_owned));

        if let Some(signature) = &signature {
            self.data.put_signature(event_id, signature)?;
            info!(%event_id, "policy-server signed event");
        } else {
            warn!(%event_id, "signing produced no signature to persist");
        }

        Ok((Recommendation::Ok, signature))
    }
}
