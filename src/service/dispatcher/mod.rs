use std::sync::{Arc, RwLock};

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use tracing::warn;

use crate::service::{
    evaluator::{Evaluator, PROTECTED_ROOMS_EVENT_TYPE, WATCHED_LISTS_EVENT_TYPE},
    policy::{PolicyEvent, PolicyStore},
    protections::MessageContext,
};

/// Component I: routes inbound homeserver events to the evaluator(s) that
/// care about them. Owns no policy state itself — it only fans calls out to
/// the right `Evaluator` instances, which are created and destroyed as
/// management rooms come and go rather than being owned by `Services`
/// directly (§4.E, §4.I).
///
/// Lock order: `evaluators` is the dispatcher's only lock, and it is never
/// held across an `.await` on an evaluator call — the list of matching
/// evaluators is cloned out from under the lock first, per the lock-order
/// table in §5 (dispatcher above everything an evaluator itself locks).
pub struct Dispatcher {
    evaluators: RwLock<Vec<Arc<Evaluator>>>,
    policy_store: &'static PolicyStore,
}

impl Dispatcher {
    pub fn new(policy_store: &'static PolicyStore) -> Self {
        Self {
            evaluators: RwLock::new(Vec::new()),
            policy_store,
        }
    }

    pub fn register_evaluator(&self, evaluator: Arc<Evaluator>) {
        self.evaluators.write().unwrap().push(evaluator);
    }

    pub fn evaluators(&self) -> Vec<Arc<Evaluator>> {
        self.evaluators.read().unwrap().clone()
    }

    pub fn evaluator_for_management_room(&self, room_id: &OwnedRoomId) -> Option<Arc<Evaluator>> {
        self.evaluators
            .read()
            .unwrap()
            .iter()
            .find(|e| &e.management_room == room_id)
            .cloned()
    }

    fn watchers_of(&self, policy_room: &OwnedRoomId) -> Vec<Arc<Evaluator>> {
        self.evaluators
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.watches(policy_room))
            .cloned()
            .collect()
    }

    fn protectors_of(&self, room_id: &OwnedRoomId) -> Vec<Arc<Evaluator>> {
        self.evaluators
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.is_protecting(room_id))
            .cloned()
            .collect()
    }

    /// The evaluator currently protecting `room_id`, if any. Used by the
    /// policy-server admission surface, which needs exactly one evaluator's
    /// watched lists and protection chain to evaluate an event against.
    pub fn protector_for(&self, room_id: &OwnedRoomId) -> Option<Arc<Evaluator>> {
        self.protectors_of(room_id).into_iter().next()
    }

    /// A state event landed in a policy room: ingest it into the store, then
    /// hand the delta to every evaluator watching that room.
    pub async fn dispatch_policy_event(&self, event: &PolicyEvent) {
        let result = self.policy_store.update(event);
        if result.added.is_none() && result.removed.is_none() {
            return;
        }
        for evaluator in self.watchers_of(&event.policy_room_id) {
            evaluator
                .handle_policy_list_change(&event.policy_room_id, result.added.clone(), result.removed.clone())
                .await;
        }
    }

    /// An `m.room.redaction` landed in a policy room, possibly tombstoning a
    /// rule that event created.
    pub async fn dispatch_redaction(&self, room_id: &OwnedRoomId, redacts: &OwnedEventId) {
        let Some(removed) = self.policy_store.redact(redacts) else {
            return;
        };
        for evaluator in self.watchers_of(room_id) {
            evaluator.handle_policy_list_change(room_id, None, Some(removed.clone())).await;
        }
    }

    /// A state event landed in a management room: power-levels, the
    /// watched-lists list, or the protected-rooms list.
    pub async fn dispatch_config_event(&self, room_id: &OwnedRoomId, event_type: &str, content: serde_json::Value) {
        if event_type != "m.room.power_levels" && event_type != WATCHED_LISTS_EVENT_TYPE && event_type != PROTECTED_ROOMS_EVENT_TYPE {
            return;
        }
        let Some(evaluator) = self.evaluator_for_management_room(room_id) else {
            return;
        };
        if let Err(e) = evaluator.handle_config_event(event_type, content).await {
            warn!(%room_id, %event_type, error = %e, "failed to apply management-room config event");
        }
    }

    /// A membership change: routed to the owning management room's
    /// evaluator (the bot's own membership drives protect/unprotect) and to
    /// whichever evaluator currently protects the room (ordinary members).
    pub async fn dispatch_member(&self, room_id: &OwnedRoomId, user_id: &OwnedUserId, membership: &str) {
        if let Some(evaluator) = self.evaluator_for_management_room(room_id) {
            evaluator.handle_member(room_id, user_id, membership).await;
        }
        for evaluator in self.protectors_of(room_id) {
            evaluator.handle_member(room_id, user_id, membership).await;
        }
    }

    /// A `m.room.message` in a protected room: ran through the protection
    /// chain of whichever evaluator protects it.
    pub async fn dispatch_message(&self, event_id: &OwnedEventId, ctx: MessageContext<'_>) {
        for evaluator in self.protectors_of(ctx.room_id) {
            evaluator.handle_message(event_id, ctx).await;
        }
    }

    /// A `!meowlnir` command or other message in a management room.
    pub async fn dispatch_management_message(&self, room_id: &OwnedRoomId, sender: &OwnedUserId, body: &str) -> Option<String> {
        let evaluator = self.evaluator_for_management_room(room_id)?;
        evaluator.handle_command(sender, body).await
    }

    /// `HandleReport`: routed to whichever evaluator protects the room the
    /// reported event lives in.
    pub async fn dispatch_report(&self, sender: &OwnedUserId, target_user: &OwnedUserId, room: &OwnedRoomId, event: &OwnedEventId, reason: &str) {
        for evaluator in self.protectors_of(room) {
            evaluator.handle_report(sender, target_user, room, event, reason).await;
        }
    }

    /// Admission: `user_may_invite` / `federated_user_may_invite`, routed by
    /// whichever evaluator protects the target room.
    pub async fn dispatch_user_may_invite(&self, inviter: &OwnedUserId, invitee: &OwnedUserId, room: &OwnedRoomId) -> Result<(), String> {
        for evaluator in self.protectors_of(room) {
            evaluator.handle_user_may_invite(inviter, invitee, room).await?;
        }
        Ok(())
    }

    /// Admission: `user_may_join_room` / `accept_make_join`.
    pub async fn dispatch_accept_make_join(&self, room: &OwnedRoomId, user: &OwnedUserId) -> Result<(), String> {
        for evaluator in self.protectors_of(room) {
            evaluator.handle_accept_make_join(room, user).await?;
        }
        Ok(())
    }
}
