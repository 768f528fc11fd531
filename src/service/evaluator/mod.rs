pub mod apply_policy;
pub mod commands;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
    time::Duration,
};

use regex::Regex;
use ruma::{OwnedRoomId, OwnedUserId};
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use self::apply_policy::Trigger;
use crate::{
    homeserver::HomeserverApi,
    service::{
        acl::{self, Debouncer},
        action_log,
        enforcement,
        policy::{rule::EntityKind, PolicyStore},
        protections::ProtectionChain,
        rooms::{MemberIndex, ProtectedRoomRegistry, ProtectedRoomState},
    },
    Result,
};

pub const WATCHED_LISTS_EVENT_TYPE: &str = "support.feline.meowlnir.watched_lists";
pub const PROTECTED_ROOMS_EVENT_TYPE: &str = "support.feline.meowlnir.protected_rooms";

/// The binding between an evaluator and a policy room it watches, plus the
/// per-binding flags named in §3.
#[derive(Clone, Debug, Deserialize)]
pub struct WatchedList {
    pub room_id: OwnedRoomId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub shortcode: Option<String>,
    #[serde(default)]
    pub dont_apply: bool,
    #[serde(default)]
    pub dont_apply_acl: bool,
    #[serde(default)]
    pub dont_notify_on_change: bool,
    #[serde(default)]
    pub auto_unban: bool,
}

#[derive(Deserialize, Default)]
struct WatchedListsContent {
    #[serde(default)]
    lists: Vec<WatchedList>,
}

#[derive(Deserialize, Default)]
struct ProtectedRoomsContent {
    #[serde(default)]
    rooms: Vec<OwnedRoomId>,
    #[serde(default)]
    skip_acl: Vec<OwnedRoomId>,
}

#[derive(Deserialize, Default)]
struct PowerLevelsContent {
    #[serde(default)]
    users: HashMap<OwnedUserId, i64>,
    #[serde(default = "default_users_default")]
    users_default: i64,
    #[serde(default = "default_state_default")]
    state_default: i64,
    #[serde(default)]
    ban: Option<i64>,
    #[serde(default)]
    redact: Option<i64>,
    #[serde(default)]
    events: HashMap<String, i64>,
}

fn default_users_default() -> i64 {
    0
}
fn default_state_default() -> i64 {
    50
}

/// The subset of config this evaluator needs pinned at construction time,
/// threaded through every side-effecting call rather than checked deep
/// inside handlers (§9's dry-run parameterization note).
pub struct EvaluatorConfig {
    pub dry_run: bool,
    pub filter_local_invites: bool,
    pub auto_reject_invites_token: Option<String>,
    pub notify_management_room: bool,
    pub auto_redact_patterns: Vec<Regex>,
    pub rule_filter: Vec<String>,
    pub acl_debounce_secs: u64,
}

/// One instance per management room; owned by the dispatcher, not by
/// `Services` (§4.E's divergence from the teacher's static-singleton
/// shape — evaluators are created/destroyed as management rooms are
/// discovered).
pub struct Evaluator {
    pub management_room: OwnedRoomId,
    pub bot_user_id: OwnedUserId,
    pub config: EvaluatorConfig,

    pub store: &'static PolicyStore,
    pub action_log: &'static action_log::Service,
    pub enforcement: &'static enforcement::Service,
    pub registry: &'static ProtectedRoomRegistry,
    pub homeserver: Arc<dyn HomeserverApi>,
    pub protections: ProtectionChain,

    watched_lists: RwLock<Vec<WatchedList>>,
    protected_rooms: RwLock<HashMap<OwnedRoomId, ProtectedRoomState>>,
    want_to_protect: RwLock<HashSet<OwnedRoomId>>,
    is_joining: RwLock<HashSet<OwnedRoomId>>,
    member_index: RwLock<MemberIndex>,
    pending_invites: RwLock<HashSet<(OwnedUserId, OwnedUserId, OwnedRoomId)>>,
    admins: RwLock<HashSet<OwnedUserId>>,

    config_lock: AsyncMutex<()>,
    acl_debouncer: Debouncer,
}

impl Evaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        management_room: OwnedRoomId,
        bot_user_id: OwnedUserId,
        admins: HashSet<OwnedUserId>,
        config: EvaluatorConfig,
        store: &'static PolicyStore,
        action_log: &'static action_log::Service,
        enforcement: &'static enforcement::Service,
        registry: &'static ProtectedRoomRegistry,
        homeserver: Arc<dyn HomeserverApi>,
        protections: ProtectionChain,
    ) -> Self {
        registry.register_management_room(management_room.clone());
        let acl_debouncer = Debouncer::with_quiet_period(Duration::from_secs(config.acl_debounce_secs));
        Self {
            management_room,
            bot_user_id,
            config,
            store,
            action_log,
            enforcement,
            registry,
            homeserver,
            protections,
            watched_lists: RwLock::new(Vec::new()),
            protected_rooms: RwLock::new(HashMap::new()),
            want_to_protect: RwLock::new(HashSet::new()),
            is_joining: RwLock::new(HashSet::new()),
            member_index: RwLock::new(MemberIndex::new()),
            pending_invites: RwLock::new(HashSet::new()),
            admins: RwLock::new(admins),
            config_lock: AsyncMutex::new(()),
            acl_debouncer,
        }
    }

    pub fn watched_list_ids(&self) -> Vec<OwnedRoomId> {
        self.watched_lists.read().unwrap().iter().map(|l| l.room_id.clone()).collect()
    }

    pub fn watches(&self, room_id: &OwnedRoomId) -> bool {
        self.watched_lists.read().unwrap().iter().any(|l| &l.room_id == room_id)
    }

    pub fn is_admin(&self, user: &OwnedUserId) -> bool {
        self.admins.read().unwrap().contains(user)
    }

    fn watched_list(&self, shortcode: &str) -> Option<WatchedList> {
        self.watched_lists
            .read()
            .unwrap()
            .iter()
            .find(|l| l.shortcode.as_deref() == Some(shortcode))
            .cloned()
    }

    /// `Load`: initial sync from management-room state. Fetches
    /// power-levels (to derive `admins`), the watched-lists and
    /// protected-rooms config events, loads full state for every watched
    /// policy room, then triggers a full member re-evaluation and ACL
    /// recompile.
    pub async fn load(&self) -> Result<()> {
        let _guard = self.config_lock.lock().await;

        if let Some(content) = self
            .homeserver
            .get_state_event(&self.management_room, "m.room.power_levels", "")
            .await?
        {
            self.apply_power_levels(content);
        }

        if let Some(content) = self
            .homeserver
            .get_state_event(&self.management_room, WATCHED_LISTS_EVENT_TYPE, "")
            .await?
        {
            self.apply_watched_lists(content).await?;
        }

        if let Some(content) = self
            .homeserver
            .get_state_event(&self.management_room, PROTECTED_ROOMS_EVENT_TYPE, "")
            .await?
        {
            self.apply_protected_rooms(content).await;
        }

        self.reevaluate_all_members().await;
        self.update_acl();
        Ok(())
    }

    fn apply_power_levels(&self, content: serde_json::Value) {
        let parsed: PowerLevelsContent = match serde_json::from_value(content) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed power_levels event, skipping");
                return;
            }
        };

        let required = parsed
            .events
            .get(WATCHED_LISTS_EVENT_TYPE)
            .copied()
            .unwrap_or(parsed.state_default);

        let admins = parsed
            .users
            .iter()
            .filter(|(_, level)| **level >= required)
            .map(|(user, _)| user.clone())
            .collect();
        *self.admins.write().unwrap() = admins;
    }

    async fn apply_watched_lists(&self, content: serde_json::Value) -> Result<()> {
        let parsed: WatchedListsContent = serde_json::from_value(content).unwrap_or_default();
        *self.watched_lists.write().unwrap() = parsed.lists.clone();

        for list in &parsed.lists {
            let events = self.homeserver.room_state(&list.room_id).await?;
            let policy_events: Vec<_> = events
                .into_iter()
                .filter_map(|e| {
                    crate::service::policy::store::parse_raw_policy_event(
                        &e.event_type,
                        &e.state_key,
                        list.room_id.clone(),
                        e.event_id,
                        e.sender,
                        ruma::MilliSecondsSinceUnixEpoch(
                            ruma::UInt::try_from(e.origin_server_ts).unwrap_or_default(),
                        ),
                        ruma::serde::Raw::from_json(e.content),
                    )
                })
                .collect();
            self.store.add_full_state(&list.room_id, policy_events);
        }
        Ok(())
    }

    async fn apply_protected_rooms(&self, content: serde_json::Value) {
        let parsed: ProtectedRoomsContent = serde_json::from_value(content).unwrap_or_default();
        for room_id in &parsed.rooms {
            self.want_to_protect.write().unwrap().insert(room_id.clone());
            let apply_acl = !parsed.skip_acl.contains(room_id);
            self.try_protecting_room(room_id, apply_acl, true).await;
        }
    }

    /// `TryProtectingRoom` (§4.D): joins if needed, verifies power, then
    /// registers. Skips the power check in dry-run mode.
    pub async fn try_protecting_room(&self, room_id: &OwnedRoomId, apply_acl: bool, do_reeval: bool) {
        if self.registry.is_management_room(room_id) {
            warn!(%room_id, "refusing to protect a management room");
            return;
        }
        if self.registry.claim_protected(room_id, &self.management_room, true).is_some() {
            return;
        }

        {
            let mut joining = self.is_joining.write().unwrap();
            if joining.contains(room_id) {
                return;
            }
            joining.insert(room_id.clone());
        }

        let join_result = self.homeserver.join_room(room_id).await;
        self.is_joining.write().unwrap().remove(room_id);
        if let Err(e) = join_result {
            warn!(%room_id, error = %e, "failed to join protected room");
            self.registry.claim_protected(room_id, &self.management_room, false);
            return;
        }

        if !self.config.dry_run {
            let authorized = self.check_own_power(room_id).await;
            if !authorized {
                self.registry.claim_protected(room_id, &self.management_room, false);
                self.want_to_protect.write().unwrap().insert(room_id.clone());
                let _ = self
                    .homeserver
                    .send_notice(
                        &self.management_room,
                        &format!("Lack sufficient power level in {room_id}, will retry once it changes."),
                    )
                    .await;
                return;
            }
        }

        let name = self
            .homeserver
            .get_state_event(room_id, "m.room.name", "")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.get("name").and_then(|n| n.as_str()).map(str::to_owned));

        self.protected_rooms.write().unwrap().insert(
            room_id.clone(),
            ProtectedRoomState {
                name,
                cached_acl_deny: Vec::new(),
                apply_acl,
            },
        );
        self.want_to_protect.write().unwrap().remove(room_id);

        if do_reeval {
            if let Ok(members) = self.homeserver.joined_members(room_id).await {
                for member in members {
                    self.member_index.write().unwrap().note_membership(&member, room_id);
                }
            }
            self.reevaluate_all_members().await;
            self.update_acl();
        }
    }

    async fn check_own_power(&self, room_id: &OwnedRoomId) -> bool {
        let Ok(Some(content)) = self.homeserver.get_state_event(room_id, "m.room.power_levels", "").await else {
            return false;
        };
        let parsed: PowerLevelsContent = match serde_json::from_value(content) {
            Ok(p) => p,
            Err(_) => return false,
        };
        let our_level = parsed.users.get(&self.bot_user_id).copied().unwrap_or(parsed.users_default);
        let required = parsed
            .ban
            .unwrap_or(50)
            .max(parsed.redact.unwrap_or(50))
            .max(parsed.events.get("m.room.server_acl").copied().unwrap_or(parsed.state_default));
        our_level >= required
    }

    /// `HandlePolicyListChange` (§4.E).
    pub async fn handle_policy_list_change(
        &self,
        policy_room: &OwnedRoomId,
        added: Option<crate::service::policy::RuleRef>,
        removed: Option<crate::service::policy::RuleRef>,
    ) {
        let Some(list) = self
            .watched_lists
            .read()
            .unwrap()
            .iter()
            .find(|l| &l.room_id == policy_room)
            .cloned()
        else {
            return;
        };

        if added.is_some() && removed.is_some() {
            let (a, r) = (added.as_ref().unwrap(), removed.as_ref().unwrap());
            if a.entity == r.entity && a.recommendation == r.recommendation {
                return;
            }
        }

        if !list.dont_apply {
            if let Some(rule) = &added {
                self.evaluate_rule_against_members(rule, Trigger::NewRule).await;
            }
            if let Some(rule) = &removed {
                self.reevaluate_candidates_for_rule(rule).await;
            }
        }

        if !list.dont_notify_on_change && self.config.notify_management_room {
            if let Some(rule) = &added {
                let _ = self
                    .homeserver
                    .send_notice(
                        &self.management_room,
                        &format!(
                            "Rule added in {}: {:?} {} ({})",
                            policy_room,
                            rule.recommendation,
                            rule.entity.as_deref().unwrap_or("<hash-only>"),
                            rule.reason
                        ),
                    )
                    .await;
            }
            if let Some(rule) = &removed {
                let _ = self
                    .homeserver
                    .send_notice(
                        &self.management_room,
                        &format!(
                            "Rule removed/unbanned in {}: {}",
                            policy_room,
                            rule.entity.as_deref().unwrap_or("<hash-only>")
                        ),
                    )
                    .await;
            }
        }

        self.update_acl();
    }

    async fn evaluate_rule_against_members(&self, rule: &crate::service::policy::RuleRef, trigger: Trigger) {
        if rule.entity_type != EntityKind::User {
            return;
        }

        // A hash-only rule carries no literal entity to scan known members
        // against; resolve it straight to the one member it denotes instead
        // of walking every known member.
        if rule.entity.is_none() {
            if let Some(hash) = &rule.entity_hash {
                let Some(member) = self.member_index.read().unwrap().resolve_hash(hash).cloned() else {
                    return;
                };
                let matched = self.store.match_user(&self.watched_list_ids(), member.as_str());
                if matched.rules.iter().any(|r| std::sync::Arc::ptr_eq(r, rule)) {
                    self.apply_policy(&member, &matched, trigger).await;
                }
                return;
            }
        }

        let members: Vec<OwnedUserId> = self.member_index.read().unwrap().known_members().cloned().collect();
        for member in members {
            let matched = self.store.match_user(&self.watched_list_ids(), member.as_str());
            if matched.rules.iter().any(|r| std::sync::Arc::ptr_eq(r, rule)) {
                self.apply_policy(&member, &matched, trigger).await;
            }
        }
    }

    async fn reevaluate_candidates_for_rule(&self, rule: &crate::service::policy::RuleRef) {
        let Ok(candidates) = self
            .action_log
            .reevaluate_candidates_for_list(&rule.policy_room_id, &self.protected_room_ids())
        else {
            return;
        };
        for record in candidates {
            let matched = self
                .store
                .match_user(&self.watched_list_ids(), record.target_user.as_str());
            self.apply_policy(&record.target_user, &matched, Trigger::ReEvaluation).await;
        }
    }

    fn protected_room_ids(&self) -> Vec<OwnedRoomId> {
        self.protected_rooms.read().unwrap().keys().cloned().collect()
    }

    /// Whether this evaluator currently owns `room_id` as a protected room —
    /// the dispatcher's routing test for member/message events (§4.I).
    pub fn is_protecting(&self, room_id: &OwnedRoomId) -> bool {
        self.protected_rooms.read().unwrap().contains_key(room_id)
    }

    /// Re-applies one of the management room's config state events after the
    /// dispatcher observes it change, serialized against concurrent `load`
    /// via the same `config_lock`.
    pub async fn handle_config_event(&self, event_type: &str, content: serde_json::Value) -> Result<()> {
        let _guard = self.config_lock.lock().await;
        match event_type {
            "m.room.power_levels" => self.apply_power_levels(content),
            WATCHED_LISTS_EVENT_TYPE => {
                self.apply_watched_lists(content).await?;
                drop(_guard);
                self.reevaluate_all_members().await;
                self.update_acl();
                return Ok(());
            }
            PROTECTED_ROOMS_EVENT_TYPE => self.apply_protected_rooms(content).await,
            _ => return Ok(()),
        }
        self.update_acl();
        Ok(())
    }

    async fn reevaluate_all_members(&self) {
        let members: Vec<OwnedUserId> = self.member_index.read().unwrap().known_members().cloned().collect();
        for member in members {
            let matched = self.store.match_user(&self.watched_list_ids(), member.as_str());
            self.apply_policy(&member, &matched, Trigger::ReEvaluation).await;
        }
    }

    /// `HandleMember` (§4.E, §4.I): updates the membership index; a ban
    /// recommendation on the affected user re-triggers enforcement in every
    /// protected room they're currently in.
    pub async fn handle_member(&self, room_id: &OwnedRoomId, user_id: &OwnedUserId, membership: &str) {
        if user_id == &self.bot_user_id {
            match membership {
                "join" => {
                    if self.want_to_protect.read().unwrap().contains(room_id) {
                        self.try_protecting_room(room_id, true, true).await;
                    }
                }
                "leave" | "ban" => {
                    self.registry.claim_protected(room_id, &self.management_room, false);
                    self.protected_rooms.write().unwrap().remove(room_id);
                }
                _ => {}
            }
            return;
        }

        let is_protected = self.protected_rooms.read().unwrap().contains_key(room_id);
        if !is_protected {
            return;
        }

        match membership {
            "join" | "invite" | "knock" => {
                self.member_index.write().unwrap().note_membership(user_id, room_id);
            }
            "leave" | "ban" => {
                self.member_index.write().unwrap().note_departure(user_id, room_id);
            }
            _ => {}
        }

        let matched = self.store.match_user(&self.watched_list_ids(), user_id.as_str());
        if matched.recommendations().ban_or_unban.is_some() {
            self.apply_policy(user_id, &matched, Trigger::ReEvaluation).await;
        }
    }

    /// `HandleMessage` (§4.E): runs the protection chain when the sender
    /// isn't an admin of this management room.
    pub async fn handle_message(
        &self,
        event_id: &ruma::OwnedEventId,
        ctx: crate::service::protections::MessageContext<'_>,
    ) {
        if self.is_admin(ctx.sender) {
            return;
        }
        if let Some((name, reason)) = self.protections.check_message(&ctx) {
            info!(sender = %ctx.sender, room = %ctx.room_id, protection = name, %reason, "protection hit");
            if !self.config.dry_run {
                if let Err(e) = self.homeserver.redact_event(ctx.room_id, event_id, &reason).await {
                    warn!(error = %e, "failed to redact protection-flagged message");
                }
            }
        }
    }

    /// `HandleUserMayInvite` (§4.E): admission hook invoked before the
    /// homeserver records an invite.
    pub async fn handle_user_may_invite(
        &self,
        inviter: &OwnedUserId,
        invitee: &OwnedUserId,
        room: &OwnedRoomId,
    ) -> std::result::Result<(), String> {
        let list_ids = self.watched_list_ids();
        for (kind, entity) in [
            (EntityKind::User, inviter.as_str()),
            (EntityKind::User, invitee.as_str()),
            (EntityKind::Server, inviter.server_name().as_str()),
        ] {
            let matched = match kind {
                EntityKind::User => self.store.match_user(&list_ids, entity),
                EntityKind::Server => self.store.match_server(&list_ids, entity),
                EntityKind::Room => self.store.match_room(&list_ids, entity),
            };
            if let Some(rule) = matched.recommendations().ban_or_unban {
                if rule.recommendation != crate::service::policy::rule::Recommendation::Unban {
                    if self.config.notify_management_room {
                        let _ = self
                            .homeserver
                            .send_notice(
                                &self.management_room,
                                &format!("Blocked invite from {inviter} to {invitee} in {room}: {}", rule.reason),
                            )
                            .await;
                    }
                    return Err(format!("blocked by policy: {}", rule.reason));
                }
            }
        }

        self.member_index.write().unwrap().note_known_user(inviter);
        self.pending_invites
            .write()
            .unwrap()
            .insert((inviter.clone(), invitee.clone(), room.clone()));
        Ok(())
    }

    /// `HandleAcceptMakeJoin`: the equivalent pre-join check for restricted
    /// rooms, reusing the same ban-rule matching as invite admission.
    pub async fn handle_accept_make_join(&self, room: &OwnedRoomId, user: &OwnedUserId) -> std::result::Result<(), String> {
        let list_ids = self.watched_list_ids();
        let matched = self.store.match_user(&list_ids, user.as_str());
        if let Some(rule) = matched.recommendations().ban_or_unban {
            if rule.recommendation != crate::service::policy::rule::Recommendation::Unban {
                return Err(format!("blocked by policy: {}", rule.reason));
            }
        }
        if let Some((_, reason)) = self.protections.check_join(user, room) {
            return Err(reason);
        }
        Ok(())
    }

    async fn reject_pending_invites_for(&self, inviter: &OwnedUserId) {
        let pending: Vec<(OwnedUserId, OwnedRoomId)> = {
            let mut set = self.pending_invites.write().unwrap();
            let matching: Vec<_> = set.iter().filter(|(i, _, _)| i == inviter).cloned().collect();
            for item in &matching {
                set.remove(item);
            }
            matching.into_iter().map(|(_, invitee, room)| (invitee, room)).collect()
        };
        if pending.is_empty() {
            return;
        }
        match self.enforcement.reject_pending_invites(inviter, pending, self.config.dry_run).await {
            Ok(count) if count > 0 && self.config.notify_management_room => {
                let _ = self
                    .homeserver
                    .send_notice(&self.management_room, &format!("Rejected {count} pending invite(s) from {inviter}"))
                    .await;
            }
            Err(e) => warn!(%inviter, error = %e, "reject_pending_invites failed"),
            _ => {}
        }
    }

    /// `UpdateACL`: schedules a debounced recompile; the actual compile runs
    /// on `run_acl_loop`.
    pub fn update_acl(&self) {
        self.acl_debouncer.trigger();
    }

    /// Dedicated per-evaluator task: waits for a debounced trigger, then
    /// compiles and diffuses the ACL. Intended to run for the evaluator's
    /// lifetime via `tokio::spawn`.
    pub async fn run_acl_loop(&self) {
        loop {
            self.acl_debouncer.wait_for_compile().await;
            self.compile_and_update_acl().await;
        }
    }

    /// Periodic full reconciliation: re-runs `Load` on a fixed interval so
    /// any policy or membership drift missed by a dropped appservice
    /// transaction is caught eventually instead of persisting until the
    /// next manual restart. Intended to run for the evaluator's lifetime
    /// via `tokio::spawn`, alongside `run_acl_loop`.
    pub async fn run_reconciliation_loop(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.load().await {
                warn!(room_id = %self.management_room, error = %e, "periodic reconciliation failed");
            }
        }
    }

    async fn compile_and_update_acl(&self) {
        let list_ids = self.watched_lists.read().unwrap().iter().filter(|l| !l.dont_apply_acl).map(|l| l.room_id.clone()).collect::<Vec<_>>();
        let deny = acl::compile_acl(self.store, &list_ids, self.bot_user_id.server_name());

        let rooms: Vec<(OwnedRoomId, bool, Vec<String>)> = self
            .protected_rooms
            .read()
            .unwrap()
            .iter()
            .map(|(id, state)| (id.clone(), state.apply_acl, state.cached_acl_deny.clone()))
            .collect();

        let results = acl::update_acl(self.homeserver.as_ref(), &rooms, &deny).await;
        let mut protected = self.protected_rooms.write().unwrap();
        for (room_id, outcome) in results {
            if outcome.is_ok() {
                if let Some(state) = protected.get_mut(&room_id) {
                    state.cached_acl_deny = deny.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use ruma::{event_id, room_id, user_id, MilliSecondsSinceUnixEpoch, OwnedEventId};
    use serde_json::json;

    use super::*;
    use crate::{
        homeserver::{HomeserverApi, MessagesPage, MinimalStateEvent},
        service::{
            action_log::{ActionRecord, ActionType},
            enforcement,
            policy::store::PolicyEvent,
            policyserver,
            protections::{MessageContext, ProtectionChain},
            rooms::ProtectedRoomRegistry,
        },
    };

    #[derive(Default)]
    struct RecordedCalls {
        bans: Vec<(OwnedRoomId, OwnedUserId, String)>,
        notices: Vec<(OwnedRoomId, String)>,
        acl_sends: Vec<(OwnedRoomId, serde_json::Value)>,
        redactions: Vec<(OwnedRoomId, OwnedEventId)>,
    }

    /// Records every outbound call instead of touching a network, per the
    /// in-memory collaborator style used for the rest of this crate's tests.
    #[derive(Default)]
    struct FakeHomeserver {
        calls: StdMutex<RecordedCalls>,
    }

    #[async_trait]
    impl HomeserverApi for FakeHomeserver {
        async fn ban(&self, room_id: &OwnedRoomId, user_id: &OwnedUserId, reason: &str) -> Result<()> {
            self.calls.lock().unwrap().bans.push((room_id.clone(), user_id.clone(), reason.to_owned()));
            Ok(())
        }

        async fn unban(&self, _room_id: &OwnedRoomId, _user_id: &OwnedUserId) -> Result<()> {
            Ok(())
        }

        async fn kick(&self, _room_id: &OwnedRoomId, _user_id: &OwnedUserId, _reason: &str) -> Result<()> {
            Ok(())
        }

        async fn redact_event(&self, room_id: &OwnedRoomId, event_id: &OwnedEventId, _reason: &str) -> Result<()> {
            self.calls.lock().unwrap().redactions.push((room_id.clone(), event_id.clone()));
            Ok(())
        }

        async fn send_state_event(
            &self,
            room_id: &OwnedRoomId,
            _event_type: &str,
            _state_key: &str,
            content: serde_json::Value,
        ) -> Result<()> {
            self.calls.lock().unwrap().acl_sends.push((room_id.clone(), content));
            Ok(())
        }

        async fn get_state_event(&self, _room_id: &OwnedRoomId, _event_type: &str, _state_key: &str) -> Result<Option<serde_json::Value>> {
            Ok(None)
        }

        async fn room_state(&self, _room_id: &OwnedRoomId) -> Result<Vec<MinimalStateEvent>> {
            Ok(Vec::new())
        }

        async fn joined_members(&self, _room_id: &OwnedRoomId) -> Result<Vec<OwnedUserId>> {
            Ok(Vec::new())
        }

        async fn send_notice(&self, room_id: &OwnedRoomId, markdown_body: &str) -> Result<()> {
            self.calls.lock().unwrap().notices.push((room_id.clone(), markdown_body.to_owned()));
            Ok(())
        }

        async fn join_room(&self, _room_id: &OwnedRoomId) -> Result<()> {
            Ok(())
        }

        async fn leave_room_as(&self, _room_id: &OwnedRoomId, _user_id: &OwnedUserId) -> Result<()> {
            Ok(())
        }

        async fn messages_page(&self, _room_id: &OwnedRoomId, _from: Option<&str>) -> Result<MessagesPage> {
            Ok(MessagesPage {
                events: Vec::new(),
                end: None,
            })
        }

        async fn recent_events_by_sender(&self, _room_id: &OwnedRoomId, _sender: &OwnedUserId, _since_ms: u64) -> Result<Vec<OwnedEventId>> {
            Ok(Vec::new())
        }

        async fn whoami(&self) -> Result<()> {
            Ok(())
        }
    }

    impl FakeHomeserver {
        fn notice_containing(&self, needle: &str) -> bool {
            self.calls.lock().unwrap().notices.iter().any(|(_, body)| body.contains(needle))
        }
    }

    /// In-memory stand-in for `action_log::Data`, keyed the same way the
    /// `taken_action` table's primary key is.
    #[derive(Default)]
    struct FakeActionLogData {
        records: StdMutex<Vec<ActionRecord>>,
    }

    impl action_log::Data for FakeActionLogData {
        fn put(&self, record: &ActionRecord) -> Result<()> {
            let mut records = self.records.lock().unwrap();
            records.retain(|r| !(r.target_user == record.target_user && r.in_room_id == record.in_room_id && r.action_type == record.action_type));
            records.push(record.clone());
            Ok(())
        }

        fn delete(&self, target_user: &OwnedUserId, in_room_id: &OwnedRoomId, action_type: ActionType) -> Result<()> {
            self.records
                .lock()
                .unwrap()
                .retain(|r| !(r.target_user == *target_user && r.in_room_id == *in_room_id && r.action_type == action_type));
            Ok(())
        }

        fn get(&self, target_user: &OwnedUserId, in_room_id: &OwnedRoomId, action_type: ActionType) -> Result<Option<ActionRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.target_user == *target_user && r.in_room_id == *in_room_id && r.action_type == action_type)
                .cloned())
        }

        fn get_all_by_policy_list(&self, policy_room_id: &OwnedRoomId, rooms: &[OwnedRoomId]) -> Result<Vec<ActionRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| &r.source_policy_room_id == policy_room_id && (rooms.is_empty() || rooms.contains(&r.in_room_id)))
                .cloned()
                .collect())
        }

        fn get_all_by_rule_entity(&self, rule_entity: &str, rooms: &[OwnedRoomId]) -> Result<Vec<ActionRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.rule_entity == rule_entity && (rooms.is_empty() || rooms.contains(&r.in_room_id)))
                .cloned()
                .collect())
        }

        fn get_all_by_target_user(&self, target_user: &OwnedUserId, rooms: &[OwnedRoomId]) -> Result<Vec<ActionRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| &r.target_user == target_user && (rooms.is_empty() || rooms.contains(&r.in_room_id)))
                .cloned()
                .collect())
        }
    }

    fn test_config() -> EvaluatorConfig {
        EvaluatorConfig {
            dry_run: false,
            filter_local_invites: false,
            auto_reject_invites_token: None,
            notify_management_room: true,
            auto_redact_patterns: Vec::new(),
            rule_filter: Vec::new(),
            acl_debounce_secs: 0,
        }
    }

    /// Wires up one evaluator against leaked, per-test fakes — the same
    /// `'static` singleton shape `Services::build` uses, scaled down to what
    /// a single test needs.
    fn test_evaluator(homeserver: Arc<dyn HomeserverApi>, config: EvaluatorConfig) -> Evaluator {
        let store: &'static PolicyStore = Box::leak(Box::new(PolicyStore::new(Vec::new())));
        let action_log_data: &'static dyn action_log::Data = Box::leak(Box::new(FakeActionLogData::default()));
        let action_log: &'static action_log::Service = Box::leak(Box::new(action_log::Service { db: action_log_data }));
        let registry: &'static ProtectedRoomRegistry = Box::leak(Box::new(ProtectedRoomRegistry::new()));
        let enforcement: &'static enforcement::Service = Box::leak(Box::new(enforcement::Service {
            homeserver: homeserver.clone(),
            action_log,
        }));

        Evaluator::new(
            room_id!("!management:x.example").to_owned(),
            user_id!("@meowlnir:x.example").to_owned(),
            HashSet::new(),
            config,
            store,
            action_log,
            enforcement,
            registry,
            homeserver,
            ProtectionChain::default(),
        )
    }

    fn user_rule_event(list: &OwnedRoomId, state_key: &str, entity: &str, recommendation: &str, reason: &str) -> PolicyEvent {
        PolicyEvent {
            event_type: "m.policy.rule.user".to_owned(),
            policy_room_id: list.clone(),
            state_key: state_key.to_owned(),
            event_id: event_id!("$rule:x.example").to_owned(),
            sender: user_id!("@admin:x.example").to_owned(),
            timestamp: MilliSecondsSinceUnixEpoch::now(),
            content: serde_json::value::to_raw_value(&json!({ "entity": entity, "recommendation": recommendation, "reason": reason })).unwrap(),
        }
    }

    fn server_rule_event(list: &OwnedRoomId, state_key: &str, entity: &str, recommendation: &str) -> PolicyEvent {
        PolicyEvent {
            event_type: "m.policy.rule.server".to_owned(),
            policy_room_id: list.clone(),
            state_key: state_key.to_owned(),
            event_id: event_id!("$server-rule:x.example").to_owned(),
            sender: user_id!("@admin:x.example").to_owned(),
            timestamp: MilliSecondsSinceUnixEpoch::now(),
            content: serde_json::value::to_raw_value(&json!({ "entity": entity, "recommendation": recommendation })).unwrap(),
        }
    }

    fn tombstone_event(event_type: &str, list: &OwnedRoomId, state_key: &str) -> PolicyEvent {
        PolicyEvent {
            event_type: event_type.to_owned(),
            policy_room_id: list.clone(),
            state_key: state_key.to_owned(),
            event_id: event_id!("$tombstone:x.example").to_owned(),
            sender: user_id!("@admin:x.example").to_owned(),
            timestamp: MilliSecondsSinceUnixEpoch::now(),
            content: serde_json::value::to_raw_value(&json!({})).unwrap(),
        }
    }

    fn watch(list: &OwnedRoomId) -> WatchedList {
        WatchedList {
            room_id: list.clone(),
            name: None,
            shortcode: None,
            dont_apply: false,
            dont_apply_acl: false,
            dont_notify_on_change: false,
            auto_unban: false,
        }
    }

    /// Scenario 1 (ban propagates): a watched list publishes a user ban rule
    /// for a member already present in a protected room.
    #[tokio::test]
    async fn scenario_ban_propagates() {
        let homeserver = Arc::new(FakeHomeserver::default());
        let evaluator = test_evaluator(homeserver.clone(), test_config());
        let list = room_id!("!L:x.example").to_owned();
        let room = room_id!("!R:y.example").to_owned();
        let bad_user = user_id!("@bad:evil.example").to_owned();

        *evaluator.watched_lists.write().unwrap() = vec![watch(&list)];
        evaluator
            .protected_rooms
            .write()
            .unwrap()
            .insert(room.clone(), ProtectedRoomState::default());
        evaluator.member_index.write().unwrap().note_membership(&bad_user, &room);

        let update = evaluator.store.update(&user_rule_event(&list, "rule1", bad_user.as_str(), "m.ban", "spam"));
        evaluator.handle_policy_list_change(&list, update.added, update.removed).await;

        assert!(homeserver
            .calls
            .lock()
            .unwrap()
            .bans
            .iter()
            .any(|(r, u, reason)| r == &room && u == &bad_user && reason == "spam"));
        assert!(evaluator.action_log.has_action(&bad_user, &room, ActionType::Ban).unwrap());
        assert!(homeserver.notice_containing(bad_user.as_str()) && homeserver.notice_containing("spam"));
    }

    /// Scenario 2 (glob rule matches): a dynamic user-glob ban hits every
    /// member of the matching server, and no other.
    #[tokio::test]
    async fn scenario_glob_rule_matches() {
        let homeserver = Arc::new(FakeHomeserver::default());
        let evaluator = test_evaluator(homeserver.clone(), test_config());
        let list = room_id!("!L:x.example").to_owned();
        let room = room_id!("!R:y.example").to_owned();
        let newcomer = user_id!("@newcomer:evil.example").to_owned();
        let good_user = user_id!("@user:good.example").to_owned();

        *evaluator.watched_lists.write().unwrap() = vec![watch(&list)];
        evaluator
            .protected_rooms
            .write()
            .unwrap()
            .insert(room.clone(), ProtectedRoomState::default());
        evaluator.store.update(&user_rule_event(&list, "glob-rule", "@*:evil.example", "m.ban", "spam"));

        evaluator.handle_member(&room, &newcomer, "join").await;
        evaluator.handle_member(&room, &good_user, "join").await;

        let calls = homeserver.calls.lock().unwrap();
        assert!(calls.bans.iter().any(|(r, u, _)| r == &room && u == &newcomer));
        assert!(!calls.bans.iter().any(|(_, u, _)| u == &good_user));
    }

    /// Scenario 3 (unban tombstone): overwriting the same state_key with an
    /// empty entity removes the rule and triggers reevaluation, but does not
    /// lift the ban already on record.
    #[tokio::test]
    async fn scenario_unban_tombstone() {
        let homeserver = Arc::new(FakeHomeserver::default());
        let evaluator = test_evaluator(homeserver.clone(), test_config());
        let list = room_id!("!L:x.example").to_owned();
        let room = room_id!("!R:y.example").to_owned();
        let bad_user = user_id!("@bad:evil.example").to_owned();

        *evaluator.watched_lists.write().unwrap() = vec![watch(&list)];
        evaluator
            .protected_rooms
            .write()
            .unwrap()
            .insert(room.clone(), ProtectedRoomState::default());
        evaluator.member_index.write().unwrap().note_membership(&bad_user, &room);

        let update = evaluator.store.update(&user_rule_event(&list, "rule1", bad_user.as_str(), "m.ban", "spam"));
        evaluator.handle_policy_list_change(&list, update.added, update.removed).await;
        assert!(evaluator.action_log.has_action(&bad_user, &room, ActionType::Ban).unwrap());

        let tombstoned = evaluator.store.update(&tombstone_event("m.policy.rule.user", &list, "rule1"));
        assert!(tombstoned.removed.is_some());
        evaluator.handle_policy_list_change(&list, tombstoned.added, tombstoned.removed).await;

        // No automatic unban in the base spec: the taken-action record
        // survives the tombstone.
        assert!(evaluator.action_log.has_action(&bad_user, &room, ActionType::Ban).unwrap());
        assert!(homeserver.notice_containing("unbanned"));
    }

    /// Scenario 4 (ACL compile): a server ban rule compiles into a deny list
    /// that's pushed only to the room whose cached ACL is stale.
    #[tokio::test]
    async fn scenario_acl_compile_skips_unchanged_room() {
        let homeserver = Arc::new(FakeHomeserver::default());
        let evaluator = test_evaluator(homeserver.clone(), test_config());
        let list = room_id!("!L:x.example").to_owned();
        let room_stale = room_id!("!R1:y.example").to_owned();
        let room_current = room_id!("!R2:y.example").to_owned();

        *evaluator.watched_lists.write().unwrap() = vec![watch(&list)];
        evaluator.store.update(&server_rule_event(&list, "server-rule", "bad.example", "m.ban"));
        {
            let mut protected = evaluator.protected_rooms.write().unwrap();
            protected.insert(
                room_stale.clone(),
                ProtectedRoomState {
                    name: None,
                    cached_acl_deny: Vec::new(),
                    apply_acl: true,
                },
            );
            protected.insert(
                room_current.clone(),
                ProtectedRoomState {
                    name: None,
                    cached_acl_deny: vec!["bad.example".to_owned()],
                    apply_acl: true,
                },
            );
        }

        // Two rapid triggers before the loop is ever polled must coalesce
        // into a single compile.
        evaluator.update_acl();
        evaluator.update_acl();
        let _ = tokio::time::timeout(Duration::from_millis(200), evaluator.run_acl_loop()).await;

        let calls = homeserver.calls.lock().unwrap();
        let sent_to_stale = calls.acl_sends.iter().find(|(r, _)| r == &room_stale);
        assert!(sent_to_stale.is_some());
        assert_eq!(sent_to_stale.unwrap().1["deny"], json!(["bad.example"]));
        assert!(!calls.acl_sends.iter().any(|(r, _)| r == &room_current));
        assert_eq!(calls.acl_sends.iter().filter(|(r, _)| r == &room_stale).count(), 1);
    }

    /// Scenario 5 (invite admission): an invite from a banned user is
    /// rejected without a ban ever being issued.
    #[tokio::test]
    async fn scenario_invite_admission_blocks_banned_inviter() {
        let homeserver = Arc::new(FakeHomeserver::default());
        let evaluator = test_evaluator(homeserver.clone(), test_config());
        let list = room_id!("!L:x.example").to_owned();
        let room = room_id!("!R:y.example").to_owned();
        let bad_user = user_id!("@bad:evil.example").to_owned();
        let invitee = user_id!("@newcomer:good.example").to_owned();

        *evaluator.watched_lists.write().unwrap() = vec![watch(&list)];
        evaluator.store.update(&user_rule_event(&list, "rule1", bad_user.as_str(), "m.ban", "spam"));

        let outcome = evaluator.handle_user_may_invite(&bad_user, &invitee, &room).await;
        let err = outcome.expect_err("invite from a banned user must be rejected");
        assert!(err.contains("spam"));
        assert!(homeserver.notice_containing("Blocked invite"));
        assert!(homeserver.calls.lock().unwrap().bans.is_empty());
    }

    /// Scenario 6 (policy-server spam redaction): a spam verdict schedules
    /// exactly one redaction regardless of repeated calls, and a later
    /// cached check returns the same verdict without re-matching.
    #[tokio::test]
    async fn scenario_policy_server_spam_redaction_is_scheduled_once() {
        let store = PolicyStore::new(Vec::new());
        let list = room_id!("!L:x.example").to_owned();
        let bad_user = user_id!("@bad:evil.example").to_owned();
        store.update(&user_rule_event(&list, "rule1", bad_user.as_str(), "m.ban", "spam"));

        struct FakeSignatureData;
        impl policyserver::Data for FakeSignatureData {
            fn get_signature(&self, _event_id: &OwnedEventId) -> Result<Option<String>> {
                Ok(None)
            }
            fn put_signature(&self, _event_id: &OwnedEventId, _signature_b64: &str) -> Result<()> {
                Ok(())
            }
        }
        let data: &'static dyn policyserver::Data = Box::leak(Box::new(FakeSignatureData));
        let service = policyserver::Service::new(data);
        let protections = ProtectionChain::default();
        let event_id = event_id!("$e:evil.example").to_owned();
        let room = room_id!("!R:y.example").to_owned();
        let ctx = MessageContext {
            sender: &bad_user,
            room_id: &room,
            body: None,
            mention_count: 0,
            has_media: false,
        };

        let (recommendation, computed_now) = service
            .handle_legacy_check(&event_id, &bad_user, &store, &[list.clone()], &protections, &ctx)
            .await;
        assert_eq!(recommendation, policyserver::Recommendation::Spam);
        assert!(computed_now);

        // Caller-side "schedule a redaction at most once" gate.
        assert!(service.should_redact(&event_id));
        assert!(!service.should_redact(&event_id));

        let (cached, computed_again) = service
            .handle_legacy_check(&event_id, &bad_user, &store, &[list.clone()], &protections, &ctx)
            .await;
        assert_eq!(cached, policyserver::Recommendation::Spam);
        assert!(!computed_again);

        assert_eq!(service.handle_cached_check(&event_id).await, Some(policyserver::Recommendation::Spam));
    }
}
