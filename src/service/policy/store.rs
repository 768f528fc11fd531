use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use ruma::{serde::Raw, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::Deserialize;
use serde_json::value::RawValue;

use super::{
    list::{Match, RuleList},
    rule::{EntityKind, EventQuality, Recommendation, Rule, RuleRef},
};
use crate::utils::sha256;

/// Recognizes the stable, legacy (`org.matrix.mjolnir.*`) and unstable
/// variants of the three policy-rule event types.
pub fn classify_event_type(event_type: &str) -> Option<(EntityKind, EventQuality)> {
    match event_type {
        "m.policy.rule.user" => Some((EntityKind::User, EventQuality::Stable)),
        "m.policy.rule.room" => Some((EntityKind::Room, EventQuality::Stable)),
        "m.policy.rule.server" => Some((EntityKind::Server, EventQuality::Stable)),
        "org.matrix.mjolnir.rule.user" => Some((EntityKind::User, EventQuality::Legacy)),
        "org.matrix.mjolnir.rule.room" => Some((EntityKind::Room, EventQuality::Legacy)),
        "org.matrix.mjolnir.rule.server" => Some((EntityKind::Server, EventQuality::Legacy)),
        "support.feline.policy.rule.user" => Some((EntityKind::User, EventQuality::Unstable)),
        "support.feline.policy.rule.room" => Some((EntityKind::Room, EventQuality::Unstable)),
        "support.feline.policy.rule.server" => Some((EntityKind::Server, EventQuality::Unstable)),
        _ => None,
    }
}

#[derive(Deserialize, Default)]
struct PolicyRuleContent {
    #[serde(default)]
    entity: Option<String>,
    #[serde(default)]
    entity_hash: Option<String>,
    #[serde(default)]
    recommendation: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

fn parse_recommendation(raw: &str) -> Recommendation {
    match raw {
        "m.ban" | "org.matrix.mjolnir.ban" => Recommendation::Ban,
        "m.unban" => Recommendation::Unban,
        "org.matrix.msc3845.takedown" | "m.takedown" => Recommendation::Takedown,
        _ => Recommendation::Other,
    }
}

pub struct PolicyEvent {
    pub event_type: String,
    pub policy_room_id: OwnedRoomId,
    pub state_key: String,
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    pub timestamp: MilliSecondsSinceUnixEpoch,
    pub content: Box<RawValue>,
}

struct RoomPolicies {
    users: RuleList,
    rooms: RuleList,
    servers: RuleList,
}

impl Default for RoomPolicies {
    fn default() -> Self {
        Self {
            users: RuleList::new(),
            rooms: RuleList::new(),
            servers: RuleList::new(),
        }
    }
}

impl RoomPolicies {
    fn list_mut(&mut self, kind: EntityKind) -> &mut RuleList {
        match kind {
            EntityKind::User => &mut self.users,
            EntityKind::Room => &mut self.rooms,
            EntityKind::Server => &mut self.servers,
        }
    }

    fn list(&self, kind: EntityKind) -> &RuleList {
        match kind {
            EntityKind::User => &self.users,
            EntityKind::Room => &self.rooms,
            EntityKind::Server => &self.servers,
        }
    }
}

#[derive(Clone, Copy)]
struct EventIndexEntry {
    kind: EntityKind,
}

/// Groups rule lists by policy room, applies state-event deltas, and
/// exposes multi-room match queries restricted to a caller-supplied set of
/// list ids.
pub struct PolicyStore {
    rooms: RwLock<HashMap<OwnedRoomId, RoomPolicies>>,
    /// event_id -> (policy_room_id, state_key) so a redaction of the
    /// creating event can remove the rule it produced.
    event_index: RwLock<HashMap<OwnedEventId, (OwnedRoomId, String, EventIndexEntry)>>,
    rule_filter: Vec<String>,
}

pub struct UpdateResult {
    pub added: Option<RuleRef>,
    pub removed: Option<RuleRef>,
}

impl PolicyStore {
    pub fn new(rule_filter: Vec<String>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            event_index: RwLock::new(HashMap::new()),
            rule_filter,
        }
    }

    fn entity_matches_filter(&self, entity: Option<&str>) -> bool {
        let Some(entity) = entity else { return false };
        self.rule_filter.iter().any(|filtered| filtered == entity)
    }

    fn build_rule(
        &self,
        kind: EntityKind,
        quality: EventQuality,
        event: &PolicyEvent,
    ) -> Option<Rule> {
        let content: PolicyRuleContent = serde_json::from_str(event.content.get()).ok()?;
        let entity_hash = content
            .entity_hash
            .as_deref()
            .and_then(|b64| ruma::serde::Base64::parse(b64).ok())
            .and_then(|bytes| bytes.as_bytes().try_into().ok());
        let recommendation = content.recommendation.as_deref().map(parse_recommendation);
        let ignored = self.entity_matches_filter(content.entity.as_deref());

        Rule::new(
            kind,
            content.entity,
            entity_hash,
            recommendation,
            content.reason.unwrap_or_default(),
            event.sender.clone(),
            event.timestamp,
            event.policy_room_id.clone(),
            event.state_key.clone(),
            event.event_id.clone(),
            quality,
        )
        .map(|rule| rule.with_ignored(ignored))
    }

    /// Applies one state-event delta (ingest or tombstone) to the store.
    pub fn update(&self, event: &PolicyEvent) -> UpdateResult {
        let Some((kind, quality)) = classify_event_type(&event.event_type) else {
            return UpdateResult {
                added: None,
                removed: None,
            };
        };

        let mut rooms = self.rooms.write().unwrap();
        let policies = rooms.entry(event.policy_room_id.clone()).or_default();
        let list = policies.list_mut(kind);

        match self.build_rule(kind, quality, event) {
            Some(rule) => {
                let (_, stored) = list.add(rule);
                if stored {
                    let added = list.rule_for_state_key(&event.state_key).cloned();
                    if let Some(added) = &added {
                        self.event_index.write().unwrap().insert(
                            added.event_id.clone(),
                            (
                                event.policy_room_id.clone(),
                                event.state_key.clone(),
                                EventIndexEntry { kind },
                            ),
                        );
                    }
                    UpdateResult {
                        added,
                        removed: None,
                    }
                } else {
                    UpdateResult {
                        added: None,
                        removed: None,
                    }
                }
            }
            None => {
                let removed = list.remove(quality, &event.state_key);
                UpdateResult {
                    added: None,
                    removed,
                }
            }
        }
    }

    /// Removes the rule created by `event_id`, as triggered by an
    /// `m.room.redaction` targeting it.
    pub fn redact(&self, event_id: &OwnedEventId) -> Option<RuleRef> {
        let (room_id, state_key, entry) = self.event_index.write().unwrap().remove(event_id)?;
        let mut rooms = self.rooms.write().unwrap();
        let policies = rooms.get_mut(&room_id)?;
        // A redaction always removes the rule regardless of its event
        // quality; scan all three qualities by trying the current stored one.
        let list = policies.list_mut(entry.kind);
        let current = list.rule_for_state_key(&state_key)?.event_quality;
        list.remove(current, &state_key)
    }

    /// Bulk-loads initial room state: unstable/legacy entries only fill in
    /// where the stable map lacks the state_key, matching ingest quality
    /// ordering.
    pub fn add_full_state(&self, room_id: &OwnedRoomId, events: Vec<PolicyEvent>) {
        let mut sorted = events;
        sorted.sort_by_key(|e| {
            classify_event_type(&e.event_type)
                .map(|(_, q)| std::cmp::Reverse(q as u8))
                .unwrap_or(std::cmp::Reverse(0))
        });
        for event in &sorted {
            debug_assert_eq!(&event.policy_room_id, room_id);
            self.update(event);
        }
    }

    fn restricted_rooms<'a>(
        &self,
        rooms: &'a HashMap<OwnedRoomId, RoomPolicies>,
        list_ids: &[OwnedRoomId],
    ) -> Vec<&'a RoomPolicies> {
        if list_ids.is_empty() {
            rooms.values().collect()
        } else {
            list_ids.iter().filter_map(|id| rooms.get(id)).collect()
        }
    }

    pub fn match_user(&self, list_ids: &[OwnedRoomId], user_id: &str) -> Match {
        let hash = sha256(user_id.as_bytes());
        let rooms = self.rooms.read().unwrap();
        let mut combined = Match::default();
        for policies in self.restricted_rooms(&rooms, list_ids) {
            let m = policies.users.match_all(user_id, &hash);
            combined.rules.extend(m.rules);
        }
        combined
    }

    pub fn match_room(&self, list_ids: &[OwnedRoomId], room_id: &str) -> Match {
        let hash = sha256(room_id.as_bytes());
        let rooms = self.rooms.read().unwrap();
        let mut combined = Match::default();
        for policies in self.restricted_rooms(&rooms, list_ids) {
            let m = policies.rooms.match_all(room_id, &hash);
            combined.rules.extend(m.rules);
        }
        combined
    }

    pub fn match_server(&self, list_ids: &[OwnedRoomId], server_name: &str) -> Match {
        let hash = sha256(server_name.as_bytes());
        let rooms = self.rooms.read().unwrap();
        let mut combined = Match::default();
        for policies in self.restricted_rooms(&rooms, list_ids) {
            let m = policies.servers.match_all(server_name, &hash);
            combined.rules.extend(m.rules);
        }
        combined
    }

    /// All server-kind rules across the listed rooms, de-duplicated by
    /// entity string with the last writer (in list_ids order) winning.
    pub fn list_server_rules(&self, list_ids: &[OwnedRoomId]) -> Vec<RuleRef> {
        let rooms = self.rooms.read().unwrap();
        let mut by_entity: HashMap<String, RuleRef> = HashMap::new();
        for policies in self.restricted_rooms(&rooms, list_ids) {
            for rule in policies.servers.rules() {
                if let Some(entity) = &rule.entity {
                    by_entity.insert(entity.clone(), rule.clone());
                }
            }
        }
        by_entity.into_values().collect()
    }
}

pub fn parse_raw_policy_event(
    event_type: &str,
    state_key: &str,
    policy_room_id: OwnedRoomId,
    event_id: OwnedEventId,
    sender: OwnedUserId,
    timestamp: MilliSecondsSinceUnixEpoch,
    content: Raw<serde_json::Value>,
) -> Option<PolicyEvent> {
    classify_event_type(event_type)?;
    Some(PolicyEvent {
        event_type: event_type.to_owned(),
        policy_room_id,
        state_key: state_key.to_owned(),
        event_id,
        sender,
        timestamp,
        content: serde_json::value::to_raw_value(&content).ok()?,
    })
}
