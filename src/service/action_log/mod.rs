mod data;

pub use data::{Data, SqliteData};
use ruma::{OwnedRoomId, OwnedUserId};

use crate::{utils::millis_since_unix_epoch, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionType {
    Ban,
    Redact,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Redact => "redact",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "redact" => Self::Redact,
            _ => Self::Ban,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ActionRecord {
    pub target_user: OwnedUserId,
    pub in_room_id: OwnedRoomId,
    pub action_type: ActionType,
    pub source_policy_room_id: OwnedRoomId,
    pub rule_entity: String,
    pub recommendation: String,
    pub taken_at_ms: i64,
}

/// Durable record of "who was banned where, by which rule", for reverse
/// lookups when a rule or list is removed.
pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    #[tracing::instrument(skip(self))]
    pub fn record_action(
        &self,
        target_user: &OwnedUserId,
        in_room_id: &OwnedRoomId,
        action_type: ActionType,
        source_policy_room_id: &OwnedRoomId,
        rule_entity: &str,
        recommendation: &str,
    ) -> Result<()> {
        self.db.put(&ActionRecord {
            target_user: target_user.clone(),
            in_room_id: in_room_id.clone(),
            action_type,
            source_policy_room_id: source_policy_room_id.clone(),
            rule_entity: rule_entity.to_owned(),
            recommendation: recommendation.to_owned(),
            taken_at_ms: millis_since_unix_epoch() as i64,
        })
    }

    pub fn remove_action(
        &self,
        target_user: &OwnedUserId,
        in_room_id: &OwnedRoomId,
        action_type: ActionType,
    ) -> Result<()> {
        self.db.delete(target_user, in_room_id, action_type)
    }

    pub fn has_action(
        &self,
        target_user: &OwnedUserId,
        in_room_id: &OwnedRoomId,
        action_type: ActionType,
    ) -> Result<bool> {
        Ok(self.db.get(target_user, in_room_id, action_type)?.is_some())
    }

    /// All targets acted on because of rules from `policy_room_id`,
    /// restricted to `rooms` (empty means all rooms the caller protects).
    pub fn reevaluate_candidates_for_list(
        &self,
        policy_room_id: &OwnedRoomId,
        rooms: &[OwnedRoomId],
    ) -> Result<Vec<ActionRecord>> {
        self.db.get_all_by_policy_list(policy_room_id, rooms)
    }

    pub fn reevaluate_candidates_for_entity(
        &self,
        rule_entity: &str,
        rooms: &[OwnedRoomId],
    ) -> Result<Vec<ActionRecord>> {
        self.db.get_all_by_rule_entity(rule_entity, rooms)
    }

    pub fn actions_for_user(
        &self,
        target_user: &OwnedUserId,
        rooms: &[OwnedRoomId],
    ) -> Result<Vec<ActionRecord>> {
        self.db.get_all_by_target_user(target_user, rooms)
    }
}
