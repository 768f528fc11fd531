use std::sync::Arc;

use ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedUserId};

use crate::utils::is_dynamic_glob;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Room,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recommendation {
    Ban,
    Unban,
    Takedown,
    Other,
}

impl Recommendation {
    pub fn is_ban_family(self) -> bool {
        matches!(self, Self::Ban | Self::Unban | Self::Takedown)
    }
}

/// The event-type "quality" a rule was ingested from. When two events share
/// a state_key, the higher-quality type wins (stable beats legacy beats
/// unstable).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventQuality {
    Unstable,
    Legacy,
    Stable,
}

/// An immutable record derived from one policy state event.
#[derive(Clone, Debug)]
pub struct Rule {
    pub entity_type: EntityKind,
    pub entity: Option<String>,
    pub entity_hash: Option<[u8; 32]>,
    pub recommendation: Recommendation,
    pub reason: String,
    pub sender: OwnedUserId,
    pub timestamp: MilliSecondsSinceUnixEpoch,
    pub policy_room_id: OwnedRoomId,
    pub state_key: String,
    pub event_id: OwnedEventId,
    pub event_quality: EventQuality,
    pub ignored: bool,
    pub dynamic: bool,
}

impl Rule {
    /// Builds a rule from ingested fields; returns `None` for a tombstone
    /// (empty entity and no hash, or empty recommendation) which removes the
    /// rule at this state_key rather than creating one.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entity_type: EntityKind,
        entity: Option<String>,
        entity_hash: Option<[u8; 32]>,
        recommendation: Option<Recommendation>,
        reason: String,
        sender: OwnedUserId,
        timestamp: MilliSecondsSinceUnixEpoch,
        policy_room_id: OwnedRoomId,
        state_key: String,
        event_id: OwnedEventId,
        event_quality: EventQuality,
    ) -> Option<Self> {
        let recommendation = recommendation?;
        if entity.is_none() && entity_hash.is_none() {
            return None;
        }
        let dynamic = entity.as_deref().is_some_and(is_dynamic_glob);
        Some(Self {
            entity_type,
            entity,
            entity_hash,
            recommendation,
            reason,
            sender,
            timestamp,
            policy_room_id,
            state_key,
            event_id,
            event_quality,
            ignored: false,
            dynamic,
        })
    }

    pub fn with_ignored(mut self, ignored: bool) -> Self {
        self.ignored = ignored;
        self
    }

    pub fn matches_glob(&self, compiled: &regex::Regex, entity: &str) -> bool {
        !self.ignored && compiled.is_match(entity)
    }
}

pub type RuleRef = Arc<Rule>;
