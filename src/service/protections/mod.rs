use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use regex::Regex;
use ruma::{OwnedRoomId, OwnedUserId};

/// What a message-protection check is handed: just enough of the event to
/// decide without the protection needing to know about PDUs or event types.
#[derive(Clone, Copy)]
pub struct MessageContext<'a> {
    pub sender: &'a OwnedUserId,
    pub room_id: &'a OwnedRoomId,
    pub body: Option<&'a str>,
    pub mention_count: usize,
    pub has_media: bool,
}

/// One named check in the message/join protection chain (§4.E, §4.H step 2).
/// Consulted both live (`HandleMessage`) and in the policy-server's dry-run
/// evaluation — a protection never has side effects of its own, it only
/// returns a hit reason.
pub trait Protection: Send + Sync {
    fn name(&self) -> &'static str;

    fn check_message(&self, _ctx: &MessageContext<'_>) -> Option<String> {
        None
    }

    fn check_join(&self, _user: &OwnedUserId, _room: &OwnedRoomId) -> Option<String> {
        None
    }
}

/// Rejects messages whose body matches any configured regex.
pub struct BadWordProtection {
    patterns: Vec<Regex>,
}

impl BadWordProtection {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }
}

impl Protection for BadWordProtection {
    fn name(&self) -> &'static str {
        "bad-word"
    }

    fn check_message(&self, ctx: &MessageContext<'_>) -> Option<String> {
        let body = ctx.body?;
        self.patterns
            .iter()
            .find(|p| p.is_match(body))
            .map(|p| format!("message matched banned pattern /{}/", p.as_str()))
    }
}

/// Flags a sender who posts more than `max_messages` within `window` in the
/// same room. A sliding window per (sender, room).
pub struct FloodProtection {
    window: Duration,
    max_messages: usize,
    seen: Mutex<HashMap<(OwnedUserId, OwnedRoomId), VecDeque<Instant>>>,
}

impl FloodProtection {
    pub fn new(window: Duration, max_messages: usize) -> Self {
        Self {
            window,
            max_messages,
            seen: Mutex::new(HashMap::new()),
        }
    }
}

impl Protection for FloodProtection {
    fn name(&self) -> &'static str {
        "flood"
    }

    fn check_message(&self, ctx: &MessageContext<'_>) -> Option<String> {
        let now = Instant::now();
        let key = (ctx.sender.clone(), ctx.room_id.clone());
        let mut seen = self.seen.lock();
        let entries = seen.entry(key).or_default();
        while entries.front().is_some_and(|t| now.duration_since(*t) > self.window) {
            entries.pop_front();
        }
        entries.push_back(now);
        if entries.len() > self.max_messages {
            Some(format!(
                "more than {} messages within {:?}",
                self.max_messages, self.window
            ))
        } else {
            None
        }
    }
}

/// Flags messages mentioning more than `max_mentions` users — a common
/// raid/spam signature.
pub struct MentionLimitProtection {
    max_mentions: usize,
}

impl MentionLimitProtection {
    pub fn new(max_mentions: usize) -> Self {
        Self { max_mentions }
    }
}

impl Protection for MentionLimitProtection {
    fn name(&self) -> &'static str {
        "mention-limit"
    }

    fn check_message(&self, ctx: &MessageContext<'_>) -> Option<String> {
        if ctx.mention_count > self.max_mentions {
            Some(format!("message mentions {} users", ctx.mention_count))
        } else {
            None
        }
    }
}

/// Flags any message carrying an attachment, when configured to disallow
/// media from non-moderators entirely.
pub struct MediaFilterProtection {
    block_media: bool,
}

impl MediaFilterProtection {
    pub fn new(block_media: bool) -> Self {
        Self { block_media }
    }
}

impl Protection for MediaFilterProtection {
    fn name(&self) -> &'static str {
        "media-filter"
    }

    fn check_message(&self, ctx: &MessageContext<'_>) -> Option<String> {
        if self.block_media && ctx.has_media {
            Some("message contains media".to_owned())
        } else {
            None
        }
    }
}

/// Flags a room admitting more than `max_joins` within `window` — the same
/// sliding-window shape as flood protection, keyed by room only.
pub struct JoinRateLimitProtection {
    window: Duration,
    max_joins: usize,
    seen: Mutex<HashMap<OwnedRoomId, VecDeque<Instant>>>,
}

impl JoinRateLimitProtection {
    pub fn new(window: Duration, max_joins: usize) -> Self {
        Self {
            window,
            max_joins,
            seen: Mutex::new(HashMap::new()),
        }
    }
}

impl Protection for JoinRateLimitProtection {
    fn name(&self) -> &'static str {
        "join-rate-limit"
    }

    fn check_join(&self, _user: &OwnedUserId, room: &OwnedRoomId) -> Option<String> {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        let entries = seen.entry(room.clone()).or_default();
        while entries.front().is_some_and(|t| now.duration_since(*t) > self.window) {
            entries.pop_front();
        }
        entries.push_back(now);
        if entries.len() > self.max_joins {
            Some(format!("more than {} joins within {:?}", self.max_joins, self.window))
        } else {
            None
        }
    }
}

/// Flags a joining user whose server name looks like an open-registration
/// throwaway host (heuristic probe named in §4.E; a real deployment would
/// wire this to a server directory, this crate only fixes the shape).
pub struct InsecureRegistrationProbe {
    suspect_servers: Vec<String>,
}

impl InsecureRegistrationProbe {
    pub fn new(suspect_servers: Vec<String>) -> Self {
        Self { suspect_servers }
    }
}

impl Protection for InsecureRegistrationProbe {
    fn name(&self) -> &'static str {
        "insecure-registration"
    }

    fn check_join(&self, user: &OwnedUserId, _room: &OwnedRoomId) -> Option<String> {
        let server = user.server_name().as_str();
        self.suspect_servers
            .iter()
            .any(|s| s == server)
            .then(|| format!("{server} is a known open-registration host"))
    }
}

/// The ordered set of protections consulted for a message or join; the first
/// hit wins, matching the policy-server's "first protection returning a hit
/// fixes the recommendation" rule (§4.H step 2).
#[derive(Default)]
pub struct ProtectionChain {
    protections: Vec<Box<dyn Protection>>,
}

impl ProtectionChain {
    pub fn new(protections: Vec<Box<dyn Protection>>) -> Self {
        Self { protections }
    }

    pub fn check_message(&self, ctx: &MessageContext<'_>) -> Option<(&'static str, String)> {
        self.protections
            .iter()
            .find_map(|p| p.check_message(ctx).map(|reason| (p.name(), reason)))
    }

    pub fn check_join(&self, user: &OwnedUserId, room: &OwnedRoomId) -> Option<(&'static str, String)> {
        self.protections
            .iter()
            .find_map(|p| p.check_join(user, room).map(|reason| (p.name(), reason)))
    }
}

#[cfg(test)]
mod tests {
    use ruma::{room_id, user_id};

    use super::*;

    #[test]
    fn flood_protection_trips_after_threshold() {
        let protection = FloodProtection::new(Duration::from_secs(60), 2);
        let sender = user_id!("@spammer:evil.example").to_owned();
        let room = room_id!("!r:x.example").to_owned();
        let ctx = |sender: &ruma::OwnedUserId, room: &ruma::OwnedRoomId| MessageContext {
            sender,
            room_id: room,
            body: Some("hi"),
            mention_count: 0,
            has_media: false,
        };
        assert!(protection.check_message(&ctx(&sender, &room)).is_none());
        assert!(protection.check_message(&ctx(&sender, &room)).is_none());
        assert!(protection.check_message(&ctx(&sender, &room)).is_some());
    }

    #[test]
    fn bad_word_protection_matches_configured_pattern() {
        let protection = BadWordProtection::new(vec![Regex::new("(?i)buyfollowers").unwrap()]);
        let sender = user_id!("@u:x.example").to_owned();
        let room = room_id!("!r:x.example").to_owned();
        let ctx = MessageContext {
            sender: &sender,
            room_id: &room,
            body: Some("BuyFollowers now!"),
            mention_count: 0,
            has_media: false,
        };
        assert!(protection.check_message(&ctx).is_some());
    }

    #[test]
    fn chain_returns_first_hit_only() {
        let chain = ProtectionChain::new(vec![
            Box::new(MentionLimitProtection::new(1)),
            Box::new(BadWordProtection::new(vec![Regex::new("spam").unwrap()])),
        ]);
        let sender = user_id!("@u:x.example").to_owned();
        let room = room_id!("!r:x.example").to_owned();
        let ctx = MessageContext {
            sender: &sender,
            room_id: &room,
            body: Some("spam spam spam"),
            mention_count: 5,
            has_media: false,
        };
        let (name, _) = chain.check_message(&ctx).unwrap();
        assert_eq!(name, "mention-limit");
    }
}
