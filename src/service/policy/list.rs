use std::collections::HashMap;

use regex::Regex;

use super::rule::{EventQuality, Recommendation, Rule, RuleRef};
use crate::utils::glob_to_regex_pattern;

/// All rules matching an entity, in the contract order: exact hits, then
/// hash hits, then dynamic-list traversal order, with no duplicates.
#[derive(Default, Clone)]
pub struct Match {
    pub rules: Vec<RuleRef>,
}

impl Match {
    fn push_unique(&mut self, rule: &RuleRef) {
        if !self.rules.iter().any(|r| std::sync::Arc::ptr_eq(r, rule)) {
            self.rules.push(rule.clone());
        }
    }

    /// Aggregates a match into a single ban/unban decision: the first rule
    /// (in insertion/traversal order) whose recommendation is ban, unban or
    /// takedown wins.
    pub fn recommendations(&self) -> Recommendations {
        let ban_or_unban = self
            .rules
            .iter()
            .find(|r| !r.ignored && r.recommendation.is_ban_family())
            .cloned();
        Recommendations { ban_or_unban }
    }
}

pub struct Recommendations {
    pub ban_or_unban: Option<RuleRef>,
}

struct DynamicEntry {
    rule: RuleRef,
    pattern: Regex,
}

/// Per-entity-kind indexed collection of rules for one policy room.
#[derive(Default)]
pub struct RuleList {
    by_state_key: HashMap<String, RuleRef>,
    by_entity: HashMap<String, Vec<RuleRef>>,
    by_entity_hash: HashMap<[u8; 32], Vec<RuleRef>>,
    dynamic: Vec<DynamicEntry>,
}

impl RuleList {
    pub fn new() -> Self {
        Self::default()
    }

    fn unindex(&mut self, rule: &RuleRef) {
        if let Some(entity) = &rule.entity {
            if let Some(bucket) = self.by_entity.get_mut(entity) {
                bucket.retain(|r| !std::sync::Arc::ptr_eq(r, rule));
                if bucket.is_empty() {
                    self.by_entity.remove(entity);
                }
            }
        }
        if let Some(hash) = &rule.entity_hash {
            if let Some(bucket) = self.by_entity_hash.get_mut(hash) {
                bucket.retain(|r| !std::sync::Arc::ptr_eq(r, rule));
                if bucket.is_empty() {
                    self.by_entity_hash.remove(hash);
                }
            }
        }
        if rule.dynamic {
            self.dynamic.retain(|entry| !std::sync::Arc::ptr_eq(&entry.rule, rule));
        }
    }

    fn index(&mut self, rule: RuleRef) {
        if let Some(entity) = &rule.entity {
            if rule.dynamic {
                let pattern = Regex::new(&glob_to_regex_pattern(entity))
                    .expect("glob_to_regex_pattern always produces a valid regex");
                self.dynamic.insert(
                    0,
                    DynamicEntry {
                        rule: rule.clone(),
                        pattern,
                    },
                );
            } else {
                self.by_entity
                    .entry(entity.clone())
                    .or_default()
                    .push(rule.clone());
            }
        }
        if let Some(hash) = rule.entity_hash {
            self.by_entity_hash.entry(hash).or_default().push(rule.clone());
        }
    }

    /// Adds a rule, returning the previous rule at this state_key (if any
    /// quality-displaced) and whether the new rule was actually stored.
    pub fn add(&mut self, rule: Rule) -> (Option<RuleRef>, bool) {
        let state_key = rule.state_key.clone();
        let new_rule = RuleRef::new(rule);

        if let Some(existing) = self.by_state_key.get(&state_key) {
            if existing.event_quality > new_rule.event_quality {
                return (None, false);
            }
            let previous = existing.clone();
            self.unindex(&previous);
            self.index(new_rule.clone());
            self.by_state_key.insert(state_key, new_rule);
            return (Some(previous), true);
        }

        self.index(new_rule.clone());
        self.by_state_key.insert(state_key, new_rule);
        (None, true)
    }

    /// Removes the rule at `state_key` if it was created by `event_quality`;
    /// a no-op otherwise (a removal from a lower-quality source cannot
    /// displace a higher-quality rule still in effect).
    pub fn remove(&mut self, event_quality: EventQuality, state_key: &str) -> Option<RuleRef> {
        let existing = self.by_state_key.get(state_key)?;
        if existing.event_quality != event_quality {
            return None;
        }
        let removed = self.by_state_key.remove(state_key)?;
        self.unindex(&removed);
        Some(removed)
    }

    pub fn match_entity(&self, entity: &str) -> Match {
        let mut result = Match::default();
        if let Some(bucket) = self.by_entity.get(entity) {
            for rule in bucket {
                result.push_unique(rule);
            }
        }
        for entry in &self.dynamic {
            if entry.rule.matches_glob(&entry.pattern, entity) {
                result.push_unique(&entry.rule);
            }
        }
        result
    }

    pub fn match_hash(&self, hash: &[u8; 32]) -> Match {
        let mut result = Match::default();
        if let Some(bucket) = self.by_entity_hash.get(hash) {
            for rule in bucket {
                result.push_unique(rule);
            }
        }
        result
    }

    /// Combined lookup matching both the literal entity and its hash, the
    /// operation `Match` actually needs for live enforcement.
    pub fn match_all(&self, entity: &str, entity_hash: &[u8; 32]) -> Match {
        let mut result = Match::default();
        if let Some(bucket) = self.by_entity.get(entity) {
            for rule in bucket {
                result.push_unique(rule);
            }
        }
        if let Some(bucket) = self.by_entity_hash.get(entity_hash) {
            for rule in bucket {
                result.push_unique(rule);
            }
        }
        for entry in &self.dynamic {
            if entry.rule.matches_glob(&entry.pattern, entity) {
                result.push_unique(&entry.rule);
            }
        }
        result
    }

    pub fn match_exact(&self, entity: &str) -> Option<&[RuleRef]> {
        self.by_entity.get(entity).map(Vec::as_slice)
    }

    pub fn search(&self, pattern_text: &str) -> Vec<RuleRef> {
        self.dynamic
            .iter()
            .filter(|entry| entry.pattern.as_str().contains(pattern_text))
            .map(|entry| entry.rule.clone())
            .collect()
    }

    pub fn rules(&self) -> impl Iterator<Item = &RuleRef> {
        self.by_state_key.values()
    }

    pub fn rule_for_state_key(&self, state_key: &str) -> Option<&RuleRef> {
        self.by_state_key.get(state_key)
    }

    pub fn len(&self) -> usize {
        self.by_state_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_state_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{event_id, room_id, user_id, MilliSecondsSinceUnixEpoch};

    use super::*;
    use crate::service::policy::rule::EntityKind;

    fn make_rule(state_key: &str, entity: &str, recommendation: Recommendation) -> Rule {
        Rule::new(
            EntityKind::User,
            Some(entity.to_owned()),
            None,
            Some(recommendation),
            "spam".to_owned(),
            user_id!("@admin:x.example").to_owned(),
            MilliSecondsSinceUnixEpoch::now(),
            room_id!("!L:x.example").to_owned(),
            state_key.to_owned(),
            event_id!("$a:x.example").to_owned(),
            EventQuality::Stable,
        )
        .unwrap()
    }

    #[test]
    fn exact_rule_is_indexed_by_state_key_and_entity() {
        let mut list = RuleList::new();
        let rule = make_rule("sk1", "@bad:evil.example", Recommendation::Ban);
        let (prev, stored) = list.add(rule);
        assert!(prev.is_none());
        assert!(stored);
        assert_eq!(
            list.rule_for_state_key("sk1").unwrap().entity.as_deref(),
            Some("@bad:evil.example")
        );
        assert_eq!(list.match_entity("@bad:evil.example").rules.len(), 1);
    }

    #[test]
    fn add_then_remove_restores_prior_state() {
        let mut list = RuleList::new();
        let rule = make_rule("sk1", "@bad:evil.example", Recommendation::Ban);
        list.add(rule);
        let removed = list.remove(EventQuality::Stable, "sk1");
        assert!(removed.is_some());
        assert!(list.is_empty());
        assert!(list.match_entity("@bad:evil.example").rules.is_empty());
    }

    #[test]
    fn glob_rule_matches_dynamically_but_not_unrelated_entities() {
        let mut list = RuleList::new();
        list.add(make_rule("sk1", "@*:evil.example", Recommendation::Ban));
        assert_eq!(list.match_entity("@newcomer:evil.example").rules.len(), 1);
        assert!(list.match_entity("@user:good.example").rules.is_empty());
    }

    #[test]
    fn lower_quality_event_cannot_displace_stable_rule() {
        let mut list = RuleList::new();
        list.add(make_rule("sk1", "@bad:evil.example", Recommendation::Ban));
        let mut legacy = make_rule("sk1", "@bad:evil.example", Recommendation::Unban);
        legacy.event_quality = EventQuality::Legacy;
        let (prev, stored) = list.add(legacy);
        assert!(prev.is_none());
        assert!(!stored);
        assert_eq!(
            list.rule_for_state_key("sk1").unwrap().recommendation,
            Recommendation::Ban
        );
    }

    #[test]
    fn recommendations_prefer_first_ban_family_rule_seen() {
        let mut list = RuleList::new();
        list.add(make_rule("sk1", "@bad:evil.example", Recommendation::Ban));
        let m = list.match_entity("@bad:evil.example");
        let recs = m.recommendations();
        assert_eq!(recs.ban_or_unban.unwrap().recommendation, Recommendation::Ban);
    }
}
