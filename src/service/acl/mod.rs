use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::future::join_all;
use ruma::{OwnedRoomId, ServerName};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::{
    homeserver::HomeserverApi,
    service::policy::PolicyStore,
    utils::{glob_to_regex_pattern, is_dynamic_glob},
    Result,
};

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(15);

/// Whether `entity`'s pattern matches the bot's own server name: a literal
/// comparison for exact entities, a compiled glob match for dynamic ones
/// (e.g. `*.x.example` or `*` must also be caught, not just `x.example`).
fn matches_own_server(entity: &str, own_server: &ServerName) -> bool {
    if is_dynamic_glob(entity) {
        regex::Regex::new(&glob_to_regex_pattern(entity))
            .is_ok_and(|pattern| pattern.is_match(own_server.as_str()))
    } else {
        entity == own_server.as_str()
    }
}

/// Deterministically derives a server deny-list from the union of server
/// policies in `list_ids`, skipping any rule whose pattern matches the bot's
/// own server and any rule whose recommendation is unban. Entities are
/// deduplicated (first occurrence wins, matching
/// `PolicyStore::list_server_rules`' insertion order) and the resulting deny
/// list is sorted.
pub fn compile_acl(store: &PolicyStore, list_ids: &[OwnedRoomId], own_server: &ServerName) -> Vec<String> {
    let mut deny: Vec<String> = store
        .list_server_rules(list_ids)
        .into_iter()
        .filter(|rule| rule.recommendation != crate::service::policy::rule::Recommendation::Unban)
        .filter_map(|rule| rule.entity.clone())
        .filter(|entity| !matches_own_server(entity, own_server))
        .collect();
    deny.sort();
    deny.dedup();
    deny
}

pub fn acl_content(deny: &[String]) -> serde_json::Value {
    json!({
        "allow": ["*"],
        "deny": deny,
        "allow_ip_literals": false,
    })
}

/// Serializes ACL recompiles per evaluator and coalesces rapid-fire
/// triggers into a single compile after a quiet period, per the debounce
/// design in the evaluator core.
pub struct Debouncer {
    notify: Arc<Notify>,
    pending: Arc<AtomicBool>,
    quiet_period: Duration,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::with_quiet_period(DEFAULT_DEBOUNCE)
    }

    pub fn with_quiet_period(quiet_period: Duration) -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            pending: Arc::new(AtomicBool::new(false)),
            quiet_period,
        }
    }

    /// Signals that a compile is wanted soon; if one is already pending the
    /// call is a no-op (the prior wait will cover this trigger too).
    pub fn trigger(&self) {
        if !self.pending.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    /// Awaits a trigger, then waits out the quiet period, then clears the
    /// pending flag, returning whether the caller should run a compile.
    /// Intended to run in a loop on a dedicated task per evaluator.
    pub async fn wait_for_compile(&self) {
        self.notify.notified().await;
        tokio::time::sleep(self.quiet_period).await;
        self.pending.store(false, Ordering::SeqCst);
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends the compiled ACL to every protected room whose cached deny list
/// differs, skipping rooms with `apply_acl=false`. Sends fan out across
/// rooms in parallel; failures are reported per room and do not block the
/// rest.
pub async fn update_acl(
    homeserver: &dyn HomeserverApi,
    rooms: &[(OwnedRoomId, bool, Vec<String>)],
    deny: &[String],
) -> Vec<(OwnedRoomId, Result<()>)> {
    let content = acl_content(deny);
    let sends = rooms
        .iter()
        .filter(|(_, apply_acl, cached_deny)| *apply_acl && cached_deny.as_slice() != deny)
        .map(|(room_id, ..)| async {
            let outcome = homeserver
                .send_state_event(room_id, "m.room.server_acl", "", content.clone())
                .await;
            if let Err(e) = &outcome {
                warn!(%room_id, error = %e, "ACL update failed");
            } else {
                info!(%room_id, "ACL updated");
            }
            (room_id.clone(), outcome)
        });
    join_all(sends).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_compile_honors_custom_quiet_period() {
        let debouncer = Debouncer::with_quiet_period(Duration::from_millis(20));
        debouncer.trigger();
        let start = tokio::time::Instant::now();
        debouncer.wait_for_compile().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn rapid_triggers_coalesce_into_one_pending_compile() {
        let debouncer = Debouncer::with_quiet_period(Duration::from_millis(5));
        debouncer.trigger();
        debouncer.trigger();
        debouncer.trigger();
        debouncer.wait_for_compile().await;
        assert!(!debouncer.pending.load(Ordering::SeqCst));
    }

    #[test]
    fn compile_acl_is_empty_with_no_server_rules() {
        use ruma::{room_id, ServerName};

        use crate::service::policy::PolicyStore;

        let store = PolicyStore::new(vec![]);
        let list_id = room_id!("!list:x.example").to_owned();
        let own_server = <&ServerName>::try_from("x.example").unwrap();
        let deny = compile_acl(&store, &[list_id], own_server);
        assert!(deny.is_empty());
    }

    #[test]
    fn matches_own_server_catches_a_dynamic_pattern_not_just_the_literal() {
        use ruma::ServerName;

        let own_server = <&ServerName>::try_from("foo.x.example").unwrap();
        assert!(matches_own_server("*.x.example", own_server));
        assert!(matches_own_server("*", own_server));
        assert!(matches_own_server("foo.x.example", own_server));
        assert!(!matches_own_server("*.y.example", own_server));
        assert!(!matches_own_server("bar.x.example", own_server));
    }

    #[test]
    fn compile_acl_skips_a_dynamic_rule_matching_the_bot_own_server() {
        use ruma::{room_id, user_id, MilliSecondsSinceUnixEpoch, ServerName};
        use serde_json::json;

        use crate::service::policy::{store::PolicyEvent, PolicyStore};

        let store = PolicyStore::new(vec![]);
        let list_id = room_id!("!list:x.example").to_owned();
        let own_server = <&ServerName>::try_from("foo.x.example").unwrap();

        let server_rule_event = |state_key: &str, event_id_str: &'static str, entity: &str| PolicyEvent {
            event_type: "m.policy.rule.server".to_owned(),
            policy_room_id: list_id.clone(),
            state_key: state_key.to_owned(),
            event_id: ruma::OwnedEventId::try_from(event_id_str).unwrap(),
            sender: user_id!("@admin:x.example").to_owned(),
            timestamp: MilliSecondsSinceUnixEpoch::now(),
            content: serde_json::value::to_raw_value(&json!({ "entity": entity, "recommendation": "m.ban" })).unwrap(),
        };

        store.update(&server_rule_event("sk1", "$a:x.example", "*.x.example"));
        store.update(&server_rule_event("sk2", "$b:x.example", "bad.example"));

        let deny = compile_acl(&store, &[list_id], own_server);
        assert_eq!(deny, vec!["bad.example".to_owned()]);
    }
}
