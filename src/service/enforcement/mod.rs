use std::sync::Arc;

use ruma::{OwnedRoomId, OwnedUserId};
use tracing::{info, warn};

use crate::{
    homeserver::HomeserverApi,
    service::{
        action_log::{self, ActionType},
        policy::RuleRef,
    },
    Result,
};

const NO_REASON_PLACEHOLDER: &str = "<no reason supplied>";

/// Ban, unban, redact-user and reject-pending-invite actions, each
/// idempotent via the action log. Dry-run is threaded as a parameter into
/// every side-effecting call rather than checked deep inside handlers.
pub struct Service {
    pub homeserver: Arc<dyn HomeserverApi>,
    pub action_log: &'static action_log::Service,
}

fn display_reason(reason: &str) -> &str {
    if reason.is_empty() {
        NO_REASON_PLACEHOLDER
    } else {
        reason
    }
}

impl Service {
    #[tracing::instrument(skip(self, rule))]
    pub async fn apply_ban(
        &self,
        user: &OwnedUserId,
        room: &OwnedRoomId,
        rule: &RuleRef,
        management_room: &OwnedRoomId,
        dry_run: bool,
    ) -> Result<()> {
        let reason = display_reason(&rule.reason);

        if !dry_run {
            if let Err(e) = self.homeserver.ban(room, user, reason).await {
                warn!(%user, %room, error = %e, "ban failed");
                let _ = self
                    .homeserver
                    .send_notice(management_room, &format!("Failed to ban {user} in {room}: {e}"))
                    .await;
                return Ok(());
            }
        }

        self.action_log.record_action(
            user,
            room,
            ActionType::Ban,
            &rule.policy_room_id,
            rule.entity.as_deref().unwrap_or_default(),
            format!("{:?}", rule.recommendation).as_str(),
        )?;

        if !dry_run {
            let _ = self
                .homeserver
                .send_notice(room, &format!("Banned {user} in {room}: {reason}"))
                .await;
        }

        info!(%user, %room, "ban applied");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn undo_ban(&self, user: &OwnedUserId, room: &OwnedRoomId, dry_run: bool) -> Result<()> {
        if !self
            .action_log
            .has_action(user, room, ActionType::Ban)?
        {
            return Ok(());
        }

        if !dry_run {
            self.homeserver.unban(room, user).await?;
        }

        self.action_log.remove_action(user, room, ActionType::Ban)?;
        info!(%user, %room, "ban lifted");
        Ok(())
    }

    /// Redacts a user's recent messages in a set of rooms. Strategy 3
    /// (paginate recent history) is the only one this crate ships a body
    /// for; strategies 1 and 2 are homeserver-capability upgrades the
    /// `HomeserverApi` trait leaves room for without committing this crate
    /// to a specific backend.
    #[tracing::instrument(skip(self, rooms))]
    pub async fn redact_user(
        &self,
        user: &OwnedUserId,
        rooms: &[OwnedRoomId],
        reason: &str,
        dry_run: bool,
    ) -> Result<()> {
        if dry_run {
            return Ok(());
        }

        const TWENTY_FOUR_HOURS_MS: u64 = 24 * 60 * 60 * 1000;
        let since = crate::utils::millis_since_unix_epoch().saturating_sub(TWENTY_FOUR_HOURS_MS);

        for room in rooms {
            let event_ids = self
                .homeserver
                .recent_events_by_sender(room, user, since)
                .await?;
            for event_id in event_ids {
                if let Err(e) = self.homeserver.redact_event(room, &event_id, reason).await {
                    warn!(%event_id, error = %e, "redaction failed");
                }
            }
            self.action_log.record_action(
                user,
                room,
                ActionType::Redact,
                room,
                user.as_str(),
                reason,
            )?;
        }
        Ok(())
    }

    /// Drains pending invites from `inviter`, confirming each hasn't already
    /// been accepted before having the invitee's puppet leave. Returns the
    /// count handled, for the management-room report.
    #[tracing::instrument(skip(self, pending))]
    pub async fn reject_pending_invites(
        &self,
        inviter: &OwnedUserId,
        pending: Vec<(OwnedUserId, OwnedRoomId)>,
        dry_run: bool,
    ) -> Result<usize> {
        let mut count = 0;
        for (invitee, room) in pending {
            if dry_run {
                count += 1;
                continue;
            }
            match self.homeserver.leave_room_as(&room, &invitee).await {
                Ok(()) => count += 1,
                Err(e) => warn!(%inviter, %invitee, %room, error = %e, "reject pending invite failed"),
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use ruma::{room_id, user_id, OwnedEventId};

    use super::*;
    use crate::{
        homeserver::{HomeserverApi, MessagesPage, MinimalStateEvent},
        service::{
            action_log::ActionRecord,
            policy::rule::{EntityKind, EventQuality, Recommendation, Rule},
        },
        Error,
    };

    #[derive(Default)]
    struct FakeHomeserver {
        ban_fails: bool,
        notices: StdMutex<Vec<(OwnedRoomId, String)>>,
    }

    #[async_trait]
    impl HomeserverApi for FakeHomeserver {
        async fn ban(&self, _room_id: &OwnedRoomId, _user_id: &OwnedUserId, _reason: &str) -> Result<()> {
            if self.ban_fails {
                Err(Error::BadServerResponse("homeserver unreachable"))
            } else {
                Ok(())
            }
        }
        async fn unban(&self, _room_id: &OwnedRoomId, _user_id: &OwnedUserId) -> Result<()> {
            Ok(())
        }
        async fn kick(&self, _room_id: &OwnedRoomId, _user_id: &OwnedUserId, _reason: &str) -> Result<()> {
            Ok(())
        }
        async fn redact_event(&self, _room_id: &OwnedRoomId, _event_id: &OwnedEventId, _reason: &str) -> Result<()> {
            Ok(())
        }
        async fn send_state_event(&self, _room_id: &OwnedRoomId, _event_type: &str, _state_key: &str, _content: serde_json::Value) -> Result<()> {
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
            self.notices.lock().unwrap().push((room_id.clone(), markdown_body.to_owned()));
            Ok(())
        }
        async fn join_room(&self, _room_id: &OwnedRoomId) -> Result<()> {
            Ok(())
        }
        async fn leave_room_as(&self, _room_id: &OwnedRoomId, _user_id: &OwnedUserId) -> Result<()> {
            Ok(())
        }
        async fn messages_page(&self, _room_id: &OwnedRoomId, _from: Option<&str>) -> Result<MessagesPage> {
            Ok(MessagesPage { events: Vec::new(), end: None })
        }
        async fn recent_events_by_sender(&self, _room_id: &OwnedRoomId, _sender: &OwnedUserId, _since_ms: u64) -> Result<Vec<OwnedEventId>> {
            Ok(Vec::new())
        }
        async fn whoami(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeActionLogData {
        puts: StdMutex<usize>,
    }

    impl action_log::Data for FakeActionLogData {
        fn put(&self, _record: &ActionRecord) -> Result<()> {
            *self.puts.lock().unwrap() += 1;
            Ok(())
        }
        fn delete(&self, _target_user: &OwnedUserId, _in_room_id: &OwnedRoomId, _action_type: ActionType) -> Result<()> {
            Ok(())
        }
        fn get(&self, _target_user: &OwnedUserId, _in_room_id: &OwnedRoomId, _action_type: ActionType) -> Result<Option<ActionRecord>> {
            Ok(None)
        }
        fn get_all_by_policy_list(&self, _policy_room_id: &OwnedRoomId, _rooms: &[OwnedRoomId]) -> Result<Vec<ActionRecord>> {
            Ok(Vec::new())
        }
        fn get_all_by_rule_entity(&self, _rule_entity: &str, _rooms: &[OwnedRoomId]) -> Result<Vec<ActionRecord>> {
            Ok(Vec::new())
        }
        fn get_all_by_target_user(&self, _target_user: &OwnedUserId, _rooms: &[OwnedRoomId]) -> Result<Vec<ActionRecord>> {
            Ok(Vec::new())
        }
    }

    fn test_rule() -> RuleRef {
        RuleRef::new(
            Rule::new(
                EntityKind::User,
                Some("@bad:evil.example".to_owned()),
                None,
                Some(Recommendation::Ban),
                "spam".to_owned(),
                user_id!("@admin:x.example").to_owned(),
                ruma::MilliSecondsSinceUnixEpoch::now(),
                room_id!("!L:x.example").to_owned(),
                "sk1".to_owned(),
                ruma::event_id!("$a:x.example").to_owned(),
                EventQuality::Stable,
            )
            .unwrap(),
        )
    }

    /// A failed ban must notice the management room, and must not write an
    /// action record for an action that didn't happen.
    #[tokio::test]
    async fn apply_ban_failure_notices_management_room_and_skips_action_log() {
        let homeserver = Arc::new(FakeHomeserver {
            ban_fails: true,
            ..Default::default()
        });
        let action_log_data: &'static dyn action_log::Data = Box::leak(Box::new(FakeActionLogData::default()));
        let action_log: &'static action_log::Service = Box::leak(Box::new(action_log::Service { db: action_log_data }));
        let service = Service {
            homeserver: homeserver.clone(),
            action_log,
        };

        let user = user_id!("@bad:evil.example").to_owned();
        let room = room_id!("!R:y.example").to_owned();
        let management_room = room_id!("!M:x.example").to_owned();
        let rule = test_rule();

        service.apply_ban(&user, &room, &rule, &management_room, false).await.unwrap();

        assert_eq!(*action_log_data.puts.lock().unwrap(), 0);
        let notices = homeserver.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, management_room);
        assert!(notices[0].1.contains(user.as_str()));
    }
}
