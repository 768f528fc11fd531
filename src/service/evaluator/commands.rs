use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use tracing::warn;

use super::Evaluator;
use crate::{
    service::policy::rule::{EntityKind, Recommendation},
    utils::sha256_hex,
};

/// One parsed `!meowlnir` management command (§4.E admin surface).
pub enum Command {
    Ban {
        shortcode: String,
        entity: String,
        reason: String,
    },
    Unban {
        shortcode: String,
        entity: String,
    },
    Watch {
        room: OwnedRoomId,
        shortcode: Option<String>,
    },
    Unwatch {
        shortcode: String,
    },
    Protect {
        room: OwnedRoomId,
    },
    Unprotect {
        room: OwnedRoomId,
    },
    List,
}

fn entity_kind_from_event_type(event_type: &str) -> &'static str {
    match event_type {
        "m.policy.rule.room" => "room",
        "m.policy.rule.server" => "server",
        _ => "user",
    }
}

impl Evaluator {
    /// Parses `!meowlnir <verb> ...` text into a `Command`, tolerating extra
    /// whitespace. Returns `None` for anything that isn't addressed to this
    /// bot or doesn't parse.
    pub fn parse_command(body: &str) -> Option<Command> {
        let rest = body.trim().strip_prefix("!meowlnir")?.trim();
        let mut parts = rest.splitn(2, char::is_whitespace);
        let verb = parts.next()?;
        let argstr = parts.next().unwrap_or("").trim();

        match verb {
            "ban" => {
                let mut args = argstr.splitn(3, char::is_whitespace);
                let shortcode = args.next()?.to_owned();
                let entity = args.next()?.to_owned();
                let reason = args.next().unwrap_or("").trim().to_owned();
                Some(Command::Ban { shortcode, entity, reason })
            }
            "unban" => {
                let mut args = argstr.splitn(2, char::is_whitespace);
                let shortcode = args.next()?.to_owned();
                let entity = args.next()?.trim().to_owned();
                Some(Command::Unban { shortcode, entity })
            }
            "watch" => {
                let mut args = argstr.splitn(2, char::is_whitespace);
                let room = args.next()?.try_into().ok()?;
                let shortcode = args.next().map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned);
                Some(Command::Watch { room, shortcode })
            }
            "unwatch" => Some(Command::Unwatch {
                shortcode: argstr.to_owned(),
            }),
            "protect" => Some(Command::Protect {
                room: argstr.try_into().ok()?,
            }),
            "unprotect" => Some(Command::Unprotect {
                room: argstr.try_into().ok()?,
            }),
            "list" => Some(Command::List),
            _ => None,
        }
    }

    /// Entry point for an `!meowlnir` message in the management room;
    /// non-admins are told no and nothing runs.
    pub async fn handle_command(&self, sender: &OwnedUserId, body: &str) -> Option<String> {
        if !body.trim_start().starts_with("!meowlnir") {
            return None;
        }
        if !self.is_admin(sender) {
            return Some("You don't have permission to run commands here.".to_owned());
        }
        let Some(command) = Self::parse_command(body) else {
            return Some("Unrecognized command. Try: ban, unban, watch, unwatch, protect, unprotect, list.".to_owned());
        };
        Some(self.run_command(command).await)
    }

    async fn run_command(&self, command: Command) -> String {
        match command {
            Command::Ban { shortcode, entity, reason } => {
                match self.issue_rule(&shortcode, EntityKind::User, &entity, Recommendation::Ban, &reason).await {
                    Ok(()) => format!("Banned {entity} via list {shortcode}."),
                    Err(e) => format!("Failed to ban: {e}"),
                }
            }
            Command::Unban { shortcode, entity } => {
                match self.issue_rule(&shortcode, EntityKind::User, &entity, Recommendation::Unban, "unbanned by admin").await {
                    Ok(()) => format!("Unbanned {entity} via list {shortcode}."),
                    Err(e) => format!("Failed to unban: {e}"),
                }
            }
            Command::Watch { room, shortcode } => {
                if let Err(e) = self.homeserver.join_room(&room).await {
                    return format!("Failed to join policy room {room}: {e}");
                }
                format!(
                    "Joined {room}. Add it to the watched_lists config event with shortcode {} to start watching.",
                    shortcode.unwrap_or_else(|| "<none>".to_owned())
                )
            }
            Command::Unwatch { shortcode } => {
                if self.watched_list(&shortcode).is_none() {
                    format!("No watched list with shortcode {shortcode}.")
                } else {
                    format!("Remove {shortcode} from the watched_lists config event to stop watching it.")
                }
            }
            Command::Protect { room } => {
                self.try_protecting_room(&room, true, true).await;
                format!("Attempting to protect {room}.")
            }
            Command::Unprotect { room } => {
                self.registry.claim_protected(&room, &self.management_room, false);
                format!("No longer protecting {room}.")
            }
            Command::List => self.render_status(),
        }
    }

    fn render_status(&self) -> String {
        let lists = self.watched_list_ids();
        let rooms = self.protected_room_ids();
        format!(
            "Watching {} list(s), protecting {} room(s).",
            lists.len(),
            rooms.len()
        )
    }

    /// Shared by admin ban/unban commands and `HandleReport`'s `/ban`
    /// shortcut: writes a new policy rule into the list's room. The store
    /// itself updates only once the event round-trips back through the
    /// dispatcher, matching how a real policy room behaves.
    pub async fn issue_rule(
        &self,
        shortcode: &str,
        entity_type: EntityKind,
        entity: &str,
        recommendation: Recommendation,
        reason: &str,
    ) -> Result<(), String> {
        let list = self
            .watched_list(shortcode)
            .ok_or_else(|| format!("no watched list with shortcode {shortcode}"))?;

        let list_ids = [list.room_id.clone()];
        let existing = match entity_type {
            EntityKind::User => self.store.match_user(&list_ids, entity),
            EntityKind::Room => self.store.match_room(&list_ids, entity),
            EntityKind::Server => self.store.match_server(&list_ids, entity),
        };
        if recommendation != Recommendation::Unban {
            if let Some(rule) = existing.recommendations().ban_or_unban {
                if rule.recommendation == Recommendation::Unban {
                    return Err("an unban recommendation is already in place for this entity".to_owned());
                }
            }
        }

        let event_type = match entity_type {
            EntityKind::User => "m.policy.rule.user",
            EntityKind::Room => "m.policy.rule.room",
            EntityKind::Server => "m.policy.rule.server",
        };
        let state_key = format!("rule:{}:{}", entity_kind_from_event_type(event_type), sha256_hex(entity.as_bytes()));
        let recommendation_str = match recommendation {
            Recommendation::Ban => "m.ban",
            Recommendation::Unban => "m.unban",
            Recommendation::Takedown => "m.takedown",
            Recommendation::Other => "m.ban",
        };
        let content = serde_json::json!({
            "entity": entity,
            "recommendation": recommendation_str,
            "reason": reason,
        });

        self.homeserver
            .send_state_event(&list.room_id, event_type, &state_key, content)
            .await
            .map_err(|e| e.to_string())
    }

    /// `HandleReport`: surfaces the report, and when the reporter is an
    /// admin and the reason is a `/ban <shortcode> <text>` shortcut, issues
    /// the ban directly.
    pub async fn handle_report(
        &self,
        sender: &OwnedUserId,
        target_user: &OwnedUserId,
        room: &OwnedRoomId,
        event: &OwnedEventId,
        reason: &str,
    ) {
        if self.config.notify_management_room {
            let notice = format!("Report from {sender} against {target_user} in {room} (event {event}): {reason}");
            if let Err(e) = self.homeserver.send_notice(&self.management_room, &notice).await {
                warn!(error = %e, "failed to forward report to management room");
            }
        }

        if !self.is_admin(sender) {
            return;
        }

        let Some(rest) = reason.strip_prefix("/ban ") else {
            return;
        };
        let mut args = rest.splitn(2, char::is_whitespace);
        let Some(shortcode) = args.next() else { return };
        let text = args.next().unwrap_or("").trim();

        if let Err(e) = self
            .issue_rule(shortcode, EntityKind::User, target_user.as_str(), Recommendation::Ban, text)
            .await
        {
            warn!(%target_user, error = %e, "report-triggered ban failed");
            if self.config.notify_management_room {
                let _ = self
                    .homeserver
                    .send_notice(&self.management_room, &format!("Failed to ban via report shortcut: {e}"))
                    .await;
            }
        }
    }
}
