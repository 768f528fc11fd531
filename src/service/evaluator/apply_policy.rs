use ruma::OwnedUserId;
use tracing::info;

use crate::service::policy::{list::Match, rule::Recommendation};

use super::Evaluator;

/// What triggered this evaluation: a brand-new rule firing for the first
/// time, versus a re-evaluation of a member who was already present (e.g.
/// after an unban tombstone, or a list being watched again).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    NewRule,
    ReEvaluation,
}

impl Evaluator {
    /// The ApplyPolicy algorithm (§4.E): given a user and the aggregated
    /// `Match` against every list this evaluator watches, decide and carry
    /// out enforcement.
    pub async fn apply_policy(&self, user: &OwnedUserId, matched: &Match, trigger: Trigger) {
        if user == &self.bot_user_id {
            return;
        }

        let rooms_present = self.member_index.read().unwrap().rooms_for(user).to_vec();
        if rooms_present.is_empty() && trigger == Trigger::ReEvaluation {
            return;
        }

        let recommendation = matched.recommendations().ban_or_unban;

        if let Some(rule) = &recommendation {
            if rule.recommendation == Recommendation::Ban || rule.recommendation == Recommendation::Takedown {
                for room in &rooms_present {
                    if let Err(e) = self.enforcement.apply_ban(user, room, rule, &self.management_room, self.config.dry_run).await {
                        tracing::warn!(%user, %room, error = %e, "ApplyPolicy: ban failed");
                    }
                }

                let auto_redact = self
                    .config
                    .auto_redact_patterns
                    .iter()
                    .any(|p| p.is_match(&rule.reason));
                if rule.recommendation == Recommendation::Takedown || auto_redact {
                    if let Err(e) = self
                        .enforcement
                        .redact_user(user, &rooms_present, &rule.reason, self.config.dry_run)
                        .await
                    {
                        tracing::warn!(%user, error = %e, "ApplyPolicy: redact_user failed");
                    }
                }
            }

            if trigger == Trigger::NewRule {
                self.reject_pending_invites_for(user).await;
            }

            // Unban semantics (§9): a fresh unban rule never lifts an existing
            // ban on its own; only explicit admin commands do.
            if rule.recommendation == Recommendation::Unban {
                info!(%user, "ApplyPolicy: unban rule observed, no automatic action taken");
            }
        }
    }
}
