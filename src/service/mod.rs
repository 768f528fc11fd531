pub mod acl;
pub mod action_log;
pub mod dispatcher;
pub mod enforcement;
pub mod evaluator;
pub mod globals;
pub mod policy;
pub mod policyserver;
pub mod protections;
pub mod rooms;

use std::{sync::Arc, time::Duration};

use regex::Regex;
use tracing::warn;

use crate::{
    db::Pool,
    homeserver::HomeserverApi,
    service::{
        evaluator::{Evaluator, EvaluatorConfig},
        protections::{BadWordProtection, FloodProtection, JoinRateLimitProtection, MediaFilterProtection, MentionLimitProtection, ProtectionChain},
    },
    Config, Result,
};

/// Everything the process needs that outlives a single request. Built once
/// at startup and leaked to `'static` (the teacher's singleton shape, kept).
/// Unlike the teacher's `Services`, this one does *not* own the
/// per-management-room `Evaluator`s directly: those borrow `'static`
/// references out of this struct's fields, so they can only be constructed
/// (and registered with `dispatcher`) once `Services` itself is `'static` —
/// see `build_evaluators` below.
pub struct Services {
    pub globals: globals::Service,
    pub policy_store: &'static policy::PolicyStore,
    pub action_log: &'static action_log::Service,
    pub registry: &'static rooms::ProtectedRoomRegistry,
    pub enforcement: &'static enforcement::Service,
    pub policyserver: policyserver::Service,
    pub dispatcher: dispatcher::Dispatcher,
    pub db: &'static Pool,
}

impl Services {
    /// Builds every process-wide component except the evaluators
    /// themselves; `homeserver` is the shared collaborator every downstream
    /// service calls out through.
    pub fn build(config: Config, db: &'static Pool, homeserver: Arc<dyn HomeserverApi>) -> Result<Self> {
        let policy_store: &'static policy::PolicyStore = Box::leak(Box::new(policy::PolicyStore::new(config.rule_filter.clone())));

        let action_log_data: &'static dyn action_log::Data = Box::leak(Box::new(action_log::SqliteData::new(db)));
        let action_log: &'static action_log::Service = Box::leak(Box::new(action_log::Service { db: action_log_data }));

        let registry: &'static rooms::ProtectedRoomRegistry = Box::leak(Box::new(rooms::ProtectedRoomRegistry::new()));

        let enforcement: &'static enforcement::Service = Box::leak(Box::new(enforcement::Service {
            homeserver: homeserver.clone(),
            action_log,
        }));

        let policyserver_data: &'static dyn policyserver::Data = Box::leak(Box::new(policyserver::SqliteData { pool: db }));
        let policyserver = policyserver::Service::new(policyserver_data);

        let globals = globals::Service::load(config)?;
        let dispatcher = dispatcher::Dispatcher::new(policy_store);

        Ok(Self {
            globals,
            policy_store,
            action_log,
            registry,
            enforcement,
            policyserver,
            dispatcher,
            db,
        })
    }
}

/// Builds the default protection chain. The `BadWordProtection` patterns
/// are shared with `auto_redact_patterns` — a message matching the same
/// text a list's auto-redact rule would flag is worth stopping before it's
/// even posted, not just cleaned up after the fact.
fn default_protection_chain(auto_redact_patterns: &[Regex]) -> ProtectionChain {
    ProtectionChain::new(vec![
        Box::new(BadWordProtection::new(auto_redact_patterns.to_vec())),
        Box::new(FloodProtection::new(Duration::from_secs(10), 10)),
        Box::new(MentionLimitProtection::new(20)),
        Box::new(MediaFilterProtection::new(false)),
        Box::new(JoinRateLimitProtection::new(Duration::from_secs(60), 30)),
    ])
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(pattern = %p, error = %e, "invalid auto_redact_patterns entry, skipping");
                None
            }
        })
        .collect()
}

/// Constructs and registers one `Evaluator` per configured management room,
/// runs its `Load`, and spawns its ACL-debounce loop. Call once `services`
/// is `'static` — every evaluator borrows `'static` references out of it.
pub async fn build_evaluators(services: &'static Services, homeserver: Arc<dyn HomeserverApi>) {
    let config = services.globals.config.clone();
    for room in &config.management_rooms {
        let bot_user_id = match format!("@{}:{}", config.appservice.sender_localpart, config.server_name).as_str().try_into() {
            Ok(id) => id,
            Err(e) => {
                warn!(error = ?e, "malformed appservice sender_localpart, skipping management room");
                continue;
            }
        };

        let auto_redact_patterns = compile_patterns(&config.auto_redact_patterns);
        let protections = default_protection_chain(&auto_redact_patterns);
        let evaluator_config = EvaluatorConfig {
            dry_run: config.dry_run,
            filter_local_invites: config.filter_local_invites,
            auto_reject_invites_token: config.auto_reject_invites_token.clone(),
            notify_management_room: config.notify_management_room,
            auto_redact_patterns,
            rule_filter: config.rule_filter.clone(),
            acl_debounce_secs: config.acl_debounce_secs,
        };

        let evaluator = Arc::new(Evaluator::new(
            room.room_id.clone(),
            bot_user_id,
            room.admins.iter().cloned().collect(),
            evaluator_config,
            services.policy_store,
            services.action_log,
            services.enforcement,
            services.registry,
            homeserver.clone(),
            protections,
        ));

        if let Err(e) = evaluator.load().await {
            warn!(room_id = %room.room_id, error = %e, "evaluator failed its initial load");
        }

        let loop_handle = evaluator.clone();
        tokio::spawn(async move { loop_handle.run_acl_loop().await });

        let reconciliation_handle = evaluator.clone();
        let reconciliation_interval = Duration::from_secs(config.reconciliation_interval_secs);
        tokio::spawn(async move { reconciliation_handle.run_reconciliation_loop(reconciliation_interval).await });

        services.dispatcher.register_evaluator(evaluator);
    }
}
