pub mod admission;
pub mod appservice;
pub mod auth;
pub mod policy_server;

use axum::{
    routing::{post, put},
    Router,
};

/// Assembles the full HTTP surface: admission callbacks, the policy-server
/// event-check endpoint, and the appservice transaction push route. No
/// client-server or federation API lives here — meowlnir is a narrow
/// moderation appservice, not a homeserver.
pub fn router() -> Router {
    Router::new()
        .route("/_matrix/app/v1/policy/user_may_invite", post(admission::user_may_invite))
        .route("/_matrix/app/v1/policy/federated_user_may_invite", post(admission::federated_user_may_invite))
        .route("/_matrix/app/v1/policy/user_may_join_room", post(admission::user_may_join_room))
        .route("/_matrix/app/v1/policy/accept_make_join", post(admission::accept_make_join))
        .route("/_matrix/app/v1/policy/ping", post(admission::ping))
        .route("/_matrix/app/v1/policy/report", post(admission::report))
        .route("/_matrix/policy/unstable/org.matrix.msc4284/event/:event_id/check", post(policy_server::check_event))
        .route("/_matrix/app/v1/transactions/:txn_id", put(appservice::push_transaction))
}
