//! Route definitions for the agent HTTP server.

use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};

use super::{api::auth_middleware, handlers, proxy, state::AgentState};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Creates the router with every agent endpoint configured.
///
/// `/health` and the `/proxy` routes are open; everything else requires the bearer token.
pub fn create_router(state: AgentState) -> Router {
    let authenticated = Router::new()
        .route("/info", get(handlers::info_handler))
        .route(
            "/vms",
            post(handlers::create_vm_handler).get(handlers::list_vms_handler),
        )
        .route(
            "/vms/{workshop_id}/{seat_id}",
            get(handlers::get_vm_handler).delete(handlers::delete_vm_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let proxied = Router::new()
        .route(
            "/proxy/{workshop_id}/{seat_id}/terminal",
            get(proxy::terminal_handler),
        )
        .route(
            "/proxy/{workshop_id}/{seat_id}/files",
            any(proxy::files_root_handler),
        )
        .route(
            "/proxy/{workshop_id}/{seat_id}/files/{*path}",
            any(proxy::files_handler),
        )
        .route(
            "/proxy/{workshop_id}/{seat_id}/health",
            get(proxy::guest_health_handler),
        );

    Router::new()
        .route("/health", get(handlers::health_handler))
        .merge(authenticated)
        .merge(proxied)
        .with_state(state)
}
