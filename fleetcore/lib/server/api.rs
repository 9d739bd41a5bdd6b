use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json, Router,
};
use tokio::net::TcpListener;

use crate::{registry::Registry, FleetResult};

use super::{
    data::{ErrorResponse, ErrorType},
    routes::create_router,
    state::AgentState,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The host agent's HTTP server.
#[derive(Debug, Clone)]
pub struct AgentServer {
    /// Address to listen on
    addr: SocketAddr,

    /// State shared by all routes
    state: AgentState,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AgentServer {
    /// Create a new server instance
    pub fn new(addr: SocketAddr, registry: Arc<Registry>) -> FleetResult<Self> {
        Ok(Self {
            addr,
            state: AgentState::new(registry)?,
        })
    }

    /// The configured listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The router serving all agent routes.
    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> FleetResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn serve_on(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> FleetResult<()> {
        let app = self.router();
        tracing::info!(addr = %listener.local_addr()?, "agent listening");

        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("agent stopped");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Middleware
//--------------------------------------------------------------------------------------------------

/// Authentication middleware validating the pre-shared bearer token
pub(super) async fn auth_middleware(
    State(state): State<AgentState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|auth_header| auth_header.to_str().ok())
        .and_then(|auth_value| auth_value.strip_prefix("Bearer "));

    let Some(token) = token else {
        return unauthorized("Missing or invalid Bearer token");
    };

    if !constant_time_eq(token.as_bytes(), state.get_auth_token().as_bytes()) {
        tracing::warn!(path = %req.uri().path(), "rejected request with wrong token");
        return unauthorized("Invalid token");
    }

    next.run(req).await
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Compares two byte strings in time independent of where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new(
            401,
            message.to_string(),
            ErrorType::AuthenticationError,
        )),
    )
        .into_response()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(constant_time_eq(b"", b""));
    }
}
