//! The host agent's HTTP server.
//!
//! The agent exposes the sandbox registry of one host over a small REST API and proxies
//! browser traffic to the services running inside each sandbox:
//! - `GET /health` and `GET /info` describe the host
//! - `/vms` creates, lists and destroys sandboxes
//! - `/proxy/{workshop_id}/{seat_id}/...` reaches the guest terminal and file service

mod api;
mod data;
mod handlers;
mod proxy;
mod routes;
mod state;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use api::*;
pub use data::*;
pub use routes::*;
pub use state::*;
