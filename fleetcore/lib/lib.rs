//! `fleetcore` provisions and supervises MicroVM sandboxes for live coding workshops.
//!
//! # Overview
//!
//! Every attendee of a workshop gets a seat, and every seat gets its own MicroVM. A sandbox runs
//! a browser terminal and a file service which the host agent exposes through a reverse proxy.
//!
//! Two deployment shapes are supported:
//!
//! - **One host per workshop**: the [`provision::Provisioner`] creates a cloud host from a
//!   snapshot, waits for its agent, then creates one sandbox per seat.
//! - **Shared workers**: a static [`pool::WorkerPool`] spreads sandboxes across long running
//!   hosts, skipping hosts that are full, down or reject our token. A provisioner built with
//!   [`provision::Provisioner::with_runtime`] provisions whole workshops onto the pool.
//!
//! # Architecture
//!
//! - **network**: bridge, TAP devices and address allocation on a host
//! - **vm**: hypervisor launch, boot checks and process supervision
//! - **registry**: the host-local map of sandboxes and its optional snapshot
//! - **server**: the agent HTTP API and the terminal and file proxy
//! - **client**: the HTTP client the control plane talks to agents with
//! - **provision**: cloud hosts and the workshop provisioning state machine
//! - **pool**: worker health and sandbox placement
//!
//! The registry, the agent client and the worker pool all implement
//! [`runtime::SandboxRuntime`], so callers do not care whether sandboxes are local or remote.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fleetcore::{
//!     config::AgentConfig,
//!     network::{NetworkManager, SimulatedDriver},
//!     registry::{NoopStore, Registry, Resources},
//!     vm::{MicroVmSupervisor, SimulatedHypervisor},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AgentConfig::builder()
//!         .worker_id("host-a")
//!         .auth_token("secret")
//!         .capacity(3)
//!         .build();
//!
//!     let network = NetworkManager::from_config(Arc::new(SimulatedDriver::new()), &config);
//!     let supervisor =
//!         MicroVmSupervisor::new(Arc::new(SimulatedHypervisor::new()), network, &config);
//!     let registry = Registry::new(config, supervisor, Arc::new(NoopStore));
//!     registry.initialize().await?;
//!
//!     let sandbox = registry.create("ws-1", 1, Resources::default()).await?;
//!     println!("seat 1 is at {}", sandbox.ip);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cli`] - Command line arguments of `fleetd` and `fleetctl`
//! - [`client`] - Agent API client
//! - [`config`] - Configuration types and defaults
//! - [`network`] - Host network plumbing
//! - [`pool`] - Worker pool and placement
//! - [`provision`] - Control-plane provisioning
//! - [`registry`] - Host-local sandbox registry
//! - [`runtime`] - Sandbox runtime abstraction and console monitoring
//! - [`server`] - Agent API server and proxy
//! - [`vm`] - MicroVM boot and supervision

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod client;
pub mod config;
pub mod network;
pub mod pool;
pub mod provision;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod vm;

pub use error::*;
