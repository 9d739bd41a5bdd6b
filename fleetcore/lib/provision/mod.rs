//! Control-plane provisioning of workshop hosts.
//!
//! A [`Provisioner`] drives one workshop through its phases: it creates a cloud host from a
//! snapshot, waits for the host agent to report healthy and then creates one sandbox per seat.
//! The cloud is reached through the [`CloudProvider`] trait, implemented by [`GcloudProvider`]
//! and, for local runs and tests, [`SimulatedCloud`].
//!
//! [`Provisioner::with_runtime`] skips the host phases and creates the seats on an existing
//! [`SandboxRuntime`](crate::runtime::SandboxRuntime), such as the worker pool.

mod cloud;
mod gcloud;
mod provisioner;
mod sim;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cloud::*;
pub use gcloud::*;
pub use provisioner::*;
pub use sim::*;
