//! MicroVM boot configuration and hypervisor process supervision.
//!
//! A [`MicroVmSupervisor`] turns a network [`Allocation`](crate::network::Allocation) into a
//! running hypervisor through a [`Hypervisor`] implementation: [`FirecrackerHypervisor`] on real
//! hosts and [`SimulatedHypervisor`] everywhere else.

mod boot;
mod firecracker;
mod hypervisor;
mod sim;
mod supervisor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use boot::*;
pub use firecracker::*;
pub use hypervisor::*;
pub use sim::*;
pub use supervisor::*;
