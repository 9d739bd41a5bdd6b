//! Host network plumbing for sandboxes.
//!
//! Every sandbox gets a TAP device attached to a single host bridge. Addresses come from a fixed
//! subnet and are derived from a host-local slot number, so the same slot always maps to the same
//! TAP name, IP address and guest MAC.

mod allocation;
mod driver;
mod manager;
mod sim;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use allocation::*;
pub use driver::*;
pub use manager::*;
pub use sim::*;
