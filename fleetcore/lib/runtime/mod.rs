//! Sandbox runtime abstraction and hypervisor process monitoring.

mod monitor;
mod sandbox;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use monitor::*;
pub use sandbox::*;
