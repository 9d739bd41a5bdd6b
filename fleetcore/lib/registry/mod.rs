//! The host-local registry of sandboxes.

mod registry;
mod sandbox;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use registry::*;
pub use sandbox::*;
pub use store::*;
