mod fleetctl;
mod fleetd;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use fleetctl::*;
pub use fleetd::*;
