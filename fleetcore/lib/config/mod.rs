//! Configuration types and helpers.

mod agent;
mod defaults;
mod provisioner;
mod workers;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use agent::*;
pub use defaults::*;
pub use provisioner::*;
pub use workers::*;
