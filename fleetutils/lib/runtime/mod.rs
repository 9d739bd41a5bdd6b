//! `fleetutils::runtime` is a module containing process runtime utilities for the workshop fleet project.

mod monitor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use monitor::*;
