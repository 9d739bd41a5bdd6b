//! Distributed mode: a pool of statically configured workers and sandbox placement across them.

mod placement;
mod pool;
mod worker;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use placement::*;
pub use pool::*;
pub use worker::*;
