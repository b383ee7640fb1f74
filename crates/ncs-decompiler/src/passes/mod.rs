//! Structural analysis passes
//!
//! Run in order: positions, destinations, dead code, subroutine split. Each
//! pass only writes into the analysis side table or the subroutine table;
//! instructions themselves stay immutable.

mod dead_code;
mod destinations;
mod splitter;

pub use dead_code::set_dead_code;
pub use destinations::{set_destinations, set_positions};
pub use splitter::{split_subroutines, SubTable};
