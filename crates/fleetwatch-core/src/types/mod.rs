//! Core types for Fleetwatch

mod change;
mod cluster;
mod lease;
mod object;

pub use change::*;
pub use cluster::*;
pub use lease::*;
pub use object::*;
