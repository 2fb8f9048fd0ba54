//! Ready-made components.
mod linear_system;

pub use linear_system::*;
