//! Portable program representation and the device-backend contract.

pub mod hashing;
pub mod ir;
pub mod legality;
pub mod optimizer;
pub mod passes;
pub mod pipeline;
pub mod registry;
pub mod shape_helpers;
