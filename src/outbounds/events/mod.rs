//! Events emitted by the matching service, in their published JSON shape.

pub mod market;
pub mod trade;
