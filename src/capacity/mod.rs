//! Elastic fleet sizing.
//!
//! - **CapacityController**: samples queue depth and fleet size, requests resizes
//! - **FleetManager**: pluggable interface to whatever provisions workers

pub mod controller;
pub mod fleet;

pub use controller::{
    compute_directive, load_per_worker, CapacityController, CapacityError, CapacitySample,
    ScaleDirective,
};
pub use fleet::{FleetError, FleetManager, HttpFleetManager, InMemoryFleet};
