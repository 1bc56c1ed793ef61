pub mod config;
pub mod simulation;
pub mod stats;
pub mod system;
pub mod units;

mod unit_tests;

pub use simulation::Simulation;
pub use system::System;
