//! ILGuard off-chain coordinator.
//!
//! Operators attest to the outcome of an impermanent-loss computation. The
//! coordinator aggregates their signatures into threshold consensus, settles
//! approved claims on chain, and challenges and slashes operators caught
//! misbehaving. [`ClaimPipeline`] wires the component crates together.

pub mod pipeline;
pub mod settings;
pub mod simulation;

pub use pipeline::{ClaimPipeline, PipelineError};
pub use settings::SettingsError;
pub use simulation::{SimulationError, SimulationParams, SimulationReport};
