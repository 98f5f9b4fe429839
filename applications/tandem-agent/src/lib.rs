//! Tandem Agent Library
//!
//! Host-side harness for the Tandem OTA engine: configuration loading and
//! file-backed stand-ins for the companion module, the main-firmware
//! partition and the system reset.

pub mod config;
pub mod error;
pub mod sim;

pub use crate::config::{AgentConfig, SimulatorSettings};
pub use crate::error::{AgentError, Result};
pub use crate::sim::{SimCompanion, SimPartition, SimSystem};
