//! Tandem OTA
//!
//! Update orchestrator for a main module paired with a companion module.
//!
//! Data path for companion artifacts:
//!
//! ```text
//! HTTP transport -> DownloadDriver -> RingBuffer -> FlasherWriter -> CompanionLink
//! ```
//!
//! Main firmware goes through the [`WorkerBridge`] into the privileged task
//! that owns the partition primitives. The [`JobSequencer`] runs one job at
//! a time and the [`StatusAggregator`] turns update manifests into ordered
//! companion-then-main sequences. [`OtaEngine`] wires it all together.

pub mod aggregator;
pub mod bridge;
pub mod companion;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod flasher;
pub mod http;
pub mod main_firmware;
pub mod pool;
pub mod progress;
pub mod ring_buffer;
pub mod runner;
pub mod sequencer;
pub mod system;

// Public exports
pub use aggregator::{AggregatorState, StatusAggregator};
pub use bridge::{AppDescriptor, OtaHandle, PartitionOps, PartitionRef, PerformStatus, WorkerBridge};
pub use companion::{CompanionDevice, CompanionLink, DeviceInfo, LinkTransport};
pub use config::EngineConfig;
pub use engine::{Collaborators, OtaEngine};
pub use error::{CallError, ConfigError, LinkError, PartitionError, TransportError};
pub use events::{EventBus, EventStream, OtaEvent, StatusReporter};
pub use flasher::FlasherState;
pub use http::{HttpEvent, HttpEventHandler, HttpRequest, HttpTransport, ReqwestTransport};
pub use ring_buffer::RingBuffer;
pub use runner::JobRunner;
pub use sequencer::JobSequencer;
pub use system::SystemControl;
