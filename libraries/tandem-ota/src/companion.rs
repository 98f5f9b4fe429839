//! Companion flashing link
//!
//! The companion module is flashed through a small start/write/finish
//! handshake. Newer companion firmware also accepts it over SPI with a
//! larger chunk size; older firmware only speaks the legacy UART path.

use crate::error::LinkError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Physical path used for flashing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkTransport {
    /// Newer high-throughput path
    Spi,
    /// Legacy serial path
    Uart,
}

/// Identity reported by the companion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub firmware_version: String,
}

/// One open flashing session channel
///
/// `write_chunk` always receives exactly the transport's fixed chunk size.
#[async_trait]
pub trait CompanionLink: Send {
    /// Begin a flash session at `offset`
    async fn start(&mut self, offset: u32) -> Result<(), LinkError>;

    /// Write one fixed-size chunk
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), LinkError>;

    /// Commit the session
    async fn finish(&mut self) -> Result<(), LinkError>;

    /// Discard the session
    async fn abort(&mut self) -> Result<(), LinkError>;
}

/// The companion module as seen from the main module
#[async_trait]
pub trait CompanionDevice: Send + Sync {
    /// Query the companion's identity, including its firmware version
    async fn device_info(&self) -> Result<DeviceInfo, LinkError>;

    /// Open a flashing channel over the given transport
    async fn open_link(&self, transport: LinkTransport) -> Result<Box<dyn CompanionLink>, LinkError>;
}
