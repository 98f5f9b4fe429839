//! HTTP transport seam
//!
//! The download driver is written against an event-driven streaming GET:
//! the transport performs the request and reports what happens through an
//! [`HttpEventHandler`]. `perform` only returns once the transfer is over,
//! so a handler that waits inside `on_event` applies backpressure to the
//! network side.

mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A GET request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    /// Limit on connecting and on any single wait for body bytes. A slow
    /// consumer may keep the transfer open longer than this.
    pub timeout: Duration,
}

/// Transfer events, in the order a transport reports them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpEvent<'a> {
    Connected,
    Header { name: &'a str, value: &'a str },
    Data(&'a [u8]),
    Finish,
    Disconnected,
    Error(&'a str),
    Redirect { location: &'a str },
}

#[async_trait]
pub trait HttpEventHandler: Send {
    async fn on_event(&mut self, event: HttpEvent<'_>);
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Run the request to completion.
    ///
    /// Implementations stop early with [`TransportError::Cancelled`] once
    /// `cancel` fires, and report a failure to connect as
    /// [`TransportError::Connect`] before any `Connected` event.
    async fn perform(
        &self,
        request: &HttpRequest,
        handler: &mut dyn HttpEventHandler,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;
}
