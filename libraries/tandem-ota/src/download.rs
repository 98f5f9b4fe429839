//! HTTP Download Driver
//!
//! Producer side of the transfer pipeline. The driver performs a streaming
//! GET and pushes the body into the ring buffer; the flasher writer drains
//! it on the other side. Pushing waits while the ring is full, so the HTTP
//! transfer runs at flash speed.
//!
//! One [`CancellationToken`] per attempt is shared with the writer. The
//! job's token is its parent, so a user cancel reaches both sides at once;
//! either side cancels it directly when it fails.

use crate::config::EngineConfig;
use crate::error::TransportError;
use crate::events::StatusReporter;
use crate::flasher::{FlashRequest, FlasherHandle};
use crate::http::{HttpEvent, HttpEventHandler, HttpRequest, HttpTransport};
use crate::progress::Milestones;
use crate::ring_buffer::RingBuffer;
use async_trait::async_trait;
use std::sync::Arc;
use tandem_core::{OtaError, OtaJob, Result};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Streams one artifact from its URL into the flasher
pub struct DownloadDriver {
    http: Arc<dyn HttpTransport>,
    ring: Arc<RingBuffer>,
    flasher: FlasherHandle,
    config: Arc<EngineConfig>,
}

impl DownloadDriver {
    pub fn new(
        http: Arc<dyn HttpTransport>,
        ring: Arc<RingBuffer>,
        flasher: FlasherHandle,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            http,
            ring,
            flasher,
            config,
        }
    }

    /// Download and flash `job`, returning the number of bytes written
    pub async fn run(
        &self,
        job: &OtaJob,
        cancel: &CancellationToken,
        reporter: &StatusReporter,
    ) -> Result<u64> {
        let request = HttpRequest {
            url: job.url.clone(),
            timeout: self.config.http_timeout(),
        };
        let attempts = self.config.transfer.connect_attempts;

        info!(kind = ?job.kind, url = %job.url, "Starting download");

        let mut attempt = 1;
        loop {
            let token = cancel.child_token();
            let mut session = Session::new(self, job, token.clone(), reporter.clone());
            let result = self.http.perform(&request, &mut session, &token).await;

            if let Err(TransportError::Connect(reason)) = &result {
                if !session.connected && attempt < attempts && !cancel.is_cancelled() {
                    warn!(
                        kind = ?job.kind,
                        attempt,
                        attempts,
                        reason = %reason,
                        "Connection failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.config.connect_backoff()) => {}
                    }
                    continue;
                }
            }

            return self.conclude(result, session, cancel).await;
        }
    }

    async fn conclude(
        &self,
        result: std::result::Result<(), TransportError>,
        mut session: Session<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            info!("Download canceled, tearing down");
            self.teardown(&mut session).await;
            return Err(OtaError::UserCanceled);
        }

        if let Some(err) = session.failure {
            self.teardown(&mut session).await;
            return Err(err);
        }

        match result {
            Ok(()) => {
                let expected = session.content_length.unwrap_or(0);
                if session.received < expected || session.writer_done.is_none() {
                    warn!(
                        received = session.received,
                        expected, "Transfer ended before the whole image arrived"
                    );
                    self.teardown(&mut session).await;
                    return Err(OtaError::DownloadIncomplete);
                }

                let Some(done) = session.writer_done.take() else {
                    return Err(OtaError::DownloadIncomplete);
                };

                // Transfer is complete; the writer may still be draining.
                let mut done = done;
                let verdict = tokio::select! {
                    _ = cancel.cancelled() => None,
                    verdict = &mut done => Some(verdict),
                };

                match verdict {
                    Some(verdict) => verdict.unwrap_or(Err(OtaError::EngineStopped)),
                    None => {
                        session.writer_done = Some(done);
                        self.teardown(&mut session).await;
                        Err(OtaError::UserCanceled)
                    }
                }
            }
            Err(e) => {
                let writer = self.teardown(&mut session).await;
                match writer {
                    Some(Err(err)) if err != OtaError::UserCanceled => Err(err),
                    _ => {
                        error!(error = %e, received = session.received, "Transfer failed");
                        Err(match e {
                            TransportError::Connect(_) | TransportError::Status(_) => {
                                OtaError::ConnectionFail
                            }
                            TransportError::Io(_) | TransportError::Cancelled => {
                                OtaError::DownloadIncomplete
                            }
                        })
                    }
                }
            }
        }
    }

    /// Stop both sides and wait, bounded, for the writer to acknowledge.
    ///
    /// Returns the writer's verdict if it arrived in time.
    async fn teardown(&self, session: &mut Session<'_>) -> Option<Result<u64>> {
        session.abort.cancel();

        let verdict = match session.writer_done.take() {
            Some(done) => match tokio::time::timeout(self.config.cancel_teardown(), done).await {
                Ok(Ok(verdict)) => Some(verdict),
                Ok(Err(_)) => Some(Err(OtaError::EngineStopped)),
                Err(_) => {
                    error!("Flasher writer did not acknowledge the abort in time");
                    None
                }
            },
            None => None,
        };

        self.ring.clear();
        verdict
    }
}

/// State of one HTTP attempt
struct Session<'a> {
    driver: &'a DownloadDriver,
    job: &'a OtaJob,
    abort: CancellationToken,
    reporter: StatusReporter,
    connected: bool,
    content_length: Option<u64>,
    header_length: Option<u64>,
    received: u64,
    writer_done: Option<oneshot::Receiver<Result<u64>>>,
    failure: Option<OtaError>,
    checkpoints: Option<Milestones>,
}

impl<'a> Session<'a> {
    fn new(
        driver: &'a DownloadDriver,
        job: &'a OtaJob,
        abort: CancellationToken,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            driver,
            job,
            abort,
            reporter,
            connected: false,
            content_length: None,
            header_length: None,
            received: 0,
            writer_done: None,
            failure: None,
            checkpoints: None,
        }
    }

    fn fail(&mut self, err: OtaError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
        self.abort.cancel();
    }

    /// Hand the session to the writer once the length is known
    async fn open_flash_session(&mut self) -> bool {
        let length = match self.header_length.or(self.job.expected_size) {
            Some(0) => {
                warn!(kind = ?self.job.kind, "Server announced an empty image");
                self.fail(OtaError::DownloadIncomplete);
                return false;
            }
            Some(length) => length,
            None => {
                error!(kind = ?self.job.kind, "No content length in the response");
                self.fail(OtaError::ImageHeaderReadFail);
                return false;
            }
        };

        let (done, writer_done) = oneshot::channel();
        let request = FlashRequest {
            kind: self.job.kind,
            content_length: length,
            abort: self.abort.clone(),
            reporter: self.reporter.clone(),
            done,
        };
        if let Err(err) = self.driver.flasher.start(request).await {
            self.fail(err);
            return false;
        }

        info!(kind = ?self.job.kind, bytes = length, "Image transfer started");
        self.content_length = Some(length);
        self.writer_done = Some(writer_done);
        self.checkpoints = Some(Milestones::new(
            length,
            self.driver.config.transfer.progress_step,
        ));
        true
    }

    async fn push(&mut self, data: &[u8]) {
        let Some(length) = self.content_length else {
            return;
        };
        let remaining = usize::try_from(length - self.received).unwrap_or(usize::MAX);
        if data.len() > remaining {
            warn!(extra = data.len() - remaining, "Ignoring bytes past the announced length");
        }
        let data = &data[..data.len().min(remaining)];

        let driver = self.driver;
        let ring = &driver.ring;
        let timeout = driver.config.push_timeout();
        let max_attempts = driver.config.transfer.push_attempts;
        let mut pushed = 0;
        let mut stalled = 0;

        while pushed < data.len() {
            let count = tokio::select! {
                biased;
                _ = self.abort.cancelled() => break,
                count = ring.push_timeout(&data[pushed..], timeout) => count,
            };
            pushed += count;

            if count > 0 {
                stalled = 0;
                continue;
            }

            stalled += 1;
            if stalled >= max_attempts {
                error!(
                    kind = ?self.job.kind,
                    attempts = stalled,
                    received = self.received,
                    "Ring buffer stayed full, giving up"
                );
                self.received += pushed as u64;
                self.fail(OtaError::FlasherInternalError);
                return;
            }
        }

        self.received += pushed as u64;
        if let Some(percent) = self.checkpoints.as_mut().and_then(|m| m.advance(self.received)) {
            debug!(kind = ?self.job.kind, percent, bytes = self.received, "Download checkpoint");
        }
    }
}

#[async_trait]
impl<'a> HttpEventHandler for Session<'a> {
    async fn on_event(&mut self, event: HttpEvent<'_>) {
        match event {
            HttpEvent::Connected => {
                debug!(url = %self.job.url, "Connected");
                self.driver.ring.clear();
                self.connected = true;
                self.received = 0;
                self.content_length = None;
                self.header_length = None;
                self.writer_done = None;
                self.checkpoints = None;
            }
            HttpEvent::Header { name, value } => {
                if name.eq_ignore_ascii_case("content-length") {
                    self.header_length = value.trim().parse().ok();
                }
            }
            HttpEvent::Data(chunk) => {
                if self.failure.is_some() || self.abort.is_cancelled() {
                    return;
                }
                if self.writer_done.is_none() && !self.open_flash_session().await {
                    return;
                }
                self.push(chunk).await;
            }
            HttpEvent::Finish | HttpEvent::Disconnected => {
                debug!(received = self.received, "Transfer closed");
            }
            HttpEvent::Error(reason) => {
                warn!(url = %self.job.url, reason, "Transport reported an error");
            }
            HttpEvent::Redirect { location } => {
                info!(location, "Download redirected");
            }
        }
    }
}
