//! Companion Flasher Writer
//!
//! Long-lived consumer task that drains the ring buffer into the companion
//! module. It parks on its request channel while idle; the download driver
//! hands it a [`FlashRequest`] once the content length is known.
//!
//! Each session runs `start → write_chunk* → finish` over the link picked
//! by probing the companion's firmware version; a companion that cannot
//! open SPI is flashed over UART instead. Chunks always have the
//! link's fixed size, so a short final chunk is zero-padded. Any handshake
//! failure or ring starvation aborts the link and cancels the session
//! token, which stops the producer as well.

use crate::companion::{CompanionDevice, CompanionLink, LinkTransport};
use crate::config::EngineConfig;
use crate::events::StatusReporter;
use crate::pool::BufferPool;
use crate::progress::Milestones;
use crate::ring_buffer::RingBuffer;
use std::collections::HashMap;
use std::sync::Arc;
use tandem_core::{ArtifactKind, OtaError, Result, VersionTriple};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Writer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlasherState {
    /// Parked, waiting for the next session
    WaitSignal,
    /// `start` handshake issued
    Started,
    /// Draining the ring buffer
    Writing,
    /// Last session committed
    Finished,
    /// Last session ended with an error or cancellation
    Aborted,
}

/// One flash session handed to the writer
pub struct FlashRequest {
    pub kind: ArtifactKind,
    pub content_length: u64,
    /// Shared with the producer; either side cancels it to stop the other
    pub abort: CancellationToken,
    pub reporter: StatusReporter,
    /// Completion acknowledgement carrying the bytes written
    pub done: oneshot::Sender<Result<u64>>,
}

/// Cloneable handle used to hand sessions to the writer task
#[derive(Clone)]
pub struct FlasherHandle {
    tx: mpsc::Sender<FlashRequest>,
    state: watch::Receiver<FlasherState>,
}

impl FlasherHandle {
    /// Wake the writer with a new session
    pub async fn start(&self, request: FlashRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| OtaError::EngineStopped)
    }

    pub fn state(&self) -> FlasherState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FlasherState> {
        self.state.clone()
    }
}

impl std::fmt::Debug for FlasherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlasherHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Shared pieces a session reads while the link is borrowed
struct WriterContext {
    companion: Arc<dyn CompanionDevice>,
    ring: Arc<RingBuffer>,
    pool: BufferPool,
    config: Arc<EngineConfig>,
    state: watch::Sender<FlasherState>,
}

pub struct FlasherWriter {
    ctx: WriterContext,
    links: HashMap<LinkTransport, Box<dyn CompanionLink>>,
    requests: mpsc::Receiver<FlashRequest>,
}

impl FlasherWriter {
    /// Spawn the writer task
    pub fn spawn(
        companion: Arc<dyn CompanionDevice>,
        ring: Arc<RingBuffer>,
        pool: BufferPool,
        config: Arc<EngineConfig>,
        shutdown: CancellationToken,
    ) -> (FlasherHandle, JoinHandle<()>) {
        let (tx, requests) = mpsc::channel(1);
        let (state, state_rx) = watch::channel(FlasherState::WaitSignal);

        let writer = Self {
            ctx: WriterContext {
                companion,
                ring,
                pool,
                config,
                state,
            },
            links: HashMap::new(),
            requests,
        };
        let handle = tokio::spawn(writer.run(shutdown));

        (
            FlasherHandle {
                tx,
                state: state_rx,
            },
            handle,
        )
    }

    async fn run(mut self, shutdown: CancellationToken) {
        info!("Flasher writer started");

        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let FlashRequest {
                kind,
                content_length,
                abort,
                reporter,
                done,
            } = request;

            let result = self
                .session(kind, content_length, &abort, &reporter)
                .await;

            match &result {
                Ok(written) => {
                    self.ctx.state.send_replace(FlasherState::Finished);
                    info!(kind = ?kind, bytes = written, "Flash session finished");
                }
                Err(err) => {
                    self.ctx.state.send_replace(FlasherState::Aborted);
                    abort.cancel();
                    warn!(kind = ?kind, error = %err, "Flash session aborted");
                }
            }

            let _ = done.send(result);
        }

        info!("Flasher writer stopped");
    }

    async fn session(
        &mut self,
        kind: ArtifactKind,
        content_length: u64,
        abort: &CancellationToken,
        reporter: &StatusReporter,
    ) -> Result<u64> {
        let preferred = self.ctx.select_transport().await;
        let (transport, mut link) = self.acquire_link(preferred).await?;
        let granularity = match transport {
            LinkTransport::Spi => self.ctx.config.flash.spi_chunk_size,
            LinkTransport::Uart => self.ctx.config.flash.uart_chunk_size,
        };

        let result = self
            .ctx
            .write_session(&mut *link, kind, content_length, granularity, abort, reporter)
            .await;

        if result.is_err() {
            if let Err(e) = link.abort().await {
                // Leave a misbehaving link out of the cache so the next session reopens it
                warn!(transport = ?transport, error = %e, "Companion link abort failed");
                return result;
            }
        }

        self.links.insert(transport, link);
        result
    }

    /// Take a cached link or open one, falling back from SPI to UART
    async fn acquire_link(
        &mut self,
        preferred: LinkTransport,
    ) -> Result<(LinkTransport, Box<dyn CompanionLink>)> {
        if let Some(link) = self.links.remove(&preferred) {
            return Ok((preferred, link));
        }

        match self.ctx.companion.open_link(preferred).await {
            Ok(link) => return Ok((preferred, link)),
            Err(e) if preferred == LinkTransport::Spi => {
                warn!(error = %e, "SPI link unavailable, falling back to UART");
            }
            Err(e) => {
                error!(transport = ?preferred, error = %e, "Failed to open companion link");
                return Err(OtaError::FlasherStartFail);
            }
        }

        if let Some(link) = self.links.remove(&LinkTransport::Uart) {
            return Ok((LinkTransport::Uart, link));
        }
        match self.ctx.companion.open_link(LinkTransport::Uart).await {
            Ok(link) => Ok((LinkTransport::Uart, link)),
            Err(e) => {
                error!(transport = ?LinkTransport::Uart, error = %e, "Failed to open companion link");
                Err(OtaError::FlasherStartFail)
            }
        }
    }
}

impl WriterContext {
    async fn select_transport(&self) -> LinkTransport {
        match self.companion.device_info().await {
            Ok(info) => {
                let installed = VersionTriple::parse(&info.firmware_version);
                let minimum = VersionTriple::parse(&self.config.flash.spi_min_version);
                let transport = if installed >= minimum {
                    LinkTransport::Spi
                } else {
                    LinkTransport::Uart
                };
                debug!(version = %info.firmware_version, transport = ?transport, "Selected flashing transport");
                transport
            }
            Err(e) => {
                warn!(error = %e, "Companion version probe failed, using UART");
                LinkTransport::Uart
            }
        }
    }

    async fn write_session(
        &self,
        link: &mut dyn CompanionLink,
        kind: ArtifactKind,
        content_length: u64,
        granularity: usize,
        abort: &CancellationToken,
        reporter: &StatusReporter,
    ) -> Result<u64> {
        let mut buffer = self.pool.checkout().ok_or_else(|| {
            error!("No flash buffer available");
            OtaError::FlasherInternalError
        })?;
        let buffer = &mut buffer[..granularity];

        let offset = self.config.flash_offset(kind);
        self.state.send_replace(FlasherState::Started);
        link.start(offset).await.map_err(|e| {
            error!(kind = ?kind, offset, error = %e, "Companion refused flash start");
            OtaError::FlasherStartFail
        })?;

        self.state.send_replace(FlasherState::Writing);
        let starvation = self.config.writer_starvation();
        let mut milestones = Milestones::new(content_length, self.config.transfer.progress_step);
        let mut written: u64 = 0;

        while written < content_length {
            if abort.is_cancelled() {
                return Err(OtaError::UserCanceled);
            }

            let remaining = content_length - written;
            let chunk = usize::try_from(remaining).map_or(granularity, |r| r.min(granularity));

            let ready = tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(OtaError::UserCanceled),
                ready = self.ring.wait_readable(chunk, starvation) => ready,
            };
            if !ready || !self.ring.pop_exact(&mut buffer[..chunk]) {
                error!(
                    kind = ?kind,
                    written,
                    wanted = chunk,
                    buffered = self.ring.len(),
                    "Ring buffer starved"
                );
                return Err(OtaError::FlasherInternalError);
            }
            buffer[chunk..].fill(0);

            if abort.is_cancelled() {
                return Err(OtaError::UserCanceled);
            }

            link.write_chunk(&buffer[..]).await.map_err(|e| {
                error!(kind = ?kind, written, error = %e, "Companion chunk write failed");
                OtaError::FlasherWriteFail
            })?;

            written += chunk as u64;
            if let Some(percent) = milestones.advance(written) {
                debug!(kind = ?kind, percent, bytes = written, "Flash progress");
                reporter.progress(percent);
            }
        }

        link.finish().await.map_err(|e| {
            error!(kind = ?kind, error = %e, "Companion refused flash finish");
            OtaError::FlasherWriteFail
        })?;

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion::DeviceInfo;
    use crate::error::LinkError;
    use crate::events::EventBus;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log {
        opened: Vec<LinkTransport>,
        writes: Vec<Vec<u8>>,
        starts: Vec<u32>,
        finished: bool,
    }

    struct Link(Arc<Mutex<Log>>);

    #[async_trait]
    impl CompanionLink for Link {
        async fn start(&mut self, offset: u32) -> std::result::Result<(), LinkError> {
            self.0.lock().unwrap().starts.push(offset);
            Ok(())
        }
        async fn write_chunk(&mut self, chunk: &[u8]) -> std::result::Result<(), LinkError> {
            self.0.lock().unwrap().writes.push(chunk.to_vec());
            Ok(())
        }
        async fn finish(&mut self) -> std::result::Result<(), LinkError> {
            self.0.lock().unwrap().finished = true;
            Ok(())
        }
        async fn abort(&mut self) -> std::result::Result<(), LinkError> {
            Ok(())
        }
    }

    struct Device {
        version: std::result::Result<String, LinkError>,
        spi_down: bool,
        log: Arc<Mutex<Log>>,
    }

    #[async_trait]
    impl CompanionDevice for Device {
        async fn device_info(&self) -> std::result::Result<DeviceInfo, LinkError> {
            self.version.clone().map(|firmware_version| DeviceInfo { firmware_version })
        }
        async fn open_link(
            &self,
            transport: LinkTransport,
        ) -> std::result::Result<Box<dyn CompanionLink>, LinkError> {
            if self.spi_down && transport == LinkTransport::Spi {
                return Err(LinkError::Unavailable("SPI disabled".into()));
            }
            self.log.lock().unwrap().opened.push(transport);
            Ok(Box::new(Link(self.log.clone())))
        }
    }

    fn writer(version: std::result::Result<String, LinkError>) -> (FlasherHandle, Arc<RingBuffer>, Arc<Mutex<Log>>) {
        spawn_writer(version, false)
    }

    fn spawn_writer(
        version: std::result::Result<String, LinkError>,
        spi_down: bool,
    ) -> (FlasherHandle, Arc<RingBuffer>, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let config = Arc::new(EngineConfig::default());
        let ring = Arc::new(RingBuffer::new(config.transfer.ring_buffer_capacity));
        let (handle, _task) = FlasherWriter::spawn(
            Arc::new(Device {
                version,
                spi_down,
                log: log.clone(),
            }),
            ring.clone(),
            BufferPool::new(1, config.max_chunk_size()),
            config,
            CancellationToken::new(),
        );
        (handle, ring, log)
    }

    async fn flash(handle: &FlasherHandle, kind: ArtifactKind, len: u64) -> Result<u64> {
        let (done, rx) = oneshot::channel();
        handle
            .start(FlashRequest {
                kind,
                content_length: len,
                abort: CancellationToken::new(),
                reporter: StatusReporter::new(EventBus::new(64), kind),
                done,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn short_final_chunk_is_zero_padded() {
        let (handle, ring, log) = writer(Ok("1.0.0".into()));
        ring.try_push(&[0xAB; 300]);

        assert_eq!(flash(&handle, ArtifactKind::CompanionFirmware, 300).await, Ok(300));

        let log = log.lock().unwrap();
        assert_eq!(log.opened, vec![LinkTransport::Uart]);
        assert_eq!(log.writes.len(), 3);
        assert!(log.writes.iter().all(|w| w.len() == 128));
        assert_eq!(&log.writes[2][..44], &[0xAB; 44][..]);
        assert!(log.writes[2][44..].iter().all(|b| *b == 0));
        assert!(log.finished);
        assert_eq!(handle.state(), FlasherState::Finished);
    }

    #[tokio::test]
    async fn newer_companion_uses_spi_and_model_offset() {
        let (handle, ring, log) = writer(Ok("1.2.0".into()));
        ring.try_push(&[1; 512]);

        flash(&handle, ArtifactKind::AiModel, 512).await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.opened, vec![LinkTransport::Spi]);
        assert_eq!(log.starts, vec![0x40_0000]);
        assert_eq!(log.writes.len(), 2);
    }

    #[tokio::test]
    async fn link_is_cached_between_sessions() {
        let (handle, ring, log) = writer(Ok("1.0.0".into()));

        ring.try_push(&[2; 128]);
        flash(&handle, ArtifactKind::CompanionFirmware, 128).await.unwrap();
        ring.try_push(&[3; 128]);
        flash(&handle, ArtifactKind::CompanionFirmware, 128).await.unwrap();

        assert_eq!(log.lock().unwrap().opened.len(), 1);
    }

    #[tokio::test]
    async fn failed_probe_falls_back_to_uart() {
        let (handle, ring, log) = writer(Err(LinkError::Io("no answer".into())));
        ring.try_push(&[4; 10]);

        flash(&handle, ArtifactKind::CompanionFirmware, 10).await.unwrap();

        assert_eq!(log.lock().unwrap().opened, vec![LinkTransport::Uart]);
    }

    #[tokio::test]
    async fn unavailable_spi_link_falls_back_to_uart() {
        let (handle, ring, log) = spawn_writer(Ok("1.2.0".into()), true);
        ring.try_push(&[6; 200]);

        assert_eq!(flash(&handle, ArtifactKind::AiModel, 200).await, Ok(200));

        let log = log.lock().unwrap();
        assert_eq!(log.opened, vec![LinkTransport::Uart]);
        assert_eq!(log.writes.len(), 2);
        assert!(log.writes.iter().all(|w| w.len() == 128));
        assert!(log.finished);
    }

    #[tokio::test(start_paused = true)]
    async fn starvation_is_an_internal_error() {
        let (handle, ring, log) = writer(Ok("1.0.0".into()));
        ring.try_push(&[5; 100]);

        let result = flash(&handle, ArtifactKind::CompanionFirmware, 1000).await;

        assert_eq!(result, Err(OtaError::FlasherInternalError));
        assert!(log.lock().unwrap().writes.is_empty());
        assert_eq!(handle.state(), FlasherState::Aborted);
    }
}
