//! Shared fakes for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_core::{ArtifactKind, StatusRecord};
use tandem_ota::{
    AppDescriptor, Collaborators, CompanionDevice, CompanionLink, DeviceInfo, EngineConfig,
    EventStream, HttpEvent, HttpEventHandler, HttpRequest, HttpTransport, LinkError,
    LinkTransport, OtaEngine, OtaEvent, OtaHandle, PartitionError, PartitionOps, PartitionRef,
    PerformStatus, SystemControl, TransportError,
};
use tokio_util::sync::CancellationToken;

// ===== HTTP =====

/// Serves a fixed body in fixed-size chunks
pub struct ScriptedTransport {
    body: Vec<u8>,
    chunk: usize,
    send_length: bool,
    connect_failures: AtomicU32,
    stall_after: Option<usize>,
    end_after: Option<(usize, Result<(), TransportError>)>,
    pub attempts: AtomicU32,
    pub cancellations: AtomicU32,
}

impl ScriptedTransport {
    pub fn serving(body: Vec<u8>) -> Self {
        Self {
            body,
            chunk: 1024,
            send_length: true,
            connect_failures: AtomicU32::new(0),
            stall_after: None,
            end_after: None,
            attempts: AtomicU32::new(0),
            cancellations: AtomicU32::new(0),
        }
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn without_length(mut self) -> Self {
        self.send_length = false;
        self
    }

    pub fn failing_connects(self, count: u32) -> Self {
        self.connect_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Stop sending after `bytes` and hang until canceled
    pub fn stalling_after(mut self, bytes: usize) -> Self {
        self.stall_after = Some(bytes);
        self
    }

    /// Close the transfer after `bytes` with `outcome`, short of the full body
    pub fn ending_after(mut self, bytes: usize, outcome: Result<(), TransportError>) -> Self {
        self.end_after = Some((bytes, outcome));
        self
    }

    fn canceled(&self) -> TransportError {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
        TransportError::Cancelled
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn perform(
        &self,
        _request: &HttpRequest,
        handler: &mut dyn HttpEventHandler,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Connect("connection refused".into()));
        }

        handler.on_event(HttpEvent::Connected).await;
        if self.send_length {
            let length = self.body.len().to_string();
            handler
                .on_event(HttpEvent::Header {
                    name: "Content-Length",
                    value: &length,
                })
                .await;
        }

        let mut sent = 0;
        for chunk in self.body.chunks(self.chunk) {
            if self.stall_after.is_some_and(|limit| sent >= limit) {
                cancel.cancelled().await;
            }
            if let Some((limit, outcome)) = &self.end_after {
                if sent >= *limit {
                    if let Err(err) = outcome {
                        handler.on_event(HttpEvent::Error(&err.to_string())).await;
                    } else {
                        handler.on_event(HttpEvent::Finish).await;
                    }
                    handler.on_event(HttpEvent::Disconnected).await;
                    return outcome.clone();
                }
            }
            if cancel.is_cancelled() {
                handler.on_event(HttpEvent::Disconnected).await;
                return Err(self.canceled());
            }
            handler.on_event(HttpEvent::Data(chunk)).await;
            sent += chunk.len();
            tokio::task::yield_now().await;
        }

        handler.on_event(HttpEvent::Finish).await;
        handler.on_event(HttpEvent::Disconnected).await;
        Ok(())
    }
}

// ===== Companion =====

#[derive(Debug, Default)]
pub struct LinkLog {
    pub opened: Vec<LinkTransport>,
    pub starts: Vec<u32>,
    pub writes: Vec<Vec<u8>>,
    pub writes_after_cancel: usize,
    pub finished: usize,
    pub aborted: usize,
}

impl LinkLog {
    /// Concatenated payload of every write
    pub fn bytes(&self) -> Vec<u8> {
        self.writes.concat()
    }
}

pub struct FakeCompanion {
    version: String,
    log: Arc<Mutex<LinkLog>>,
    canceled: Arc<AtomicBool>,
    fail_write_at: Option<usize>,
    hang_writes: bool,
}

impl FakeCompanion {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            log: Arc::default(),
            canceled: Arc::default(),
            fail_write_at: None,
            hang_writes: false,
        }
    }

    /// Never complete a write, so the ring is never drained
    pub fn hanging_writes(mut self) -> Self {
        self.hang_writes = true;
        self
    }

    /// Reject the write with this zero-based index
    pub fn failing_write_at(mut self, index: usize) -> Self {
        self.fail_write_at = Some(index);
        self
    }

    pub fn log(&self) -> Arc<Mutex<LinkLog>> {
        self.log.clone()
    }

    /// Set right before canceling; writes seen afterwards are counted
    pub fn cancel_marker(&self) -> Arc<AtomicBool> {
        self.canceled.clone()
    }
}

struct FakeLink {
    log: Arc<Mutex<LinkLog>>,
    canceled: Arc<AtomicBool>,
    fail_write_at: Option<usize>,
    hang_writes: bool,
}

#[async_trait]
impl CompanionLink for FakeLink {
    async fn start(&mut self, offset: u32) -> Result<(), LinkError> {
        self.log.lock().unwrap().starts.push(offset);
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), LinkError> {
        if self.hang_writes {
            std::future::pending::<()>().await;
        }
        let mut log = self.log.lock().unwrap();
        if self.canceled.load(Ordering::SeqCst) {
            log.writes_after_cancel += 1;
        }
        if self.fail_write_at == Some(log.writes.len()) {
            return Err(LinkError::Rejected("bad checksum".into()));
        }
        log.writes.push(chunk.to_vec());
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), LinkError> {
        self.log.lock().unwrap().finished += 1;
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), LinkError> {
        self.log.lock().unwrap().aborted += 1;
        Ok(())
    }
}

#[async_trait]
impl CompanionDevice for FakeCompanion {
    async fn device_info(&self) -> Result<DeviceInfo, LinkError> {
        Ok(DeviceInfo {
            firmware_version: self.version.clone(),
        })
    }

    async fn open_link(&self, transport: LinkTransport) -> Result<Box<dyn CompanionLink>, LinkError> {
        self.log.lock().unwrap().opened.push(transport);
        Ok(Box::new(FakeLink {
            log: self.log.clone(),
            canceled: self.canceled.clone(),
            fail_write_at: self.fail_write_at,
            hang_writes: self.hang_writes,
        }))
    }
}

// ===== Main partition =====

#[derive(Debug, Default)]
pub struct PartitionLog {
    pub begun: u32,
    pub performed: u32,
    pub finished: bool,
    pub aborted: bool,
}

pub struct FakePartition {
    image_version: String,
    running_version: String,
    image_size: u64,
    step: u64,
    written: u64,
    connect_failures: u32,
    log: Arc<Mutex<PartitionLog>>,
}

impl FakePartition {
    pub fn new(image_version: &str, running_version: &str) -> Self {
        Self {
            image_version: image_version.to_string(),
            running_version: running_version.to_string(),
            image_size: 64 * 1024,
            step: 4096,
            written: 0,
            connect_failures: 0,
            log: Arc::default(),
        }
    }

    pub fn failing_connects(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    pub fn log(&self) -> Arc<Mutex<PartitionLog>> {
        self.log.clone()
    }
}

#[async_trait]
impl PartitionOps for FakePartition {
    async fn begin(&mut self, _url: &str, _timeout: Duration) -> Result<OtaHandle, PartitionError> {
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(PartitionError::Connect("host unreachable".into()));
        }
        self.log.lock().unwrap().begun += 1;
        self.written = 0;
        Ok(OtaHandle(7))
    }

    async fn image_descriptor(&mut self, _handle: OtaHandle) -> Result<AppDescriptor, PartitionError> {
        Ok(AppDescriptor {
            version: self.image_version.clone(),
            project_name: "tandem-main".into(),
        })
    }

    async fn running_partition(&mut self) -> Result<PartitionRef, PartitionError> {
        Ok(PartitionRef {
            label: "ota_0".into(),
            address: 0x10000,
        })
    }

    async fn partition_descriptor(
        &mut self,
        _partition: &PartitionRef,
    ) -> Result<AppDescriptor, PartitionError> {
        Ok(AppDescriptor {
            version: self.running_version.clone(),
            project_name: "tandem-main".into(),
        })
    }

    async fn perform(&mut self, _handle: OtaHandle) -> Result<PerformStatus, PartitionError> {
        self.written = (self.written + self.step).min(self.image_size);
        self.log.lock().unwrap().performed += 1;
        tokio::task::yield_now().await;

        if self.written == self.image_size {
            Ok(PerformStatus::Complete {
                written: self.written,
            })
        } else {
            Ok(PerformStatus::InProgress {
                written: self.written,
                total: Some(self.image_size),
            })
        }
    }

    async fn finish(&mut self, _handle: OtaHandle) -> Result<(), PartitionError> {
        self.log.lock().unwrap().finished = true;
        Ok(())
    }

    async fn abort(&mut self, _handle: OtaHandle) -> Result<(), PartitionError> {
        self.log.lock().unwrap().aborted = true;
        Ok(())
    }
}

// ===== System =====

pub struct NoopSystem;

impl SystemControl for NoopSystem {
    fn restart(&self) {}
}

// ===== Helpers =====

pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn start_engine(
    config: EngineConfig,
    transport: ScriptedTransport,
    companion: FakeCompanion,
    partition: FakePartition,
    system: Arc<dyn SystemControl>,
) -> (OtaEngine, Arc<ScriptedTransport>) {
    let transport = Arc::new(transport);
    let engine = OtaEngine::start(
        config,
        Collaborators {
            http: transport.clone(),
            companion: Arc::new(companion),
            partition: Box::new(partition),
            system,
        },
    )
    .unwrap();
    engine.set_network_available(true);
    (engine, transport)
}

/// Receive events until `done` matches one, returning all of them
pub async fn collect_until(
    stream: &mut EventStream,
    done: impl Fn(&OtaEvent) -> bool,
) -> Vec<OtaEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        let stop = done(&event);
        events.push(event);
        if stop {
            break;
        }
    }
    events
}

pub fn statuses(events: &[OtaEvent], stage: ArtifactKind) -> Vec<StatusRecord> {
    events
        .iter()
        .filter_map(|event| match event {
            OtaEvent::Status(record) if record.stage == stage => Some(*record),
            _ => None,
        })
        .collect()
}

pub fn is_job_finished(event: &OtaEvent) -> bool {
    matches!(event, OtaEvent::JobFinished { .. })
}

pub fn is_terminal_report(event: &OtaEvent) -> bool {
    matches!(event, OtaEvent::Report(report) if report.is_terminal())
}
