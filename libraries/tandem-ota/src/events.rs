//! Update Events
//!
//! Event-based communication between the update stages and the rest of the
//! device. The bus carries both directions:
//! - Produced: per-artifact status, job lifecycle, combined manifest reports,
//!   reboot scheduling and version reports
//! - Consumed: connectivity changes, received manifests, MQTT connection

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tandem_core::{
    ArtifactKind, JobId, OtaError, StatusRecord, UpdateManifest, UpdateReport,
};
use tokio::sync::broadcast;
use tracing::warn;

/// Events carried on the engine's bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OtaEvent {
    /// Progress or outcome of one artifact
    Status(StatusRecord),

    /// The worker picked a job up
    JobStarted {
        /// ID of the job
        job_id: JobId,
        /// Artifact the job updates
        kind: ArtifactKind,
    },

    /// The worker finished a job and freed the queue slot
    JobFinished {
        /// ID of the job
        job_id: JobId,
        /// Artifact the job updated
        kind: ArtifactKind,
        /// Failure reason, `None` on success
        error: Option<OtaError>,
    },

    /// Combined progress of a manifest-driven update
    Report(UpdateReport),

    /// A restart will follow after the given delay
    RebootScheduled {
        /// Delay before the restart in milliseconds
        delay_ms: u64,
    },

    /// Installed versions, sent after the MQTT session comes up
    VersionsReported {
        /// Version of the running main firmware
        main: Option<String>,
        /// Version reported by the companion module
        companion: Option<String>,
    },

    /// Network connectivity changed
    ConnectivityChanged {
        /// Whether the network is usable
        online: bool,
    },

    /// A remote update manifest arrived
    ManifestReceived(UpdateManifest),

    /// The MQTT session was (re)established
    MqttConnected,
}

/// Broadcast bus shared by every component of an engine
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OtaEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish without blocking; events with no subscriber are dropped
    pub fn publish(&self, event: OtaEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// Subscription to an [`EventBus`]
pub struct EventStream {
    rx: broadcast::Receiver<OtaEvent>,
}

impl EventStream {
    /// Next event, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<OtaEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event subscriber lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next status record for `stage`, skipping everything else
    pub async fn next_status(&mut self, stage: ArtifactKind) -> Option<StatusRecord> {
        loop {
            match self.recv().await? {
                OtaEvent::Status(record) if record.stage == stage => return Some(record),
                _ => {}
            }
        }
    }

    /// Non-blocking variant of [`EventStream::recv`]
    pub fn try_recv(&mut self) -> Option<OtaEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Event subscriber lagged, oldest events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

struct ReporterState {
    last_percent: AtomicU8,
    terminal: AtomicBool,
}

/// Publishes the status records of one job.
///
/// Progress is forced non-decreasing and exactly one terminal record gets
/// through; anything published after it is dropped.
#[derive(Clone)]
pub struct StatusReporter {
    bus: EventBus,
    stage: ArtifactKind,
    state: Arc<ReporterState>,
}

impl StatusReporter {
    pub fn new(bus: EventBus, stage: ArtifactKind) -> Self {
        Self {
            bus,
            stage,
            state: Arc::new(ReporterState {
                last_percent: AtomicU8::new(0),
                terminal: AtomicBool::new(false),
            }),
        }
    }

    pub fn stage(&self) -> ArtifactKind {
        self.stage
    }

    /// Highest percentage published so far
    pub fn last_percent(&self) -> u8 {
        self.state.last_percent.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.state.terminal.load(Ordering::SeqCst)
    }

    /// Publish an `Upgrading` record unless it would go backwards
    pub fn progress(&self, percent: u8) {
        if self.is_finished() {
            return;
        }
        let percent = percent.min(100);
        let previous = self.state.last_percent.fetch_max(percent, Ordering::SeqCst);
        if percent < previous || (percent == previous && percent != 0) {
            return;
        }
        self.bus
            .publish(OtaEvent::Status(StatusRecord::upgrading(self.stage, percent)));
    }

    /// Publish the terminal record matching `result`
    pub fn finish(&self, result: &Result<(), OtaError>) {
        let record = match result {
            Ok(()) => StatusRecord::succeed(self.stage),
            Err(OtaError::VersionTooOld) => StatusRecord::up_to_date(self.stage),
            Err(err) => StatusRecord::fail(self.stage, *err, self.last_percent()),
        };
        self.terminal(record);
    }

    fn terminal(&self, record: StatusRecord) {
        if self
            .state
            .terminal
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.bus.publish(OtaEvent::Status(record));
        }
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("stage", &self.stage)
            .field("last_percent", &self.last_percent())
            .field("finished", &self.is_finished())
            .finish()
    }
}
