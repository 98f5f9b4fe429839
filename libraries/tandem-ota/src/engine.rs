//! OTA engine context
//!
//! [`OtaEngine`] owns every queue, buffer and task of one orchestrator
//! instance. Nothing is global, so tests can run several engines side by
//! side against different fakes.

use crate::aggregator::{AggregatorParts, AggregatorState, StatusAggregator};
use crate::bridge::{PartitionOps, PrivilegedWorker, WorkerBridge};
use crate::companion::CompanionDevice;
use crate::config::EngineConfig;
use crate::download::DownloadDriver;
use crate::error::ConfigError;
use crate::events::{EventBus, EventStream, OtaEvent};
use crate::flasher::{FlasherState, FlasherWriter};
use crate::http::HttpTransport;
use crate::main_firmware::MainFirmwareFlow;
use crate::pool::BufferPool;
use crate::ring_buffer::RingBuffer;
use crate::runner::ArtifactRunner;
use crate::sequencer::JobSequencer;
use crate::system::SystemControl;
use std::sync::Arc;
use tandem_core::{ArtifactKind, OtaJob, Result, UpdateManifest, VersionGate};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The device-facing collaborators an engine drives
pub struct Collaborators {
    pub http: Arc<dyn HttpTransport>,
    pub companion: Arc<dyn CompanionDevice>,
    /// Main-firmware partition primitives, moved into the privileged task
    pub partition: Box<dyn PartitionOps>,
    pub system: Arc<dyn SystemControl>,
}

pub struct OtaEngine {
    config: Arc<EngineConfig>,
    bus: EventBus,
    gate: Arc<VersionGate>,
    network: Arc<watch::Sender<bool>>,
    ring: Arc<RingBuffer>,
    flasher_state: watch::Receiver<FlasherState>,
    sequencer: JobSequencer,
    aggregator: StatusAggregator,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    bridge_task: JoinHandle<()>,
}

impl OtaEngine {
    /// Build the engine and spawn its tasks.
    ///
    /// Must be called from within a Tokio runtime. The network starts out
    /// unavailable.
    pub fn start(config: EngineConfig, collaborators: Collaborators) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let Collaborators {
            http,
            companion,
            partition,
            system,
        } = collaborators;

        let bus = EventBus::new(config.transfer.event_capacity);
        let gate = Arc::new(VersionGate::new());
        let ring = Arc::new(RingBuffer::new(config.transfer.ring_buffer_capacity));
        let pool = BufferPool::new(config.transfer.buffer_pool_size, config.max_chunk_size());
        let (network, network_rx) = watch::channel(false);
        let network = Arc::new(network);
        let shutdown = CancellationToken::new();

        let (bridge, bridge_task) = PrivilegedWorker::spawn(
            partition,
            config.transfer.bridge_queue_depth,
            config.bridge_post_timeout(),
        );

        let (flasher, flasher_task) = FlasherWriter::spawn(
            companion.clone(),
            ring.clone(),
            pool,
            config.clone(),
            shutdown.clone(),
        );
        let flasher_state = flasher.subscribe();

        let runner = ArtifactRunner::new(
            DownloadDriver::new(http, ring.clone(), flasher, config.clone()),
            MainFirmwareFlow::new(bridge.clone(), gate.clone(), config.clone()),
        );

        let (sequencer, sequencer_task) = JobSequencer::spawn(
            Arc::new(runner),
            network_rx,
            bus.clone(),
            config.clone(),
            shutdown.clone(),
        );

        let aggregator = StatusAggregator::new(AggregatorParts {
            sequencer: sequencer.clone(),
            bridge,
            companion,
            gate: gate.clone(),
            bus: bus.clone(),
            system,
            config: config.clone(),
        });

        let dispatcher = Dispatcher {
            events: bus.subscribe(),
            bus: bus.clone(),
            network: network.clone(),
            aggregator: aggregator.clone(),
        };
        let dispatcher_task = tokio::spawn(dispatcher.run(shutdown.clone()));

        info!(
            ring_bytes = config.transfer.ring_buffer_capacity,
            "OTA engine started"
        );

        Ok(Self {
            config,
            bus,
            gate,
            network,
            ring,
            flasher_state,
            sequencer,
            aggregator,
            shutdown,
            tasks: vec![flasher_task, sequencer_task, dispatcher_task],
            bridge_task,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribe to engine events
    pub fn events(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Feed a consumed event (connectivity, manifest, MQTT) into the engine
    pub fn dispatch(&self, event: OtaEvent) {
        self.bus.publish(event);
    }

    pub fn set_network_available(&self, online: bool) {
        set_network(&self.network, online);
    }

    /// Toggle the version-check override used by force-update tooling
    pub fn set_version_check_override(&self, enabled: bool) {
        info!(enabled, "Version check override");
        self.gate.set_override(enabled);
    }

    pub fn version_gate(&self) -> &VersionGate {
        &self.gate
    }

    /// Queue a job; see [`JobSequencer::submit`]
    pub async fn submit(&self, job: OtaJob) -> Result<()> {
        self.sequencer.submit(job).await
    }

    /// Cancel the running job of `kind` (any kind for `None`)
    pub async fn abort(&self, kind: Option<ArtifactKind>) -> Result<bool> {
        self.sequencer.abort(kind).await
    }

    /// Run a manifest-driven update to completion
    pub async fn handle_manifest(&self, manifest: &UpdateManifest) -> Result<()> {
        self.aggregator.handle_manifest(manifest).await
    }

    pub async fn force_update(&self, kind: ArtifactKind, url: &str) -> Result<()> {
        self.aggregator.force_update(kind, url).await
    }

    /// Publish the installed firmware versions
    pub async fn report_versions(&self) {
        report_versions(&self.aggregator, &self.bus).await;
    }

    pub fn current_job(&self) -> Option<OtaJob> {
        self.sequencer.current()
    }

    pub fn ring_buffer(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn flasher_state(&self) -> FlasherState {
        *self.flasher_state.borrow()
    }

    pub fn aggregator_state(&self) -> AggregatorState {
        self.aggregator.state()
    }

    /// Stop every task; a running job ends as canceled
    pub async fn shutdown(self) {
        info!("Shutting down OTA engine");
        self.shutdown.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Engine task ended abnormally");
            }
        }
        // The privileged worker only exits once every bridge is gone
        self.bridge_task.abort();
    }
}

impl std::fmt::Debug for OtaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaEngine")
            .field("sequencer", &self.sequencer)
            .field("aggregator", &self.aggregator)
            .field("ring", &self.ring)
            .finish_non_exhaustive()
    }
}

fn set_network(network: &watch::Sender<bool>, online: bool) {
    let previous = network.send_replace(online);
    if previous != online {
        info!(online, "Network availability changed");
    }
}

async fn report_versions(aggregator: &StatusAggregator, bus: &EventBus) {
    let (main, companion) = aggregator.installed_versions().await;
    info!(main = ?main, companion = ?companion, "Reporting installed versions");
    bus.publish(OtaEvent::VersionsReported { main, companion });
}

/// Reacts to the consumed events on the bus
struct Dispatcher {
    events: EventStream,
    bus: EventBus,
    network: Arc<watch::Sender<bool>>,
    aggregator: StatusAggregator,
}

impl Dispatcher {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                OtaEvent::ConnectivityChanged { online } => set_network(&self.network, online),
                OtaEvent::ManifestReceived(manifest) => {
                    let aggregator = self.aggregator.clone();
                    tokio::spawn(async move {
                        if let Err(err) = aggregator.handle_manifest(&manifest).await {
                            debug!(error = %err, "Manifest update ended with an error");
                        }
                    });
                }
                OtaEvent::MqttConnected => {
                    let aggregator = self.aggregator.clone();
                    let bus = self.bus.clone();
                    tokio::spawn(async move { report_versions(&aggregator, &bus).await });
                }
                _ => {}
            }
        }
        debug!("Event dispatcher stopped");
    }
}
