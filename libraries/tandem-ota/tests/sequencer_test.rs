//! Job sequencer behavior with a scripted job runner

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{ArtifactKind, OtaError, OtaJob, Result, StatusKind};
use tandem_ota::{EngineConfig, EventBus, JobRunner, JobSequencer, OtaEvent, StatusReporter};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

// ===== Helpers =====

/// Runs until released or canceled
#[derive(Default)]
struct GatedRunner {
    release: Notify,
    started: AtomicU32,
    outcome: Option<OtaError>,
}

#[async_trait]
impl JobRunner for GatedRunner {
    async fn run(&self, _job: &OtaJob, cancel: CancellationToken, reporter: StatusReporter) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        reporter.progress(0);

        tokio::select! {
            _ = cancel.cancelled() => Err(OtaError::UserCanceled),
            _ = self.release.notified() => match self.outcome {
                Some(err) => Err(err),
                None => {
                    reporter.progress(50);
                    Ok(())
                }
            },
        }
    }
}

struct Fixture {
    sequencer: JobSequencer,
    runner: Arc<GatedRunner>,
    network: watch::Sender<bool>,
    bus: EventBus,
}

fn fixture(runner: GatedRunner, online: bool) -> Fixture {
    let runner = Arc::new(runner);
    let (network, network_rx) = watch::channel(online);
    let bus = EventBus::new(64);
    let (sequencer, _worker) = JobSequencer::spawn(
        runner.clone(),
        network_rx,
        bus.clone(),
        Arc::new(EngineConfig::default()),
        CancellationToken::new(),
    );
    Fixture {
        sequencer,
        runner,
        network,
        bus,
    }
}

async fn wait_started(runner: &GatedRunner, count: u32) {
    while runner.started.load(Ordering::SeqCst) < count {
        tokio::task::yield_now().await;
    }
}

async fn next_finished(stream: &mut tandem_ota::EventStream) -> Option<OtaError> {
    loop {
        if let Some(OtaEvent::JobFinished { error, .. }) = stream.recv().await {
            return error;
        }
    }
}

const KINDS: [ArtifactKind; 3] = [
    ArtifactKind::MainFirmware,
    ArtifactKind::CompanionFirmware,
    ArtifactKind::AiModel,
];

// ===== Tests =====

#[tokio::test]
async fn second_submission_is_rejected_for_every_kind() {
    let fx = fixture(GatedRunner::default(), true);
    let first = OtaJob::new(ArtifactKind::CompanionFirmware, "http://x/fw.bin");
    fx.sequencer.submit(first.clone()).await.unwrap();
    wait_started(&fx.runner, 1).await;

    for kind in KINDS {
        let result = fx.sequencer.submit(OtaJob::new(kind, "http://x/other.bin")).await;
        assert_eq!(result, Err(OtaError::AlreadyRunning));
        assert_eq!(fx.sequencer.current().map(|job| job.id), Some(first.id.clone()));
    }
    assert_eq!(fx.runner.started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn model_submission_waits_for_the_verdict() {
    let fx = fixture(
        GatedRunner {
            outcome: Some(OtaError::FlasherWriteFail),
            ..GatedRunner::default()
        },
        true,
    );

    let sequencer = fx.sequencer.clone();
    let submit = tokio::spawn(async move {
        sequencer
            .submit(OtaJob::new(ArtifactKind::AiModel, "http://x/model.bin"))
            .await
    });

    wait_started(&fx.runner, 1).await;
    assert!(!submit.is_finished());
    fx.runner.release.notify_one();

    assert_eq!(submit.await.unwrap(), Err(OtaError::FlasherWriteFail));
    assert!(!fx.sequencer.is_busy());
}

#[tokio::test]
async fn slot_frees_before_the_terminal_status() {
    let fx = fixture(GatedRunner::default(), true);
    let mut events = fx.bus.subscribe();

    fx.sequencer
        .submit(OtaJob::new(ArtifactKind::CompanionFirmware, "http://x/fw.bin"))
        .await
        .unwrap();
    wait_started(&fx.runner, 1).await;
    fx.runner.release.notify_one();

    let record = loop {
        if let Some(OtaEvent::Status(record)) = events.recv().await {
            if record.is_terminal() {
                break record;
            }
        }
    };
    assert_eq!(record.kind, StatusKind::Succeed);
    assert!(!fx.sequencer.is_busy());
}

#[tokio::test(start_paused = true)]
async fn jobs_wait_for_the_network() {
    let fx = fixture(GatedRunner::default(), false);

    fx.sequencer
        .submit(OtaJob::new(ArtifactKind::MainFirmware, "http://x/main.bin"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(fx.runner.started.load(Ordering::SeqCst), 0);
    assert!(fx.sequencer.is_busy());

    fx.network.send_replace(true);
    wait_started(&fx.runner, 1).await;
}

#[tokio::test]
async fn network_loss_fails_the_job_as_connection_error() {
    let fx = fixture(GatedRunner::default(), true);
    let mut events = fx.bus.subscribe();

    fx.sequencer
        .submit(OtaJob::new(ArtifactKind::CompanionFirmware, "http://x/fw.bin"))
        .await
        .unwrap();
    wait_started(&fx.runner, 1).await;
    fx.network.send_replace(false);

    assert_eq!(next_finished(&mut events).await, Some(OtaError::ConnectionFail));
    assert!(!fx.sequencer.is_busy());
}

#[tokio::test]
async fn abort_cancels_only_a_matching_job() {
    let fx = fixture(GatedRunner::default(), true);
    let mut events = fx.bus.subscribe();

    fx.sequencer
        .submit(OtaJob::new(ArtifactKind::CompanionFirmware, "http://x/fw.bin"))
        .await
        .unwrap();
    wait_started(&fx.runner, 1).await;

    assert_eq!(fx.sequencer.abort(Some(ArtifactKind::MainFirmware)).await, Ok(false));
    assert!(fx.sequencer.is_busy());

    assert_eq!(fx.sequencer.abort(Some(ArtifactKind::CompanionFirmware)).await, Ok(true));
    assert!(!fx.sequencer.is_busy());
    assert_eq!(next_finished(&mut events).await, Some(OtaError::UserCanceled));
}

#[tokio::test]
async fn queue_accepts_the_next_job_after_completion() {
    let fx = fixture(GatedRunner::default(), true);

    for round in 1..=3 {
        fx.sequencer
            .submit(OtaJob::new(ArtifactKind::CompanionFirmware, "http://x/fw.bin"))
            .await
            .unwrap();
        wait_started(&fx.runner, round).await;
        fx.runner.release.notify_one();
        while fx.sequencer.is_busy() {
            tokio::task::yield_now().await;
        }
    }
    assert_eq!(fx.runner.started.load(Ordering::SeqCst), 3);
}
