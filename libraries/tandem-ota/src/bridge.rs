//! Worker-Call Bridge
//!
//! The main-firmware partition primitives may only run inside one
//! privileged task, which owns the [`PartitionOps`] implementation. Every
//! other task reaches them through [`WorkerBridge`]: the request is posted
//! with a bounded wait, the privileged task runs the primitive and answers
//! on a one-shot channel, and the caller waits for that answer without a
//! timeout.

use crate::error::{CallError, PartitionError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to an open main-firmware update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OtaHandle(pub u32);

/// Application descriptor embedded in a firmware image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub version: String,
    pub project_name: String,
}

/// Reference to a flash partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRef {
    pub label: String,
    pub address: u32,
}

/// Result of one incremental `perform` step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformStatus {
    /// More data to go
    InProgress { written: u64, total: Option<u64> },
    /// The whole image is in the partition
    Complete { written: u64 },
}

/// Main-firmware partition primitives
#[async_trait]
pub trait PartitionOps: Send {
    async fn begin(&mut self, url: &str, timeout: Duration) -> Result<OtaHandle, PartitionError>;

    async fn image_descriptor(&mut self, handle: OtaHandle) -> Result<AppDescriptor, PartitionError>;

    async fn running_partition(&mut self) -> Result<PartitionRef, PartitionError>;

    async fn partition_descriptor(
        &mut self,
        partition: &PartitionRef,
    ) -> Result<AppDescriptor, PartitionError>;

    /// Move the download forward by one step
    async fn perform(&mut self, handle: OtaHandle) -> Result<PerformStatus, PartitionError>;

    /// Validate the image and make it the boot target
    async fn finish(&mut self, handle: OtaHandle) -> Result<(), PartitionError>;

    async fn abort(&mut self, handle: OtaHandle) -> Result<(), PartitionError>;
}

type Reply<T> = oneshot::Sender<Result<T, PartitionError>>;

/// Requests understood by the privileged worker
pub(crate) enum WorkerCall {
    Begin {
        url: String,
        timeout: Duration,
        reply: Reply<OtaHandle>,
    },
    ImageDescriptor {
        handle: OtaHandle,
        reply: Reply<AppDescriptor>,
    },
    RunningDescriptor {
        reply: Reply<AppDescriptor>,
    },
    Perform {
        handle: OtaHandle,
        reply: Reply<PerformStatus>,
    },
    Finish {
        handle: OtaHandle,
        reply: Reply<()>,
    },
    Abort {
        handle: OtaHandle,
        reply: Reply<()>,
    },
}

impl WorkerCall {
    fn name(&self) -> &'static str {
        match self {
            WorkerCall::Begin { .. } => "begin",
            WorkerCall::ImageDescriptor { .. } => "image_descriptor",
            WorkerCall::RunningDescriptor { .. } => "running_descriptor",
            WorkerCall::Perform { .. } => "perform",
            WorkerCall::Finish { .. } => "finish",
            WorkerCall::Abort { .. } => "abort",
        }
    }
}

/// Runs partition primitives on behalf of bridge callers
pub struct PrivilegedWorker {
    ops: Box<dyn PartitionOps>,
    calls: mpsc::Receiver<WorkerCall>,
}

impl PrivilegedWorker {
    /// Start the privileged task and return the bridge that feeds it
    pub fn spawn(
        ops: Box<dyn PartitionOps>,
        queue_depth: usize,
        post_timeout: Duration,
    ) -> (WorkerBridge, JoinHandle<()>) {
        let (tx, calls) = mpsc::channel(queue_depth.max(1));
        let worker = Self { ops, calls };
        let handle = tokio::spawn(worker.run());
        (WorkerBridge { tx, post_timeout }, handle)
    }

    async fn run(mut self) {
        while let Some(call) = self.calls.recv().await {
            debug!(call = call.name(), "Privileged worker executing call");
            self.execute(call).await;
        }
        debug!("Privileged worker stopped, all bridges dropped");
    }

    async fn execute(&mut self, call: WorkerCall) {
        // A dropped reply means the caller is gone; the primitive still ran.
        match call {
            WorkerCall::Begin {
                url,
                timeout,
                reply,
            } => {
                let _ = reply.send(self.ops.begin(&url, timeout).await);
            }
            WorkerCall::ImageDescriptor { handle, reply } => {
                let _ = reply.send(self.ops.image_descriptor(handle).await);
            }
            WorkerCall::RunningDescriptor { reply } => {
                let result = match self.ops.running_partition().await {
                    Ok(partition) => self.ops.partition_descriptor(&partition).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            WorkerCall::Perform { handle, reply } => {
                let _ = reply.send(self.ops.perform(handle).await);
            }
            WorkerCall::Finish { handle, reply } => {
                let _ = reply.send(self.ops.finish(handle).await);
            }
            WorkerCall::Abort { handle, reply } => {
                let _ = reply.send(self.ops.abort(handle).await);
            }
        }
    }
}

/// Synchronous call path into the privileged worker
#[derive(Clone)]
pub struct WorkerBridge {
    tx: mpsc::Sender<WorkerCall>,
    post_timeout: Duration,
}

impl WorkerBridge {
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> WorkerCall,
    ) -> Result<T, CallError> {
        let (reply, answer) = oneshot::channel();
        let call = make(reply);
        let name = call.name();

        if let Err(e) = self.tx.send_timeout(call, self.post_timeout).await {
            warn!(call = name, error = %e, "Could not post worker call");
            return Err(CallError::Dispatch);
        }

        match answer.await {
            Ok(result) => result.map_err(CallError::from),
            Err(_) => {
                warn!(call = name, "Privileged worker dropped the call");
                Err(CallError::Dispatch)
            }
        }
    }

    pub async fn begin(&self, url: &str, timeout: Duration) -> Result<OtaHandle, CallError> {
        let url = url.to_string();
        self.call(|reply| WorkerCall::Begin {
            url,
            timeout,
            reply,
        })
        .await
    }

    pub async fn image_descriptor(&self, handle: OtaHandle) -> Result<AppDescriptor, CallError> {
        self.call(|reply| WorkerCall::ImageDescriptor { handle, reply })
            .await
    }

    /// Descriptor of the partition the device is running from
    pub async fn running_descriptor(&self) -> Result<AppDescriptor, CallError> {
        self.call(|reply| WorkerCall::RunningDescriptor { reply }).await
    }

    pub async fn perform(&self, handle: OtaHandle) -> Result<PerformStatus, CallError> {
        self.call(|reply| WorkerCall::Perform { handle, reply }).await
    }

    pub async fn finish(&self, handle: OtaHandle) -> Result<(), CallError> {
        self.call(|reply| WorkerCall::Finish { handle, reply }).await
    }

    pub async fn abort(&self, handle: OtaHandle) -> Result<(), CallError> {
        self.call(|reply| WorkerCall::Abort { handle, reply }).await
    }
}

impl std::fmt::Debug for WorkerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBridge")
            .field("post_timeout", &self.post_timeout)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}
