//! Device-level controls the orchestrator needs after an update

/// Restarts the device
pub trait SystemControl: Send + Sync {
    /// Reboot into the newly selected firmware
    fn restart(&self);
}
