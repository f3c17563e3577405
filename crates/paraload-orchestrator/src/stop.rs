//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Cooperative stop switch shared between the executor and its caller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

/// Create a connected stop handle and signal.
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: Arc::new(tx) }, StopSignal { rx })
}

/// Caller side of the stop switch. The only control an outside context has over a run.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask the executor to stop at its next check point. Idempotent.
    pub fn request_stop(&self) {
        if !*self.tx.borrow() {
            warn!("stop requested");
        }
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Executor side of the stop switch.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_visible_to_every_signal() {
        let (handle, signal) = stop_channel();
        let other = signal.clone();
        assert!(!signal.is_requested());

        handle.clone().request_stop();
        handle.request_stop();
        assert!(signal.is_requested());
        assert!(other.is_requested());
        assert!(handle.is_requested());
    }

    #[test]
    fn dropped_handle_never_stops() {
        let (handle, signal) = stop_channel();
        drop(handle);
        assert!(!signal.is_requested());
    }
}
