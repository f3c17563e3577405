//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Alert sink contract fired once a run has been made safe."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;
use paraload_common::{AlertChannel, ShutdownReason};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// Destination for end-of-run alerts. Failures are reported, never fatal to the run.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn trigger(&self, reason: &ShutdownReason, body: &str) -> Result<(), AlertError>;
}

/// Emits alerts as structured `warn!` events.
#[derive(Debug, Clone)]
pub struct TracingAlertSink {
    channel: AlertChannel,
}

impl TracingAlertSink {
    pub fn new(channel: AlertChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn trigger(&self, reason: &ShutdownReason, body: &str) -> Result<(), AlertError> {
        warn!(
            subject = %self.channel.subject,
            recipients = ?self.channel.recipients,
            reason = reason.label(),
            body,
            "alert raised"
        );
        Ok(())
    }
}

/// Whether a run ending for `reason` should raise an alert on `channel`.
/// A completed profile with skipped steps always alerts.
pub fn should_alert(channel: &AlertChannel, reason: &ShutdownReason, skipped_steps: usize) -> bool {
    !matches!(reason, ShutdownReason::ProfileCompleted)
        || skipped_steps > 0
        || channel.notify_on_completion
}

/// Alert body: the reason, the safe-state summary, and the triggering detail.
pub fn alert_body(reason: &ShutdownReason, detail: Option<&str>, relative_s: f64) -> String {
    let mut body = format!(
        "Load test stopped: {reason}\n\
         Elapsed: {relative_s:.1} s\n\n\
         Safe shutdown sequence executed:\n\
         \x20 1. Power ramped to 0 W\n\
         \x20 2. Loads and inputs turned OFF\n\
         \x20 3. Parallel mode disabled\n\
         \x20 4. Units returned to LOCAL control\n"
    );
    if let Some(detail) = detail {
        body.push_str("\nDetail: ");
        body.push_str(detail);
        body.push('\n');
    }
    body
}
