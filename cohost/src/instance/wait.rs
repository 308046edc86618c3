use super::{OsInstance, OsStatus};
use cohost_shared::errors::{CohostError, CohostResult};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

impl OsInstance {
    /// Poll [`query_status`](Self::query_status) until the instance reaches
    /// `target` or a terminal status, or `timeout` elapses.
    ///
    /// When `target` is a boot step, the wait also ends once the instance
    /// drops off the boot path, e.g. because it was shut down meanwhile.
    ///
    /// Dropping the returned future abandons the wait.
    pub async fn wait_for_status(
        &self,
        target: OsStatus,
        timeout: Duration,
    ) -> CohostResult<OsStatus> {
        let poll = async {
            let mut ticker = tokio::time::interval(self.device.options.status_poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut seen_boot_path = false;
            loop {
                ticker.tick().await;
                let status = self.query_status()?;
                if status.has_reached(target) || status.is_terminal() {
                    return Ok(status);
                }
                if target.on_boot_path() {
                    let left = matches!(status, OsStatus::Shutdown | OsStatus::Stopped)
                        || (seen_boot_path && !status.is_booted());
                    if left {
                        return Ok(status);
                    }
                    seen_boot_path |= status.on_boot_path();
                }
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => {
                let status = self.status();
                tracing::debug!(os_id = self.id(), %target, %status, "wait timed out");
                Err(CohostError::Timeout(format!(
                    "os {} did not reach {} within {:?} (status {})",
                    self.id(),
                    target,
                    timeout,
                    status
                )))
            }
        }
    }
}
