//! INIT / STARTUP wake sequence.

use crate::host::{InterruptController, Ipi};
use crate::options::BootTimings;
use cohost_shared::errors::{CohostError, CohostResult};
use serde::Serialize;
use std::sync::Arc;

/// Error status bits that indicate a rejected IPI. Bit 4 (receive accept
/// error) is ignored, it is raised spuriously on some parts.
const ESR_ACCEPT_MASK: u32 = 0xEF;

/// Combined outcome of a wake attempt. Zero in both fields means the
/// interrupt controller reported no error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WakeStatus {
    pub accept: u32,
    pub send: u32,
}

impl WakeStatus {
    pub fn is_ok(&self) -> bool {
        self.accept == 0 && self.send == 0
    }
}

/// Drives the interrupt controller through the wake and reset protocols.
///
/// Every wait is bounded by [`BootTimings`]; nothing here blocks for more
/// than a few tens of milliseconds with the default timings.
#[derive(Clone)]
pub struct IpiSequencer {
    apic: Arc<dyn InterruptController>,
    timings: BootTimings,
}

impl IpiSequencer {
    pub fn new(apic: Arc<dyn InterruptController>, timings: BootTimings) -> Self {
        Self { apic, timings }
    }

    /// Start the core `hw_id` executing real-mode code at `start_ip`.
    ///
    /// Uses the host's built-in wake primitive when there is one, otherwise
    /// INIT assert, INIT de-assert, a delay, then up to two STARTUP IPIs.
    pub fn wake(&self, hw_id: u32, start_ip: u64) -> CohostResult<WakeStatus> {
        if start_ip % 0x1000 != 0 || start_ip >= 0x10_0000 {
            return Err(CohostError::Validation(format!(
                "start address {:#x} is not a page below 1 MiB",
                start_ip
            )));
        }

        if let Some(rc) = self.apic.wake_secondary(hw_id, start_ip) {
            tracing::debug!(hw_id, rc, "woke core with host primitive");
            return Ok(WakeStatus {
                accept: 0,
                send: rc as u32,
            });
        }

        let vector = (start_ip >> 12) as u8;
        let mut status = self.init_cycle(hw_id);
        if !status.is_ok() {
            tracing::warn!(hw_id, ?status, "INIT not accepted");
            return Ok(status);
        }

        std::thread::sleep(self.timings.init_deassert_delay());

        for attempt in 0..self.timings.startup_count {
            self.apic.read_error_status();
            self.apic.send_ipi(hw_id, Ipi::Startup { vector });
            std::thread::sleep(self.timings.startup_settle());
            status.send = self.wait_for_delivery();
            status.accept = self.apic.read_error_status() & ESR_ACCEPT_MASK;
            if !status.is_ok() {
                tracing::warn!(hw_id, attempt, ?status, "STARTUP not accepted");
                break;
            }
        }

        tracing::debug!(hw_id, vector, ?status, "wake sequence done");
        Ok(status)
    }

    /// INIT assert and de-assert without STARTUP. Leaves the core halted in
    /// wait-for-SIPI state.
    pub fn reset(&self, hw_id: u32) -> WakeStatus {
        let status = self.init_cycle(hw_id);
        if !status.is_ok() {
            tracing::warn!(hw_id, ?status, "reset not accepted");
        }
        status
    }

    fn init_cycle(&self, hw_id: u32) -> WakeStatus {
        self.apic.read_error_status();

        self.apic.send_ipi(hw_id, Ipi::InitAssert);
        let mut send = self.wait_for_delivery();
        let accept = self.apic.read_error_status() & ESR_ACCEPT_MASK;

        self.apic.send_ipi(hw_id, Ipi::InitDeassert);
        send |= self.wait_for_delivery();

        WakeStatus { accept, send }
    }

    /// 0 once the controller reports delivery, 1 if the poll budget ran out.
    fn wait_for_delivery(&self) -> u32 {
        for _ in 0..self.timings.delivery_poll_limit {
            if !self.apic.delivery_pending() {
                return 0;
            }
            let interval = self.timings.delivery_poll_interval();
            if interval.is_zero() {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(interval);
            }
        }
        u32::from(self.apic.delivery_pending())
    }
}
