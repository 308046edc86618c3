//! Device configuration.
//!
//! [`DeviceOptions`] is plain data: it can be built in code, or loaded from a
//! JSON file with [`DeviceOptions::from_file`]. Every field has a default so a
//! config file only names what it changes:
//!
//! ```json
//! {
//!   "memory": [{ "size": "128M", "node": 0 }, { "size": "64M", "node": 0 }],
//!   "cpus": 2,
//!   "log": { "filter": "cohost=debug" }
//! }
//! ```

use crate::host::PhysRange;
use crate::memory::{MemSize, MemoryRequest};
use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::layout::{HUGE_PAGE_SIZE, PAGE_SIZE};
use cohost_shared::NodeId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timing of the INIT/STARTUP wake sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootTimings {
    /// Delay between INIT de-assert and the first STARTUP.
    pub init_deassert_delay_ms: u64,
    /// Settle time after each STARTUP.
    pub startup_settle_us: u64,
    /// STARTUP IPIs to send (1 or 2).
    pub startup_count: u32,
    /// Polls of the delivery-pending bit before giving up.
    pub delivery_poll_limit: u32,
    pub delivery_poll_interval_us: u64,
}

impl Default for BootTimings {
    fn default() -> Self {
        Self {
            init_deassert_delay_ms: 10,
            startup_settle_us: 200,
            startup_count: 2,
            delivery_poll_limit: 1000,
            delivery_poll_interval_us: 1,
        }
    }
}

impl BootTimings {
    /// No delays. For simulated hosts.
    pub fn immediate() -> Self {
        Self {
            init_deassert_delay_ms: 0,
            startup_settle_us: 0,
            delivery_poll_interval_us: 0,
            ..Self::default()
        }
    }

    pub fn init_deassert_delay(&self) -> Duration {
        Duration::from_millis(self.init_deassert_delay_ms)
    }

    pub fn startup_settle(&self) -> Duration {
        Duration::from_micros(self.startup_settle_us)
    }

    pub fn delivery_poll_interval(&self) -> Duration {
        Duration::from_micros(self.delivery_poll_interval_us)
    }
}

/// Balanced multi-node reservation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceOptions {
    /// Allowed fractional spread of per-node totals around their mean.
    pub variance_limit: f64,
}

/// Which host cores to reserve at init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CpuSelection {
    /// This many cores, highest logical ids first.
    Count(u32),
    /// Exactly these logical ids.
    List(Vec<u32>),
}

impl Default for CpuSelection {
    fn default() -> Self {
        CpuSelection::Count(1)
    }
}

/// A physical range handed to the registry as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticWindow {
    pub start: u64,
    pub size: MemSize,
    #[serde(default)]
    pub node: NodeId,
}

impl StaticWindow {
    pub fn range(&self) -> Option<PhysRange> {
        self.size.bytes().map(|size| PhysRange::new(self.start, size))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Write daily-rolled log files here instead of stderr.
    pub dir: Option<PathBuf>,
    /// Filter used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            dir: None,
            filter: "cohost=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Memory reserved at init.
    pub memory: Vec<MemoryRequest>,
    /// Reserve `memory` as one balanced multi-node request.
    pub balance: Option<BalanceOptions>,
    pub cpus: CpuSelection,
    /// Free-list length above which the smallest chunks go back to the host.
    pub max_free_chunks: usize,
    pub static_window: Option<StaticWindow>,
    /// Carve allocations out of larger chunks instead of handing chunks over whole.
    pub split_chunks: bool,
    /// Upper bound of the identity map. Multiple of 1 GiB.
    pub identity_map_ceiling: u64,
    /// Low page the trampoline is copied to.
    pub trampoline_phys: u64,
    /// Virtual address guest images are linked at.
    pub guest_link_base: u64,
    pub notification_irq: u32,
    pub boot_timings: BootTimings,
    pub status_poll_interval_ms: u64,
    /// Report a running guest as hung up once its heartbeat stalls this long.
    pub liveness_timeout_ms: Option<u64>,
    pub log: LogOptions,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            memory: vec![MemoryRequest::new(MemSize::Bytes(256 << 20), 0)],
            balance: None,
            cpus: CpuSelection::default(),
            max_free_chunks: 64,
            static_window: None,
            split_chunks: true,
            identity_map_ceiling: 64 * HUGE_PAGE_SIZE,
            trampoline_phys: 0x8000,
            guest_link_base: 0xFFFF_FFFF_8000_0000,
            notification_irq: 0xF2,
            boot_timings: BootTimings::default(),
            status_poll_interval_ms: 10,
            liveness_timeout_ms: None,
            log: LogOptions::default(),
        }
    }
}

impl DeviceOptions {
    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> CohostResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CohostError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let options: DeviceOptions = serde_json::from_str(&text).map_err(|e| {
            CohostError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Option<Duration> {
        self.liveness_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> CohostResult<()> {
        if let Some(balance) = &self.balance {
            if !(0.0..1.0).contains(&balance.variance_limit) {
                return Err(CohostError::Config(format!(
                    "variance_limit {} must be in [0, 1)",
                    balance.variance_limit
                )));
            }
            if self.memory.is_empty() {
                return Err(CohostError::Config("balanced reservation without memory requests".into()));
            }
        }

        match &self.cpus {
            CpuSelection::Count(0) => {
                return Err(CohostError::Config("cpus must reserve at least one core".into()));
            }
            CpuSelection::List(ids) if ids.is_empty() => {
                return Err(CohostError::Config("cpus list is empty".into()));
            }
            CpuSelection::List(ids) if ids.contains(&0) => {
                return Err(CohostError::Config("cpu 0 stays with the host".into()));
            }
            _ => {}
        }

        if self.max_free_chunks == 0 {
            return Err(CohostError::Config("max_free_chunks must be nonzero".into()));
        }

        if let Some(window) = &self.static_window {
            match window.range() {
                Some(range) if range.start % PAGE_SIZE == 0 && range.size % PAGE_SIZE == 0 => {}
                _ => {
                    return Err(CohostError::Config(
                        "static_window needs a page-aligned start and an explicit size".into(),
                    ));
                }
            }
        }

        let ceiling = self.identity_map_ceiling;
        if ceiling == 0 || ceiling % HUGE_PAGE_SIZE != 0 || ceiling > 512 * HUGE_PAGE_SIZE {
            return Err(CohostError::Config(format!(
                "identity_map_ceiling {:#x} must be a nonzero multiple of 1 GiB up to 512 GiB",
                ceiling
            )));
        }

        let tramp = self.trampoline_phys;
        if tramp % PAGE_SIZE != 0 || tramp == 0 || tramp >= 0x10_0000 {
            return Err(CohostError::Config(format!(
                "trampoline_phys {:#x} must be a page-aligned address below 1 MiB",
                tramp
            )));
        }

        crate::boot::check_link_base(self.guest_link_base)
            .map_err(|e| CohostError::Config(e.to_string()))?;

        if !(1..=2).contains(&self.boot_timings.startup_count) {
            return Err(CohostError::Config("startup_count must be 1 or 2".into()));
        }
        if self.status_poll_interval_ms == 0 {
            return Err(CohostError::Config("status_poll_interval_ms must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_validate() {
        DeviceOptions::default().validate().unwrap();
    }

    #[test]
    fn test_from_file_with_partial_fields() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "memory": [{{"size": "128M", "node": 0}}, {{"size": "64M"}}],
                "cpus": [6, 7],
                "liveness_timeout_ms": 500,
                "boot_timings": {{"init_deassert_delay_ms": 0}}
            }}"#
        )
        .unwrap();

        let options = DeviceOptions::from_file(file.path()).unwrap();
        assert_eq!(options.memory.len(), 2);
        assert_eq!(options.memory[1].size, MemSize::Bytes(64 << 20));
        assert_eq!(options.cpus, CpuSelection::List(vec![6, 7]));
        assert_eq!(options.liveness_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(options.boot_timings.init_deassert_delay_ms, 0);
        assert_eq!(options.boot_timings.startup_count, 2);
        assert!(options.split_chunks);
    }

    #[test]
    fn test_from_file_reports_config_errors() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"cpus": 0}}"#).unwrap();
        let err = DeviceOptions::from_file(file.path()).unwrap_err();
        assert!(matches!(err, CohostError::Config(_)));

        let err = DeviceOptions::from_file("/nonexistent/cohost.json").unwrap_err();
        assert!(matches!(err, CohostError::Config(_)));
    }

    #[test]
    fn test_validation_rules() {
        let check = |f: &dyn Fn(&mut DeviceOptions)| {
            let mut options = DeviceOptions::default();
            f(&mut options);
            options.validate()
        };
        assert!(check(&|o| o.cpus = CpuSelection::List(vec![0, 1])).is_err());
        assert!(check(&|o| o.identity_map_ceiling = HUGE_PAGE_SIZE + PAGE_SIZE).is_err());
        assert!(check(&|o| o.trampoline_phys = 0x10_0000).is_err());
        assert!(check(&|o| o.guest_link_base = 0x4000_0000).is_err());
        assert!(check(&|o| o.balance = Some(BalanceOptions { variance_limit: 1.0 })).is_err());
        assert!(check(&|o| o.max_free_chunks = 0).is_err());
        assert!(check(&|o| o.boot_timings.startup_count = 3).is_err());
        assert!(check(&|o| {
            o.static_window = Some(StaticWindow { start: 0x1000_0000, size: MemSize::All, node: 0 })
        })
        .is_err());
        assert!(check(&|o| o.balance = Some(BalanceOptions { variance_limit: 0.2 })).is_ok());
    }
}
