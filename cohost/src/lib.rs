//! Partition controller for co-hosted guest kernels.
//!
//! A [`CohostDevice`] takes a set of cores and a slice of physical memory
//! away from the host kernel. [`OsInstance`]s carve their share out of that
//! partition, load an ELF image, and boot it on their lowest core through
//! a real-mode trampoline and an INIT/STARTUP wake.
//!
//! ```ignore
//! let device = CohostDevice::open(DeviceOptions::default(), host).await?;
//! let os = device.create_instance()?;
//! os.allocate_resources(&ResourceRequest {
//!     cpus: Some(CpuSelection::Count(2)),
//!     memory: vec![MemoryRequest::new(MemSize::Bytes(128 << 20), 0)],
//! })?;
//! os.load_image_file("kernel.elf")?;
//! os.boot().await?;
//! os.wait_for_status(OsStatus::Running, Duration::from_secs(5)).await?;
//! ```

pub mod boot;
pub mod cpu;
pub mod device;
pub mod host;
pub mod instance;
pub mod kmsg;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod options;
pub mod pipeline;

pub use device::CohostDevice;
pub use host::{Host, SimulatedHost, SimulatedHostConfig};
pub use instance::{IkcPair, InstanceInfo, OsInstance, OsStatus, ResourceRequest};
pub use logging::init_logging;
pub use memory::{MemSize, MemoryRequest};
pub use metrics::DeviceMetrics;
pub use options::{CpuSelection, DeviceOptions};

pub use cohost_shared::{CohostError, CohostResult, ErrorKind, InstanceId, NodeId};
