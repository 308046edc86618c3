//! Reserved CPU bookkeeping.

mod registry;

pub use registry::{CpuRegistry, ReservedCpu};
