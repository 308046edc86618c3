//! Physical memory partitioning.
//!
//! - [`MemoryRegistry`]: free/used chunk lists with coalescing
//! - [`numa`]: balanced multi-node reservation planning

mod chunk;
pub mod numa;
mod registry;

pub use chunk::{ChunkOrigin, MemSize, MemoryChunk, MemoryRequest, UsedChunk};
pub use registry::{MemoryRegistry, MemoryStats};
