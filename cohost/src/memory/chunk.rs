use crate::host::PhysRange;
use cohost_shared::errors::CohostError;
use cohost_shared::{InstanceId, NodeId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Where a chunk's memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkOrigin {
    /// Page runs acquired from the host page source. Returned on release.
    Host,
    /// Configured static window. Never returned to the host.
    Static,
}

/// A contiguous physical range held by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub start: u64,
    pub size: u64,
    pub node: NodeId,
    pub origin: ChunkOrigin,
}

impl MemoryChunk {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn range(&self) -> PhysRange {
        PhysRange::new(self.start, self.size)
    }

    /// True if `next` starts where `self` ends and the two may be merged.
    pub(crate) fn joins(&self, next: &MemoryChunk) -> bool {
        self.end() == next.start && self.node == next.node && self.origin == next.origin
    }
}

/// A chunk claimed by an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedChunk {
    pub chunk: MemoryChunk,
    pub owner: InstanceId,
}

/// Requested amount of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemSize {
    Bytes(u64),
    /// Everything the host will give.
    #[default]
    All,
}

impl MemSize {
    pub fn bytes(&self) -> Option<u64> {
        match self {
            MemSize::Bytes(b) => Some(*b),
            MemSize::All => None,
        }
    }
}

impl FromStr for MemSize {
    type Err = CohostError;

    /// Accepts `all`, plain byte counts, and `K`/`M`/`G`/`T` suffixes
    /// (binary multiples, optional trailing `B` or `iB`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(MemSize::All);
        }
        let bad = || CohostError::Validation(format!("invalid memory size '{}'", s));

        let upper = s.to_ascii_uppercase();
        let trimmed = upper
            .strip_suffix("IB")
            .or_else(|| upper.strip_suffix('B'))
            .unwrap_or(&upper);
        let (digits, shift) = match trimmed.chars().last() {
            Some('K') => (&trimmed[..trimmed.len() - 1], 10),
            Some('M') => (&trimmed[..trimmed.len() - 1], 20),
            Some('G') => (&trimmed[..trimmed.len() - 1], 30),
            Some('T') => (&trimmed[..trimmed.len() - 1], 40),
            _ => (trimmed, 0),
        };
        let value: u64 = digits.trim().parse().map_err(|_| bad())?;
        let bytes = value.checked_shl(shift).filter(|b| b >> shift == value).ok_or_else(bad)?;
        if bytes == 0 {
            return Err(bad());
        }
        Ok(MemSize::Bytes(bytes))
    }
}

impl fmt::Display for MemSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemSize::All => write!(f, "all"),
            MemSize::Bytes(b) => {
                for (suffix, shift) in [("T", 40), ("G", 30), ("M", 20), ("K", 10)] {
                    if *b >= 1 << shift && b % (1 << shift) == 0 {
                        return write!(f, "{}{}", b >> shift, suffix);
                    }
                }
                write!(f, "{}", b)
            }
        }
    }
}

impl Serialize for MemSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MemSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(0) => Err(serde::de::Error::custom("memory size must be nonzero")),
            Raw::Num(n) => Ok(MemSize::Bytes(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// One reservation request: an amount on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRequest {
    #[serde(default)]
    pub size: MemSize,
    #[serde(default)]
    pub node: NodeId,
}

impl MemoryRequest {
    pub fn new(size: MemSize, node: NodeId) -> Self {
        Self { size, node }
    }
}
