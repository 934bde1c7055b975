//! Allocator descriptors and execution-provider defaults.
//!
//! The planner never allocates memory; it tags every value with the
//! [`AllocatorInfo`] the executor should allocate it from. Two values may
//! share a buffer only when their descriptors compare equal field-for-field.

use std::fmt;

use serde::Serialize;

/// Memory type requested for an argument or allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemType {
    /// The provider's default device memory.
    Default,
    /// The argument must live in CPU-addressable memory regardless of the
    /// node's provider (e.g. a shape tensor consumed on the host).
    CpuExplicit,
}

/// Execution providers a node can be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProviderKind {
    Cpu,
    Cuda,
}

impl ProviderKind {
    /// Descriptor of this provider's default allocator for `mem_type`.
    pub fn default_allocator(self, mem_type: MemType) -> AllocatorInfo {
        match (self, mem_type) {
            (ProviderKind::Cpu, _) | (_, MemType::CpuExplicit) => AllocatorInfo {
                name: "cpu",
                device_id: 0,
                mem_type,
            },
            (ProviderKind::Cuda, MemType::Default) => AllocatorInfo {
                name: "cuda",
                device_id: 0,
                mem_type,
            },
        }
    }

    /// True when this provider allocates in host memory by default.
    pub fn is_cpu(self) -> bool {
        matches!(self, ProviderKind::Cpu)
    }
}

/// Identifies a concrete allocator: which backend, which device, which
/// memory type. Equality is bit-for-bit on all three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AllocatorInfo {
    pub name: &'static str,
    pub device_id: i32,
    pub mem_type: MemType,
}

impl fmt::Display for AllocatorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mem = match self.mem_type {
            MemType::Default => "default",
            MemType::CpuExplicit => "cpu-explicit",
        };
        write!(f, "{}({})[{}]", self.name, self.device_id, mem)
    }
}
