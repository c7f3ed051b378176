//! Target device selection.

use serde::{Serialize, Serializer};
use std::fmt;

/// Where resident models live. Chosen once when the manager is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl Device {
    /// The first accelerator if GPU use is enabled and one is present, else the CPU.
    pub fn select(enable_gpu: bool, accelerator: &dyn Accelerator) -> Self {
        if enable_gpu && accelerator.is_available() {
            Device::Cuda(0)
        } else {
            Device::Cpu
        }
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(0) => f.write_str("cuda"),
            Device::Cuda(n) => write!(f, "cuda:{}", n),
        }
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Availability and memory accounting for an accelerator runtime.
pub trait Accelerator: Send + Sync {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
    fn allocated_bytes(&self) -> u64;
    fn reserved_bytes(&self) -> u64;
    /// Return cached, unused device memory to the driver.
    fn release_cached(&self);
}

/// Host without an accelerator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAccelerator;

impl Accelerator for NoAccelerator {
    fn name(&self) -> &str {
        "none"
    }
    fn is_available(&self) -> bool {
        false
    }
    fn allocated_bytes(&self) -> u64 {
        0
    }
    fn reserved_bytes(&self) -> u64 {
        0
    }
    fn release_cached(&self) {}
}
