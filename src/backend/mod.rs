//! Compute backends
//!
//! A backend compiles named programs, allocates device memory and runs an
//! in-order queue of launches. The host backend runs everything on a worker
//! thread; the Vulkan backend drives a real device through `ash`.

pub mod host;
pub mod vulkan;

use std::any::Any;
use std::fmt::{self, Debug};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::kernel::{ArgKind, KernelArg};
use crate::memory::BufferAllocator;
use crate::worksize::WorkSize;

/// Device vendor; selects hardware-specific kernel paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Vendor {
    #[default]
    Generic,
    Mali,
    PowerVR,
    Adreno,
}

impl Vendor {
    /// Map a PCI vendor id as reported by the driver.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x13B5 => Vendor::Mali,
            0x1010 => Vendor::PowerVR,
            0x5143 => Vendor::Adreno,
            _ => Vendor::Generic,
        }
    }
}

impl FromStr for Vendor {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generic" => Ok(Vendor::Generic),
            "mali" => Ok(Vendor::Mali),
            "powervr" => Ok(Vendor::PowerVR),
            "adreno" => Ok(Vendor::Adreno),
            other => Err(RuntimeError::Config(format!("unknown vendor '{}'", other))),
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum work items in one work group.
    pub max_work_group_size: u32,
    pub compute_units: u32,
    pub vendor: Vendor,
}

/// A compiled, launchable kernel.
pub trait Program: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Positional parameter kinds, in declaration order.
    fn signature(&self) -> &[ArgKind];

    fn as_any(&self) -> &dyn Any;
}

/// One validated launch, ready for the queue.
#[derive(Debug)]
pub struct Launch {
    pub program: Arc<dyn Program>,
    pub args: Vec<KernelArg>,
    pub work: WorkSize,
}

pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn limits(&self) -> DeviceLimits;

    fn allocator(&self) -> Arc<dyn BufferAllocator>;

    /// Build the program registered under `name` (full, suffixed).
    fn compile(&self, name: &str) -> Result<Arc<dyn Program>, RuntimeError>;

    /// Every name `compile` accepts.
    fn kernel_names(&self) -> Vec<String>;

    /// Queue a launch. Returns once submitted; launches run in submission
    /// order.
    fn submit(&self, launch: Launch) -> Result<(), RuntimeError>;

    /// Block until the queue drains. Reports the first launch that failed
    /// since the previous call.
    fn finish(&self) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_parsing() {
        assert_eq!("PowerVR".parse::<Vendor>().unwrap(), Vendor::PowerVR);
        assert_eq!("mali".parse::<Vendor>().unwrap(), Vendor::Mali);
        assert!("voodoo".parse::<Vendor>().is_err());
        assert_eq!(Vendor::from_vendor_id(0x1010), Vendor::PowerVR);
        assert_eq!(Vendor::from_vendor_id(0x10DE), Vendor::Generic);
    }
}
