pub mod builtin;
pub mod registry;

use crate::device::sim_device::{DevicePtr, Stream};

pub use registry::{KernelBuildInfo, KernelFactory, KernelRegistry};

/// Launch argument: raw device pointer and byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub addr: DevicePtr,
    pub size: usize,
}

/// Compiled kernel as seen by the runtime.
pub trait KernelMod: Send + Sync {
    fn output_size_list(&self) -> &[usize];

    fn workspace_size_list(&self) -> &[usize] {
        &[]
    }

    fn launch(
        &self,
        inputs: &[Address],
        workspaces: &[Address],
        outputs: &[Address],
        stream: &Stream,
    ) -> anyhow::Result<()>;
}
