pub mod address;
pub mod kernel_runtime;
pub mod mem_reuse;
pub mod memory_manager;
pub mod memory_pool;
pub mod sim_device;

pub use address::{DeviceAddress, DeviceAddressPtr};
pub use kernel_runtime::{InputTensor, KernelRuntime, LaunchArgs};
pub use mem_reuse::{LifetimeReusePlanner, ReusePlanner};
pub use memory_manager::{MemFlag, MemoryManager};
pub use memory_pool::{DeviceMemPool, DynamicMemPool, SingleBlockPool};
pub use sim_device::{DevicePtr, SimDevice, Stream};
