use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::{DataType, Format};
use crate::device::sim_device::{DevicePtr, SimDevice};
use crate::error::RuntimeError;

pub type DeviceAddressPtr = Arc<DeviceAddress>;

/// A buffer in device memory. Shared between nodes that alias it,
/// the pointer can be moved after creation (communication packing).
pub struct DeviceAddress {
    ptr: AtomicUsize,
    size: usize,
    format: Format,
    dtype: DataType,
}

impl DeviceAddress {
    pub fn new(ptr: Option<DevicePtr>, size: usize, format: Format, dtype: DataType) -> DeviceAddressPtr {
        Arc::new(Self {
            ptr: AtomicUsize::new(ptr.unwrap_or(0)),
            size,
            format,
            dtype,
        })
    }

    pub fn ptr(&self) -> Option<DevicePtr> {
        match self.ptr.load(Ordering::SeqCst) {
            0 => None,
            p => Some(p),
        }
    }

    pub fn set_ptr(&self, ptr: DevicePtr) {
        self.ptr.store(ptr, Ordering::SeqCst);
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    fn checked_ptr(&self) -> anyhow::Result<DevicePtr> {
        self.ptr()
            .ok_or_else(|| RuntimeError::SyncFailed("Device address is null".into()).into())
    }

    pub fn sync_host_to_device(&self, device: &SimDevice, host: &[u8]) -> anyhow::Result<()> {
        if host.len() > self.size {
            return Err(RuntimeError::SyncFailed(format!(
                "Host data of {} bytes does not fit device buffer of {} bytes",
                host.len(),
                self.size
            ))
            .into());
        }
        device.write(self.checked_ptr()?, host)
    }

    pub fn sync_device_to_host(&self, device: &SimDevice, len: usize) -> anyhow::Result<Vec<u8>> {
        if len > self.size {
            return Err(RuntimeError::SyncFailed(format!(
                "Reading {} bytes from device buffer of {} bytes",
                len, self.size
            ))
            .into());
        }
        device.read(self.checked_ptr()?, len)
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceAddress {{ ptr: {:#x}, size: {}, format: {}, dtype: {:?} }}",
            self.ptr.load(Ordering::SeqCst),
            self.size,
            self.format,
            self.dtype
        )
    }
}
