use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::RuntimeError;

/// Raw device address. Zero is the null pointer.
pub type DevicePtr = usize;

const DEVICE_BASE: DevicePtr = 0x1_0000;

/// Host-backed stand-in for a device memory region.
pub struct SimDevice {
    base: DevicePtr,
    memory: Mutex<Vec<u8>>,
}

impl SimDevice {
    pub fn new(size: usize) -> Self {
        Self {
            base: DEVICE_BASE,
            memory: Mutex::new(vec![0; size]),
        }
    }

    pub fn base(&self) -> DevicePtr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.memory.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn range(&self, addr: DevicePtr, len: usize, size: usize) -> anyhow::Result<Range<usize>> {
        let start = addr
            .checked_sub(self.base)
            .ok_or_else(|| RuntimeError::SyncFailed(format!("Address {:#x} below device base", addr)))?;
        let end = start + len;
        if end > size {
            return Err(RuntimeError::SyncFailed(format!(
                "Access [{:#x}, {:#x}) beyond device end {:#x}",
                addr,
                addr + len,
                self.base + size
            ))
            .into());
        }
        Ok(start..end)
    }

    pub fn write(&self, addr: DevicePtr, data: &[u8]) -> anyhow::Result<()> {
        let mut memory = self
            .memory
            .lock()
            .map_err(|_| RuntimeError::SyncFailed("Device memory poisoned".into()))?;
        let range = self.range(addr, data.len(), memory.len())?;
        memory[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, addr: DevicePtr, len: usize) -> anyhow::Result<Vec<u8>> {
        let memory = self
            .memory
            .lock()
            .map_err(|_| RuntimeError::SyncFailed("Device memory poisoned".into()))?;
        let range = self.range(addr, len, memory.len())?;
        Ok(memory[range].to_vec())
    }

    pub fn fill(&self, addr: DevicePtr, len: usize, value: u8) -> anyhow::Result<()> {
        let mut memory = self
            .memory
            .lock()
            .map_err(|_| RuntimeError::SyncFailed("Device memory poisoned".into()))?;
        let range = self.range(addr, len, memory.len())?;
        memory[range].fill(value);
        Ok(())
    }

    pub fn read_f32(&self, addr: DevicePtr, len: usize) -> anyhow::Result<Vec<f32>> {
        Ok(bytemuck::pod_collect_to_vec(&self.read(addr, len)?))
    }

    pub fn write_f32(&self, addr: DevicePtr, values: &[f32]) -> anyhow::Result<()> {
        self.write(addr, bytemuck::cast_slice(values))
    }
}

/// Execution queue of a device. Kernels run when issued; the counters
/// only track what was issued and synchronized.
pub struct Stream {
    id: u32,
    device: Arc<SimDevice>,
    issued: AtomicUsize,
    synced: AtomicUsize,
}

impl Stream {
    pub fn new(id: u32, device: Arc<SimDevice>) -> Self {
        Self {
            id,
            device,
            issued: AtomicUsize::new(0),
            synced: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn device(&self) -> &SimDevice {
        &self.device
    }

    pub fn record_launch(&self) {
        self.issued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn sync_stream(&self) -> anyhow::Result<()> {
        self.synced.store(self.issued.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    pub fn launched(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn synced(&self) -> usize {
        self.synced.load(Ordering::SeqCst)
    }
}
