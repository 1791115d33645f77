use log::debug;
use std::collections::{BTreeMap, HashMap};

use crate::device::sim_device::DevicePtr;
use crate::error::RuntimeError;

/// Raw device memory provider beneath the dynamic pool.
pub trait DeviceMemPool: Send {
    fn alloc_device_mem(&mut self, size: usize) -> anyhow::Result<DevicePtr>;
    fn free_device_mem(&mut self, addr: DevicePtr) -> anyhow::Result<()>;
    fn align_memory_size(&self, size: usize) -> usize;
    /// Size of the block the pool above should request at once.
    fn mem_alloc_unit_size(&self) -> usize;
    fn free_mem_size(&self) -> usize;
    fn total_mem_size(&self) -> usize;
}

/// Whole device region handed out as one block.
/// Only one allocation may be outstanding at a time.
pub struct SingleBlockPool {
    base: DevicePtr,
    total_mem_size: usize,
    free_mem_size: usize,
    has_malloc: bool,
    align_size: usize,
    reserved_size: usize,
}

impl SingleBlockPool {
    pub fn new(base: DevicePtr, size: usize, align_size: usize, reserved_size: usize) -> Self {
        Self {
            base,
            total_mem_size: size,
            free_mem_size: size,
            has_malloc: false,
            align_size: align_size.max(1),
            reserved_size,
        }
    }
}

impl DeviceMemPool for SingleBlockPool {
    fn alloc_device_mem(&mut self, size: usize) -> anyhow::Result<DevicePtr> {
        if self.has_malloc {
            return Err(RuntimeError::out_of_memory("Memory pool already has an outstanding allocation"));
        }
        if size == 0 || size > self.free_mem_size {
            return Err(RuntimeError::out_of_memory(format!(
                "Failed to alloc {} bytes, free memory size {}",
                size, self.free_mem_size
            )));
        }
        self.free_mem_size -= size;
        self.has_malloc = true;
        Ok(self.base)
    }

    fn free_device_mem(&mut self, addr: DevicePtr) -> anyhow::Result<()> {
        if addr == 0 {
            return Err(RuntimeError::unexpected("Free of a null device address"));
        }
        self.has_malloc = false;
        self.free_mem_size = self.total_mem_size;
        Ok(())
    }

    fn align_memory_size(&self, size: usize) -> usize {
        if size == 0 {
            return self.align_size;
        }
        size.div_ceil(self.align_size) * self.align_size
    }

    fn mem_alloc_unit_size(&self) -> usize {
        self.free_mem_size.saturating_sub(self.reserved_size)
    }

    fn free_mem_size(&self) -> usize {
        self.free_mem_size
    }

    fn total_mem_size(&self) -> usize {
        self.total_mem_size
    }
}

/// Best-fit sub-allocator layered on a `DeviceMemPool`.
/// Grabs one unit block on first use and carves it into many live regions.
pub struct DynamicMemPool {
    device_pool: Box<dyn DeviceMemPool>,
    block: Option<(DevicePtr, usize)>,
    free_spans: BTreeMap<DevicePtr, usize>,
    used: HashMap<DevicePtr, usize>,
}

impl DynamicMemPool {
    pub fn new(device_pool: Box<dyn DeviceMemPool>) -> Self {
        Self {
            device_pool,
            block: None,
            free_spans: BTreeMap::new(),
            used: HashMap::new(),
        }
    }

    fn ensure_block(&mut self) -> anyhow::Result<()> {
        if self.block.is_some() {
            return Ok(());
        }
        let unit = self.device_pool.mem_alloc_unit_size();
        let base = self.device_pool.alloc_device_mem(unit)?;
        debug!("Memory pool reserved block {:#x} of {} bytes", base, unit);
        self.block = Some((base, unit));
        self.free_spans.insert(base, unit);
        Ok(())
    }

    pub fn alloc(&mut self, size: usize) -> anyhow::Result<DevicePtr> {
        self.ensure_block()?;
        let size = self.device_pool.align_memory_size(size);
        let (addr, span) = self
            .free_spans
            .iter()
            .filter(|&(_, &span)| span >= size)
            .min_by_key(|&(&addr, &span)| (span, addr))
            .map(|(&addr, &span)| (addr, span))
            .ok_or_else(|| {
                RuntimeError::out_of_memory(format!(
                    "Memory pool cannot serve {} bytes ({} bytes in use)",
                    size,
                    self.used_mem_size()
                ))
            })?;
        self.free_spans.remove(&addr);
        if span > size {
            self.free_spans.insert(addr + size, span - size);
        }
        self.used.insert(addr, size);
        Ok(addr)
    }

    pub fn free(&mut self, addr: DevicePtr) -> anyhow::Result<()> {
        let size = self
            .used
            .remove(&addr)
            .ok_or_else(|| RuntimeError::unexpected(format!("Free of unknown pool address {:#x}", addr)))?;
        let mut start = addr;
        let mut len = size;
        if let Some((&prev, &prev_len)) = self.free_spans.range(..addr).next_back() {
            if prev + prev_len == addr {
                self.free_spans.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free_spans.remove(&(addr + size)) {
            len += next_len;
        }
        self.free_spans.insert(start, len);
        Ok(())
    }

    /// Returns the block to the device pool. Every region must be freed.
    pub fn release(&mut self) -> anyhow::Result<()> {
        if !self.used.is_empty() {
            return Err(RuntimeError::unexpected(format!(
                "Releasing memory pool with {} live regions",
                self.used.len()
            )));
        }
        if let Some((base, _)) = self.block.take() {
            self.free_spans.clear();
            self.device_pool.free_device_mem(base)?;
        }
        Ok(())
    }

    pub fn used_mem_size(&self) -> usize {
        self.used.values().sum()
    }

    pub fn device_pool(&self) -> &dyn DeviceMemPool {
        self.device_pool.as_ref()
    }
}
