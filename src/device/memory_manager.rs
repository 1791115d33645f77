use log::{debug, info};
use petgraph::graph::NodeIndex;

use crate::config::RuntimeConfig;
use crate::device::address::DeviceAddress;
use crate::device::mem_reuse::{LifetimeReusePlanner, ReusePlanner};
use crate::device::memory_pool::{DeviceMemPool, DynamicMemPool};
use crate::device::sim_device::DevicePtr;
use crate::error::RuntimeError;
use crate::session::KernelGraph;

/// Where a buffer comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFlag {
    /// Lives as long as the graph
    Static,
    /// Lives for one run
    Dynamic,
    /// Slot inside the region laid out by the reuse planner
    ReuseDynamic,
}

/// Device memory of one graph region plus the pool behind the single-op path.
///
/// Static buffers grow down from the top of the region, dynamic ones grow up
/// from the bottom; the two meet in the middle or allocation fails.
pub struct MemoryManager {
    base: DevicePtr,
    size: usize,
    static_offset: usize,
    dynamic_offset: usize,
    total_static_size: usize,
    total_dynamic_size: usize,
    mem_align_size: usize,
    enable_hccl: bool,
    reuse_planner: Box<dyn ReusePlanner>,
    reuse_base: Option<DevicePtr>,
    mem_pool: DynamicMemPool,
}

impl MemoryManager {
    pub fn new(base: DevicePtr, size: usize, pool: Box<dyn DeviceMemPool>, config: &RuntimeConfig) -> Self {
        Self {
            base,
            size,
            static_offset: 0,
            dynamic_offset: 0,
            total_static_size: 0,
            total_dynamic_size: 0,
            mem_align_size: config.mem_align_size.max(1),
            enable_hccl: config.enable_hccl,
            reuse_planner: Box::new(LifetimeReusePlanner::default()),
            reuse_base: None,
            mem_pool: DynamicMemPool::new(pool),
        }
    }

    pub fn with_reuse_planner(mut self, planner: Box<dyn ReusePlanner>) -> Self {
        self.reuse_planner = planner;
        self
    }

    /// Rounds up to the common alignment. Zero still takes one unit.
    pub fn get_common_align_size(&self, size: usize) -> usize {
        size.max(1).div_ceil(self.mem_align_size) * self.mem_align_size
    }

    pub fn reset_dynamic_memory(&mut self) {
        self.dynamic_offset = 0;
        self.reuse_base = None;
    }

    fn check_fits(&self, align_size: usize, kind: &str) -> anyhow::Result<()> {
        let used = self.static_offset + self.dynamic_offset;
        if used + align_size > self.size {
            return Err(RuntimeError::out_of_memory(format!(
                "{} allocation of {} bytes exceeds device region: static {} + dynamic {} of {}",
                kind, align_size, self.static_offset, self.dynamic_offset, self.size
            )));
        }
        Ok(())
    }

    pub fn malloc_static_mem(&mut self, size: usize) -> anyhow::Result<DevicePtr> {
        let align_size = self.get_common_align_size(size);
        self.check_fits(align_size, "Static")?;
        self.static_offset += align_size;
        self.total_static_size += align_size;
        Ok(self.base + self.size - self.static_offset)
    }

    pub fn malloc_dynamic_mem(&mut self, size: usize) -> anyhow::Result<DevicePtr> {
        let align_size = self.get_common_align_size(size);
        self.check_fits(align_size, "Dynamic")?;
        let addr = self.base + self.dynamic_offset;
        self.dynamic_offset += align_size;
        self.total_dynamic_size = self.total_dynamic_size.max(self.dynamic_offset);
        Ok(addr)
    }

    /// Untyped allocation. Reused slots need a node, see `malloc_output_mem`.
    pub fn malloc_mem(&mut self, flag: MemFlag, size: usize) -> anyhow::Result<DevicePtr> {
        match flag {
            MemFlag::Static => self.malloc_static_mem(size),
            MemFlag::Dynamic => self.malloc_dynamic_mem(size),
            MemFlag::ReuseDynamic => Err(RuntimeError::unexpected(
                "Reused dynamic memory is only available per node output or workspace",
            )),
        }
    }

    /// Plans the reuse region of `graph` and reserves it in the dynamic area.
    pub fn malloc_reused_dynamic_mem(&mut self, graph: &KernelGraph) -> anyhow::Result<()> {
        let total = self.reuse_planner.plan(graph, self.mem_align_size)?;
        if total == 0 {
            self.reuse_base = None;
            return Ok(());
        }
        let base = self.malloc_dynamic_mem(total)?;
        info!("Graph {} reuse region: {} bytes at {:#x}", graph.graph_id(), total, base);
        self.reuse_base = Some(base);
        Ok(())
    }

    fn reused_slot(&self, offset: Option<usize>) -> anyhow::Result<Option<DevicePtr>> {
        match offset {
            None => Ok(None),
            Some(off) => {
                let base = self
                    .reuse_base
                    .ok_or_else(|| RuntimeError::unexpected("Reuse region has not been reserved"))?;
                Ok(Some(base + off))
            }
        }
    }

    /// Buffer for output `index` of `node`. `None` means the reuse planner
    /// gave this output no slot of its own.
    pub fn malloc_output_mem(
        &mut self,
        graph: &KernelGraph,
        node: NodeIndex,
        index: usize,
        flag: MemFlag,
        size: usize,
    ) -> anyhow::Result<Option<DevicePtr>> {
        if graph.is_communication_op(node) {
            let size = if self.enable_hccl { self.get_common_align_size(size) } else { size };
            let ptr = match flag {
                MemFlag::Static => self.malloc_static_mem(size)?,
                _ => self.malloc_dynamic_mem(size)?,
            };
            return Ok(Some(ptr));
        }
        match flag {
            MemFlag::ReuseDynamic => self.reused_slot(self.reuse_planner.output_offset(node, index)),
            _ => self.malloc_mem(flag, size).map(Some),
        }
    }

    pub fn malloc_workspace_mem(
        &mut self,
        node: NodeIndex,
        index: usize,
        flag: MemFlag,
        size: usize,
    ) -> anyhow::Result<Option<DevicePtr>> {
        match flag {
            MemFlag::ReuseDynamic => self.reused_slot(self.reuse_planner.workspace_offset(node, index)),
            _ => self.malloc_mem(flag, size).map(Some),
        }
    }

    /// Binds `address` to a fresh pool buffer of `size` bytes.
    pub fn malloc_mem_from_mem_pool(&mut self, address: &DeviceAddress, size: usize) -> anyhow::Result<()> {
        let ptr = self.mem_pool.alloc(size)?;
        debug!("Pool buffer {:#x} of {} bytes", ptr, size);
        address.set_ptr(ptr);
        Ok(())
    }

    pub fn free_mem_from_mem_pool(&mut self, address: &DeviceAddress) -> anyhow::Result<()> {
        match address.ptr() {
            Some(ptr) => self.mem_pool.free(ptr),
            None => Err(RuntimeError::unexpected("Free of an unbound device address")),
        }
    }

    /// True for pointers served by the pool rather than the graph region.
    pub fn is_pool_address(&self, ptr: DevicePtr) -> bool {
        ptr >= self.base + self.size
    }

    pub fn mem_pool(&self) -> &DynamicMemPool {
        &self.mem_pool
    }

    pub fn static_mem_size(&self) -> usize {
        self.total_static_size
    }

    pub fn dynamic_mem_size(&self) -> usize {
        self.total_dynamic_size
    }

    pub fn base(&self) -> DevicePtr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory_pool::SingleBlockPool;

    const BASE: DevicePtr = 0x1_0000;

    fn manager(size: usize) -> MemoryManager {
        let config = RuntimeConfig::default();
        let pool = SingleBlockPool::new(BASE + size, 8192, config.pool_align_size, config.pool_reserved_size);
        MemoryManager::new(BASE, size, Box::new(pool), &config)
    }

    #[test]
    fn static_and_dynamic_grow_towards_each_other() {
        let mut mm = manager(1024);
        assert_eq!(mm.malloc_static_mem(100).unwrap(), BASE + 1024 - 128);
        assert_eq!(mm.malloc_dynamic_mem(64).unwrap(), BASE);
        assert_eq!(mm.malloc_dynamic_mem(1).unwrap(), BASE + 64);
        assert_eq!(mm.static_mem_size(), 128);
        assert_eq!(mm.dynamic_mem_size(), 96);

        let err = mm.malloc_static_mem(1024).unwrap_err();
        assert!(matches!(err.downcast_ref::<RuntimeError>(), Some(RuntimeError::OutOfMemory(_))));

        mm.reset_dynamic_memory();
        assert_eq!(mm.malloc_dynamic_mem(32).unwrap(), BASE);
        assert_eq!(mm.dynamic_mem_size(), 96);
    }

    #[test]
    fn common_align_rounds_up() {
        let mm = manager(1024);
        assert_eq!(mm.get_common_align_size(0), 32);
        assert_eq!(mm.get_common_align_size(32), 32);
        assert_eq!(mm.get_common_align_size(33), 64);
    }

    #[test]
    fn reuse_flag_needs_a_node() {
        let mut mm = manager(1024);
        assert!(mm.malloc_mem(MemFlag::ReuseDynamic, 16).is_err());
    }

    #[test]
    fn pool_buffers_bind_addresses() {
        let mut mm = manager(1024);
        let a = DeviceAddress::new(None, 100, Default::default(), Default::default());
        let b = DeviceAddress::new(None, 100, Default::default(), Default::default());
        mm.malloc_mem_from_mem_pool(&a, 100).unwrap();
        mm.malloc_mem_from_mem_pool(&b, 100).unwrap();
        assert_eq!(a.ptr(), Some(BASE + 1024));
        assert_eq!(b.ptr(), Some(BASE + 1024 + 512));
        mm.free_mem_from_mem_pool(&a).unwrap();
        assert_eq!(mm.mem_pool().used_mem_size(), 512);
    }
}
