use log::{debug, error, info};
use petgraph::graph::NodeIndex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::config::RuntimeConfig;
use crate::core::{DataType, Format, Shape, Tensor};
use crate::device::address::{DeviceAddress, DeviceAddressPtr};
use crate::device::mem_reuse::ReusePlanner;
use crate::device::memory_manager::{MemFlag, MemoryManager};
use crate::device::memory_pool::SingleBlockPool;
use crate::device::sim_device::{SimDevice, Stream};
use crate::error::RuntimeError;
use crate::kernel::Address;
use crate::session::kernel_graph::{
    ATOMIC_ADDR_CLEAN_OP, ATTR_ATOMIC_OUTPUT_INDEXS, ATTR_ATOMIC_WORKSPACE_SIZE, GET_NEXT_OP, KernelNode,
};
use crate::session::{AnfNode, ConstValue, KernelGraph};

/// Host tensor handed to the single-op path, optionally already on device.
pub struct InputTensor {
    pub tensor: Tensor,
    pub device_address: Option<DeviceAddressPtr>,
}

impl InputTensor {
    pub fn host(tensor: Tensor) -> Self {
        Self { tensor, device_address: None }
    }
}

/// Ordered launch arguments of one kernel.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    pub inputs: Vec<Address>,
    pub workspaces: Vec<Address>,
    pub outputs: Vec<Address>,
}

fn launch_address(addr: Option<DeviceAddressPtr>, what: impl Fn() -> String) -> anyhow::Result<Address> {
    let addr = addr.ok_or_else(|| RuntimeError::malformed(format!("{} has no device address", what())))?;
    match addr.ptr() {
        Some(ptr) => Ok(Address { addr: ptr, size: addr.size() }),
        None => Err(RuntimeError::malformed(format!("{} is bound to a null device address", what()))),
    }
}

/// Binds device memory to kernel graphs and launches them on one stream.
pub struct KernelRuntime {
    config: RuntimeConfig,
    device: Arc<SimDevice>,
    stream: Stream,
    mem_manager: MemoryManager,
}

impl KernelRuntime {
    /// Device holds the graph region followed by the pool region.
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let device = Arc::new(SimDevice::new(config.device_mem_size + config.mem_pool_size));
        let base = device.base();
        let pool = SingleBlockPool::new(
            base + config.device_mem_size,
            config.mem_pool_size,
            config.pool_align_size,
            config.pool_reserved_size,
        );
        let mem_manager = MemoryManager::new(base, config.device_mem_size, Box::new(pool), &config);
        let stream = Stream::new(0, device.clone());
        info!(
            "Kernel runtime: graph region {} bytes at {:#x}, pool {} bytes, mem reuse {}",
            config.device_mem_size, base, config.mem_pool_size, config.enable_mem_reuse
        );
        Ok(Self { config, device, stream, mem_manager })
    }

    pub fn with_reuse_planner(mut self, planner: Box<dyn ReusePlanner>) -> Self {
        self.mem_manager = self.mem_manager.with_reuse_planner(planner);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn device(&self) -> &SimDevice {
        &self.device
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn mem_manager(&self) -> &MemoryManager {
        &self.mem_manager
    }

    /// Full pipeline: static pass, dynamic pass, then ref reconciliation.
    pub fn assign_memory(&mut self, graph: &mut KernelGraph) -> anyhow::Result<()> {
        self.mem_manager.reset_dynamic_memory();
        self.assign_static_memory(graph)?;
        self.assign_dynamic_memory(graph)?;
        self.update_ref_node_output_mem(graph)?;
        info!(
            "Graph {} memory assigned: static {} bytes, dynamic {} bytes",
            graph.graph_id(),
            self.mem_manager.static_mem_size(),
            self.mem_manager.dynamic_mem_size()
        );
        Ok(())
    }

    pub fn assign_static_memory(&mut self, graph: &mut KernelGraph) -> anyhow::Result<()> {
        self.assign_static_memory_input(graph)?;
        self.assign_static_memory_value_node(graph, false)?;
        self.assign_static_memory_output(graph)
    }

    /// Inputs keep any address the caller already bound.
    pub fn assign_static_memory_input(&mut self, graph: &mut KernelGraph) -> anyhow::Result<()> {
        for node in graph.inputs().to_vec() {
            let (format, dtype) = match graph.node(node)? {
                AnfNode::Parameter(p) if p.valid => (p.format, p.dtype),
                _ => continue,
            };
            if graph.output_addr_exist(node, 0) {
                continue;
            }
            let size = self.count_node_device_memory_size(graph, node, 0)?;
            let ptr = self.mem_manager.malloc_mem(MemFlag::Static, size)?;
            graph.set_output_addr(node, 0, DeviceAddress::new(Some(ptr), size, format, dtype));
        }
        Ok(())
    }

    /// Binds constants and copies their host bytes to the device right away.
    /// `use_pool` serves them from the pool instead of the static area.
    pub fn assign_static_memory_value_node(&mut self, graph: &mut KernelGraph, use_pool: bool) -> anyhow::Result<()> {
        for node in graph.value_nodes().to_vec() {
            if graph.output_addr_exist(node, 0) {
                debug!("Value node '{}' address already exists", graph.node_name(node));
                continue;
            }
            let (bytes, dtype) = match graph.node(node)? {
                AnfNode::Value(v) => match &v.value {
                    ConstValue::Tensor(t) => (t.as_bytes().to_vec(), t.dtype()),
                    ConstValue::Str(s) => (s.as_bytes().to_vec(), DataType::U8),
                },
                _ => continue,
            };
            let size = bytes.len();
            let address = if use_pool {
                let address = DeviceAddress::new(None, size, Format::Default, dtype);
                self.mem_manager.malloc_mem_from_mem_pool(&address, size)?;
                address
            } else {
                let ptr = self.mem_manager.malloc_mem(MemFlag::Static, size)?;
                DeviceAddress::new(Some(ptr), size, Format::Default, dtype)
            };
            graph.set_output_addr(node, 0, address.clone());
            address.sync_host_to_device(&self.device, &bytes).map_err(|e| {
                anyhow::Error::new(RuntimeError::SyncFailed(format!(
                    "Value node '{}' host to device copy failed: {:#}",
                    graph.node_name(node),
                    e
                )))
            })?;
        }
        Ok(())
    }

    /// Static buffers for graph outputs produced by compute kernels.
    /// Communication outputs are left to the dynamic pass.
    pub fn assign_static_memory_output(&mut self, graph: &mut KernelGraph) -> anyhow::Result<()> {
        let outputs: Vec<(NodeIndex, usize)> = graph
            .outputs()
            .iter()
            .copied()
            .filter(|&(node, _)| graph.is_kernel(node) && !graph.is_communication_op(node))
            .collect();
        for (node, index) in outputs {
            self.assign_node_output_mem(MemFlag::Static, graph, node, Some(index))?;
        }
        Ok(())
    }

    pub fn assign_dynamic_memory(&mut self, graph: &mut KernelGraph) -> anyhow::Result<()> {
        let mut flag = MemFlag::Dynamic;
        if self.config.enable_mem_reuse {
            self.mem_manager.malloc_reused_dynamic_mem(graph)?;
            flag = MemFlag::ReuseDynamic;
        }
        let order = graph.execution_order().to_vec();
        let (communication, compute): (Vec<NodeIndex>, Vec<NodeIndex>) =
            order.into_iter().partition(|&n| graph.is_communication_op(n));
        for node in communication {
            self.assign_communication_node_mem(flag, graph, node)?;
        }
        for node in compute {
            self.assign_node_output_mem(flag, graph, node, None)?;
            self.assign_work_space_mem(flag, graph, node)?;
        }
        Ok(())
    }

    pub fn assign_communication_node_mem(&mut self, flag: MemFlag, graph: &mut KernelGraph, node: NodeIndex) -> anyhow::Result<()> {
        self.assign_communication_node_input_mem(graph, node)?;
        self.assign_communication_node_output_mem(flag, graph, node)
    }

    /// Packs every producer output feeding `node` into one contiguous block.
    pub fn assign_communication_node_input_mem(&mut self, graph: &mut KernelGraph, node: NodeIndex) -> anyhow::Result<()> {
        let mut total_size = 0;
        let mut addr_size: Vec<(DeviceAddressPtr, usize)> = Vec::new();
        for i in 0..graph.input_tensor_num(node) {
            let (producer, index) = graph.prev_node_output(node, i)?;
            if !graph.is_kernel(producer) {
                return Err(RuntimeError::malformed(format!(
                    "Communication node '{}' input {} comes from '{}', only kernel outputs are supported",
                    graph.node_name(node),
                    i,
                    graph.node_name(producer)
                )));
            }
            let address = match graph.output_addr(producer, index) {
                Some(address) => address,
                None => self.pre_assign_kernel_memory(graph, producer, index)?,
            };
            let mem_size = self.mem_manager.get_common_align_size(address.size());
            total_size += mem_size;
            addr_size.push((address, mem_size));
        }
        if addr_size.is_empty() {
            return Ok(());
        }
        let mut input_ptr = self
            .mem_manager
            .malloc_output_mem(graph, node, 0, MemFlag::Dynamic, total_size)?
            .ok_or_else(|| RuntimeError::out_of_memory("Communication input block was not allocated"))?;
        debug!(
            "Communication node '{}' inputs packed into {} bytes at {:#x}",
            graph.node_name(node),
            total_size,
            input_ptr
        );
        for (address, mem_size) in addr_size {
            address.set_ptr(input_ptr);
            input_ptr += mem_size;
        }
        Ok(())
    }

    fn pre_assign_kernel_memory(&mut self, graph: &mut KernelGraph, node: NodeIndex, index: usize) -> anyhow::Result<DeviceAddressPtr> {
        let size = graph
            .kernel(node)?
            .kernel_mod
            .output_size_list()
            .get(index)
            .copied()
            .ok_or_else(|| {
                RuntimeError::malformed(format!("'{}' has no output {}", graph.node_name(node), index))
            })?;
        let address = DeviceAddress::new(None, size, graph.output_format(node, index), graph.output_dtype(node, index));
        graph.set_output_addr(node, index, address.clone());
        Ok(address)
    }

    pub fn assign_communication_node_output_mem(&mut self, flag: MemFlag, graph: &mut KernelGraph, node: NodeIndex) -> anyhow::Result<()> {
        let output_sizes = graph.kernel(node)?.kernel_mod.output_size_list().to_vec();
        let pending: Vec<(usize, usize, usize)> = output_sizes
            .iter()
            .enumerate()
            .filter(|&(i, _)| !graph.output_addr_exist(node, i))
            .map(|(i, &size)| {
                let align = if self.config.enable_hccl { self.mem_manager.get_common_align_size(size) } else { size };
                (i, size, align)
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        let total_size: usize = pending.iter().map(|&(_, _, align)| align).sum();
        let mut output_ptr = self
            .mem_manager
            .malloc_output_mem(graph, node, 0, flag, total_size)?
            .ok_or_else(|| RuntimeError::out_of_memory("Communication output block was not allocated"))?;
        for (i, size, align) in pending {
            let address = DeviceAddress::new(Some(output_ptr), size, graph.output_format(node, i), graph.output_dtype(node, i));
            graph.set_output_addr(node, i, address);
            output_ptr += align;
        }
        Ok(())
    }

    /// Binds outputs of `node`, all of them or only `index`.
    /// Returns how many addresses were created.
    pub fn assign_node_output_mem(
        &mut self,
        flag: MemFlag,
        graph: &mut KernelGraph,
        node: NodeIndex,
        index: Option<usize>,
    ) -> anyhow::Result<usize> {
        let kernel = graph.kernel(node)?;
        let flag = if flag == MemFlag::ReuseDynamic && kernel.op_type == GET_NEXT_OP {
            debug!("GetNext '{}' disables memory reuse", kernel.name);
            MemFlag::Dynamic
        } else {
            flag
        };
        let output_sizes = kernel.kernel_mod.output_size_list().to_vec();
        let mut created = 0;
        for (i, size) in output_sizes.into_iter().enumerate() {
            if index.is_some_and(|idx| idx != i) {
                continue;
            }
            if graph.output_addr_exist(node, i) {
                debug!("'{}' output {} already bound", graph.node_name(node), i);
                continue;
            }
            let Some(ptr) = self.mem_manager.malloc_output_mem(graph, node, i, flag, size)? else {
                continue;
            };
            let address = DeviceAddress::new(Some(ptr), size, graph.output_format(node, i), graph.output_dtype(node, i));
            graph.set_output_addr(node, i, address);
            created += 1;
        }
        Ok(created)
    }

    pub fn assign_work_space_mem(&mut self, flag: MemFlag, graph: &mut KernelGraph, node: NodeIndex) -> anyhow::Result<()> {
        let sizes = graph.kernel(node)?.kernel_mod.workspace_size_list().to_vec();
        for (i, size) in sizes.into_iter().enumerate() {
            if graph.workspace_addr(node, i).is_some() {
                continue;
            }
            if let Some(ptr) = self.mem_manager.malloc_workspace_mem(node, i, flag, size)? {
                graph.set_workspace_addr(node, i, DeviceAddress::new(Some(ptr), size, Format::Default, DataType::Unknown));
            }
        }
        Ok(())
    }

    /// Makes every ref output share the address object of the input it aliases.
    pub fn update_ref_node_output_mem(&mut self, graph: &mut KernelGraph) -> anyhow::Result<()> {
        for node in graph.execution_order().to_vec() {
            for i in 0..graph.output_tensor_num(node)? {
                let Some((origin, origin_index)) = graph.get_ref_correspond_output((node, i)) else {
                    continue;
                };
                let origin_addr = graph.output_addr(origin, origin_index).ok_or_else(|| {
                    RuntimeError::malformed(format!(
                        "Ref origin output {} of '{}' has no device address",
                        origin_index,
                        graph.node_name(origin)
                    ))
                })?;
                let same = graph
                    .output_addr(node, i)
                    .is_some_and(|cur| Arc::ptr_eq(&cur, &origin_addr));
                if !same {
                    info!(
                        "Ref output {} of '{}' now aliases output {} of '{}'",
                        i,
                        graph.node_name(node),
                        origin_index,
                        graph.node_name(origin)
                    );
                    graph.set_output_addr(node, i, origin_addr);
                }
            }
        }
        Ok(())
    }

    /// Single-op path: everything comes from the pool, no communication packing.
    pub fn run_op_assign_memory(&mut self, inputs: &[InputTensor], graph: &mut KernelGraph) -> anyhow::Result<()> {
        if inputs.len() != graph.inputs().len() {
            return Err(RuntimeError::malformed(format!(
                "Got {} input tensors for {} graph inputs",
                inputs.len(),
                graph.inputs().len()
            )));
        }
        for (node, input) in graph.inputs().to_vec().into_iter().zip(inputs) {
            if let Some(address) = &input.device_address {
                graph.set_output_addr(node, 0, address.clone());
                continue;
            }
            let size = self.count_node_device_memory_size(graph, node, 0)?;
            let address = DeviceAddress::new(None, size, graph.output_format(node, 0), graph.output_dtype(node, 0));
            self.mem_manager.malloc_mem_from_mem_pool(&address, size)?;
            address.sync_host_to_device(&self.device, input.tensor.as_bytes())?;
            graph.set_output_addr(node, 0, address);
        }
        self.assign_static_memory_value_node(graph, true)?;
        for node in graph.execution_order().to_vec() {
            self.run_op_assign_output_memory(graph, node)?;
            self.run_op_assign_work_space_memory(graph, node)?;
        }
        self.update_ref_node_output_mem(graph)
    }

    fn run_op_assign_output_memory(&mut self, graph: &mut KernelGraph, node: NodeIndex) -> anyhow::Result<()> {
        let sizes = graph.kernel(node)?.kernel_mod.output_size_list().to_vec();
        for (i, size) in sizes.into_iter().enumerate() {
            // ref outputs get the origin address afterwards
            if graph.output_addr_exist(node, i) || graph.is_in_ref_output_map((node, i)) {
                continue;
            }
            let address = DeviceAddress::new(None, size, graph.output_format(node, i), graph.output_dtype(node, i));
            self.mem_manager.malloc_mem_from_mem_pool(&address, size)?;
            graph.set_output_addr(node, i, address);
        }
        Ok(())
    }

    fn run_op_assign_work_space_memory(&mut self, graph: &mut KernelGraph, node: NodeIndex) -> anyhow::Result<()> {
        let sizes = graph.kernel(node)?.kernel_mod.workspace_size_list().to_vec();
        for (i, size) in sizes.into_iter().enumerate() {
            if graph.workspace_addr(node, i).is_some() {
                continue;
            }
            let address = DeviceAddress::new(None, size, Format::Default, DataType::Unknown);
            self.mem_manager.malloc_mem_from_mem_pool(&address, size)?;
            graph.set_workspace_addr(node, i, address);
        }
        Ok(())
    }

    pub fn gen_launch_args(&self, graph: &KernelGraph, node: NodeIndex) -> anyhow::Result<LaunchArgs> {
        let kernel = graph.kernel(node)?;
        if kernel.op_type == ATOMIC_ADDR_CLEAN_OP {
            return self.gen_addr_clean_launch_args(graph, kernel);
        }
        let mut args = LaunchArgs::default();
        for i in 0..graph.input_tensor_num(node) {
            let real_input = graph.real_input_index(node, i)?;
            let (prev, prev_index) = graph.prev_node_output(node, real_input)?;
            args.inputs.push(launch_address(graph.output_addr(prev, prev_index), || {
                format!("Input {} of '{}'", real_input, kernel.name)
            })?);
        }
        for i in 0..kernel.kernel_mod.output_size_list().len() {
            args.outputs.push(launch_address(graph.output_addr(node, i), || {
                format!("Output {} of '{}'", i, kernel.name)
            })?);
        }
        for i in 0..kernel.kernel_mod.workspace_size_list().len() {
            args.workspaces.push(launch_address(graph.workspace_addr(node, i), || {
                format!("Workspace {} of '{}'", i, kernel.name)
            })?);
        }
        Ok(args)
    }

    /// The clean kernel's inputs are the dirty buffers of its target.
    fn gen_addr_clean_launch_args(&self, graph: &KernelGraph, kernel: &KernelNode) -> anyhow::Result<LaunchArgs> {
        let target = kernel.clean_target.ok_or_else(|| {
            RuntimeError::malformed(format!("Atomic clean '{}' has no target node", kernel.name))
        })?;
        let target_kernel = graph.kernel(target)?;
        let mut args = LaunchArgs::default();
        if target_kernel.attrs.has(ATTR_ATOMIC_OUTPUT_INDEXS) {
            let indexs = target_kernel.attrs.get_int_list(ATTR_ATOMIC_OUTPUT_INDEXS)?;
            for index in indexs {
                let index = usize::try_from(index)
                    .map_err(|_| RuntimeError::malformed(format!("Negative clean index {} on '{}'", index, target_kernel.name)))?;
                args.inputs.push(launch_address(graph.output_addr(target, index), || {
                    format!("Clean output {} of '{}'", index, target_kernel.name)
                })?);
            }
        }
        if target_kernel.attrs.has(ATTR_ATOMIC_WORKSPACE_SIZE)
            && target_kernel.attrs.get_int(ATTR_ATOMIC_WORKSPACE_SIZE)? != 0
        {
            args.inputs.push(launch_address(graph.workspace_addr(target, 0), || {
                format!("Clean workspace of '{}'", target_kernel.name)
            })?);
        }
        debug!("Atomic clean '{}' zeroes {} buffers of '{}'", kernel.name, args.inputs.len(), target_kernel.name);
        Ok(args)
    }

    /// Launches every kernel in execution order, stopping at the first failure.
    pub fn launch_kernel_mod(&self, graph: &KernelGraph) -> anyhow::Result<()> {
        for &node in graph.execution_order() {
            let kernel = graph.kernel(node)?;
            let args = self.gen_launch_args(graph, node)?;
            kernel
                .kernel_mod
                .launch(&args.inputs, &args.workspaces, &args.outputs, &self.stream)
                .map_err(|e| {
                    error!("Launch of kernel '{}' failed: {:#}", kernel.name, e);
                    anyhow::Error::new(RuntimeError::LaunchFailed(format!("{}: {:#}", kernel.name, e)))
                })?;
        }
        Ok(())
    }

    pub fn launch_kernel(&self, graph: &KernelGraph) -> anyhow::Result<()> {
        self.launch_kernel_mod(graph)?;
        self.stream.sync_stream()
    }

    pub fn run(&self, graph: &KernelGraph) -> anyhow::Result<()> {
        let start = Instant::now();
        self.launch_kernel(graph)?;
        info!(
            "Graph {} ran {} kernels in {:?}",
            graph.graph_id(),
            graph.execution_order().len(),
            start.elapsed()
        );
        Ok(())
    }

    /// Copies host tensors into the bound addresses of the valid graph inputs.
    pub fn load_input_data(&self, graph: &KernelGraph, tensors: &[Tensor]) -> anyhow::Result<()> {
        if tensors.len() != graph.inputs().len() {
            return Err(RuntimeError::malformed(format!(
                "Got {} input tensors for {} graph inputs",
                tensors.len(),
                graph.inputs().len()
            )));
        }
        for (&node, tensor) in graph.inputs().iter().zip(tensors) {
            let Some(address) = graph.output_addr(node, 0) else {
                continue;
            };
            address.sync_host_to_device(&self.device, tensor.as_bytes())?;
        }
        Ok(())
    }

    pub fn read_output(&self, graph: &KernelGraph, node: NodeIndex, index: usize) -> anyhow::Result<Tensor> {
        let address = graph.output_addr(node, index).ok_or_else(|| {
            RuntimeError::malformed(format!("Output {} of '{}' is not bound", index, graph.node_name(node)))
        })?;
        let dtype = address.dtype();
        let elements = address.size() / dtype.size_in_bytes();
        let bytes = address.sync_device_to_host(&self.device, elements * dtype.size_in_bytes())?;
        Tensor::from_bytes(dtype, Shape::new(vec![elements]), bytes)
    }

    /// Byte size of output `index`: element count times type size.
    pub fn count_node_device_memory_size(&self, graph: &KernelGraph, node: NodeIndex, index: usize) -> anyhow::Result<usize> {
        let outputs = graph.output_tensor_num(node)?;
        if index >= outputs {
            return Err(RuntimeError::malformed(format!(
                "Output index {} exceeds the {} outputs of '{}'",
                index,
                outputs,
                graph.node_name(node)
            )));
        }
        graph.count_node_device_memory_size(node, index)
    }

    /// Drops every address bound on `graph`, returning pool buffers.
    pub fn clear_graph_runtime_resource(&mut self, graph: &mut KernelGraph) -> anyhow::Result<()> {
        info!("Clear graph {} runtime resource", graph.graph_id());
        let mut released = HashSet::new();
        for address in graph.all_addresses() {
            let Some(ptr) = address.ptr() else { continue };
            if self.mem_manager.is_pool_address(ptr) && released.insert(ptr) {
                self.mem_manager.free_mem_from_mem_pool(&address)?;
            }
        }
        graph.clear_addresses();
        Ok(())
    }
}
