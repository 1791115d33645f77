use log::debug;
use petgraph::graph::NodeIndex;
use std::collections::HashMap;

use crate::session::kernel_graph::{ATTR_ATOMIC_OUTPUT_INDEXS, ATTR_ATOMIC_WORKSPACE_SIZE, GET_NEXT_OP, KernelNode};
use crate::session::KernelGraph;

/// Lays out the dynamic buffers of a graph inside one shared region.
pub trait ReusePlanner: Send {
    /// Plans `graph` and returns the size of the region it needs.
    fn plan(&mut self, graph: &KernelGraph, align_size: usize) -> anyhow::Result<usize>;
    fn output_offset(&self, node: NodeIndex, index: usize) -> Option<usize>;
    fn workspace_offset(&self, node: NodeIndex, index: usize) -> Option<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Output(NodeIndex, usize),
    Workspace(NodeIndex, usize),
}

struct Lifetime {
    slot: Slot,
    size: usize,
    start: usize,
    end: usize,
}

/// First-fit packing of buffer lifetimes over the execution order.
///
/// Ref outputs alias their input and get no slot, communication nodes and
/// the producers feeding them are bound separately and are skipped too.
#[derive(Default)]
pub struct LifetimeReusePlanner {
    offsets: HashMap<Slot, usize>,
}

/// Buffers of `kernel` zeroed by its atomic clean: output indexes and
/// whether workspace 0 is included.
fn atomic_clean_buffers(kernel: &KernelNode) -> anyhow::Result<(Vec<usize>, bool)> {
    let outputs = if kernel.attrs.has(ATTR_ATOMIC_OUTPUT_INDEXS) {
        kernel
            .attrs
            .get_int_list(ATTR_ATOMIC_OUTPUT_INDEXS)?
            .into_iter()
            .filter_map(|i| usize::try_from(i).ok())
            .collect()
    } else {
        Vec::new()
    };
    let workspace =
        kernel.attrs.has(ATTR_ATOMIC_WORKSPACE_SIZE) && kernel.attrs.get_int(ATTR_ATOMIC_WORKSPACE_SIZE)? != 0;
    Ok((outputs, workspace))
}

impl LifetimeReusePlanner {
    fn collect_lifetimes(graph: &KernelGraph, align_size: usize) -> anyhow::Result<Vec<Lifetime>> {
        let order = graph.execution_order();
        let step: HashMap<NodeIndex, usize> = order.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let align = |size: usize| size.max(1).div_ceil(align_size) * align_size;
        let last = order.len();

        // a clean kernel writes its target's buffers at its own step
        let mut clean_steps: HashMap<NodeIndex, usize> = HashMap::new();
        for (i, &node) in order.iter().enumerate() {
            if let Some(target) = graph.kernel(node)?.clean_target {
                clean_steps.entry(target).or_insert(i);
            }
        }

        let mut lifetimes = Vec::new();
        for (i, &node) in order.iter().enumerate() {
            if graph.is_communication_op(node) {
                continue;
            }
            let kernel = graph.kernel(node)?;
            // GetNext keeps plain dynamic outputs
            let plan_outputs = kernel.op_type != GET_NEXT_OP;
            let (clean_outputs, clean_workspace) = match clean_steps.get(&node) {
                Some(_) => atomic_clean_buffers(kernel)?,
                None => (Vec::new(), false),
            };
            let clean_start = |dirty: bool| match clean_steps.get(&node) {
                Some(&clean) if dirty => clean.min(i),
                _ => i,
            };
            for (index, &size) in kernel.kernel_mod.output_size_list().iter().enumerate() {
                if !plan_outputs || graph.output_addr_exist(node, index) || graph.is_in_ref_output_map((node, index)) {
                    continue;
                }
                let consumers = graph.consumers(node, index);
                if consumers.iter().any(|&c| graph.is_communication_op(c)) {
                    continue;
                }
                let end = if graph.is_graph_output(node, index) || graph.is_ref_origin((node, index)) {
                    last
                } else {
                    consumers.iter().filter_map(|c| step.get(c)).copied().fold(i, usize::max)
                };
                let start = clean_start(clean_outputs.contains(&index));
                lifetimes.push(Lifetime { slot: Slot::Output(node, index), size: align(size), start, end });
            }
            for (index, &size) in kernel.kernel_mod.workspace_size_list().iter().enumerate() {
                let start = clean_start(clean_workspace && index == 0);
                lifetimes.push(Lifetime { slot: Slot::Workspace(node, index), size: align(size), start, end: i });
            }
        }
        lifetimes.sort_by_key(|l| l.start);
        Ok(lifetimes)
    }
}

impl ReusePlanner for LifetimeReusePlanner {
    fn plan(&mut self, graph: &KernelGraph, align_size: usize) -> anyhow::Result<usize> {
        self.offsets.clear();
        let align_size = align_size.max(1);
        let lifetimes = Self::collect_lifetimes(graph, align_size)?;

        // (offset, size, end) of buffers still alive, kept sorted by offset
        let mut live: Vec<(usize, usize, usize)> = Vec::new();
        let mut total = 0;
        for item in &lifetimes {
            live.retain(|&(_, _, end)| end >= item.start);
            let mut offset = 0;
            for &(o, s, _) in live.iter() {
                if o >= offset + item.size {
                    break;
                }
                offset = offset.max(o + s);
            }
            let pos = live.partition_point(|&(o, _, _)| o < offset);
            live.insert(pos, (offset, item.size, item.end));
            self.offsets.insert(item.slot, offset);
            total = total.max(offset + item.size);
        }
        debug!(
            "Reuse plan of graph {}: {} buffers in {} bytes",
            graph.graph_id(),
            lifetimes.len(),
            total
        );
        Ok(total)
    }

    fn output_offset(&self, node: NodeIndex, index: usize) -> Option<usize> {
        self.offsets.get(&Slot::Output(node, index)).copied()
    }

    fn workspace_offset(&self, node: NodeIndex, index: usize) -> Option<usize> {
        self.offsets.get(&Slot::Workspace(node, index)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::builtin::{AllReduceKernel, BinaryKernel, BinaryOp, ReduceSumKernel};

    #[test]
    fn communication_feeds_and_refs_get_no_slot() {
        let mut graph = KernelGraph::new(0);
        let a = graph.add_kernel("a", "Add", Box::new(BinaryKernel::new(BinaryOp::Add, 16)), &[]).unwrap();
        let b = graph.add_kernel("b", "Add", Box::new(BinaryKernel::new(BinaryOp::Add, 16)), &[(a, 0)]).unwrap();
        let s = graph.add_kernel("s", "ReduceSum", Box::new(ReduceSumKernel::default()), &[(a, 0)]).unwrap();
        let r = graph.add_kernel("r", "Add", Box::new(BinaryKernel::new(BinaryOp::Add, 4)), &[(s, 0)]).unwrap();
        let ar = graph.add_kernel("ar", "AllReduce", Box::new(AllReduceKernel::new(vec![16])), &[(b, 0)]).unwrap();
        graph.set_communication(ar, true).unwrap();
        graph.add_ref_output(r, 0, 0).unwrap();
        graph.build_execution_order().unwrap();

        let mut planner = LifetimeReusePlanner::default();
        let total = planner.plan(&graph, 32).unwrap();

        assert_eq!(planner.output_offset(b, 0), None);
        assert_eq!(planner.output_offset(ar, 0), None);
        assert_eq!(planner.output_offset(r, 0), None);
        let a_off = planner.output_offset(a, 0).unwrap();
        let s_out = planner.output_offset(s, 0).unwrap();
        let s_ws = planner.workspace_offset(s, 0).unwrap();
        // the ref origin stays alive, so nothing overlaps it
        assert_ne!(s_out, s_ws);
        assert_ne!(a_off, s_out);
        assert_ne!(a_off, s_ws);
        assert_eq!(total, 96);
    }
}
