use log::debug;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet};

use crate::core::{DataType, Format, Shape, Tensor};
use crate::device::address::DeviceAddressPtr;
use crate::error::RuntimeError;
use crate::kernel::KernelMod;

pub const ATOMIC_ADDR_CLEAN_OP: &str = "AtomicAddrClean";
pub const GET_NEXT_OP: &str = "GetNext";

/// Attribute naming the outputs an atomic clean must zero.
pub const ATTR_ATOMIC_OUTPUT_INDEXS: &str = "atomic_output_clean_indexs";
/// Attribute holding the workspace bytes an atomic clean must zero.
pub const ATTR_ATOMIC_WORKSPACE_SIZE: &str = "atomic_workspace_clean_size";
/// Kernel input order as a permutation of graph input order.
pub const ATTR_INPUT_INDEX_MAP: &str = "input_index_map";

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    IntList(Vec<i64>),
    Str(String),
}

/// Typed attribute store of a node.
#[derive(Debug, Clone, Default)]
pub struct NodeAttrs {
    values: HashMap<String, AttrValue>,
}

impl NodeAttrs {
    pub fn set(&mut self, name: impl Into<String>, value: AttrValue) {
        self.values.insert(name.into(), value);
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.values.get(name)
    }

    pub fn get_bool(&self, name: &str) -> anyhow::Result<bool> {
        match self.values.get(name) {
            Some(AttrValue::Bool(v)) => Ok(*v),
            other => Err(attr_error(name, "bool", other)),
        }
    }

    pub fn get_int(&self, name: &str) -> anyhow::Result<i64> {
        match self.values.get(name) {
            Some(AttrValue::Int(v)) => Ok(*v),
            other => Err(attr_error(name, "int", other)),
        }
    }

    pub fn get_float(&self, name: &str) -> anyhow::Result<f64> {
        match self.values.get(name) {
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(AttrValue::Int(v)) => Ok(*v as f64),
            other => Err(attr_error(name, "float", other)),
        }
    }

    pub fn get_int_list(&self, name: &str) -> anyhow::Result<Vec<i64>> {
        match self.values.get(name) {
            Some(AttrValue::IntList(v)) => Ok(v.clone()),
            other => Err(attr_error(name, "int list", other)),
        }
    }

    pub fn get_str(&self, name: &str) -> anyhow::Result<&str> {
        match self.values.get(name) {
            Some(AttrValue::Str(v)) => Ok(v),
            other => Err(attr_error(name, "string", other)),
        }
    }
}

fn attr_error(name: &str, expected: &str, found: Option<&AttrValue>) -> anyhow::Error {
    match found {
        None => anyhow::anyhow!("Attribute '{}' not found", name),
        Some(v) => anyhow::anyhow!("Attribute '{}' is {:?}, expected {}", name, v, expected),
    }
}

pub struct ParameterNode {
    pub name: String,
    pub shape: Shape,
    pub dtype: DataType,
    pub format: Format,
    /// Invalid inputs get no memory.
    pub valid: bool,
}

pub enum ConstValue {
    Tensor(Tensor),
    Str(String),
}

pub struct ValueNode {
    pub name: String,
    pub value: ConstValue,
}

pub struct KernelNode {
    pub name: String,
    pub op_type: String,
    pub kernel_mod: Box<dyn KernelMod>,
    pub attrs: NodeAttrs,
    pub output_dtypes: Vec<DataType>,
    pub output_formats: Vec<Format>,
    pub communication: bool,
    /// Node whose dirty buffers an atomic clean zeroes.
    pub clean_target: Option<NodeIndex>,
}

pub enum AnfNode {
    Parameter(ParameterNode),
    Value(ValueNode),
    Kernel(KernelNode),
}

impl AnfNode {
    pub fn name(&self) -> &str {
        match self {
            AnfNode::Parameter(p) => &p.name,
            AnfNode::Value(v) => &v.name,
            AnfNode::Kernel(k) => &k.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Data { output_index: usize, input_index: usize },
    /// Ordering only, carries no tensor
    Control,
}

#[derive(Default)]
struct NodeAddresses {
    outputs: Vec<Option<DeviceAddressPtr>>,
    workspaces: Vec<Option<DeviceAddressPtr>>,
}

fn slot(list: &mut Vec<Option<DeviceAddressPtr>>, index: usize) -> &mut Option<DeviceAddressPtr> {
    if list.len() <= index {
        list.resize(index + 1, None);
    }
    &mut list[index]
}

/// Computation graph handed to the runtime: nodes in a petgraph arena,
/// plus the device addresses bound to their outputs and workspaces.
pub struct KernelGraph {
    graph_id: u32,
    graph: DiGraph<AnfNode, Edge>,
    node_map: HashMap<String, NodeIndex>,
    inputs: Vec<NodeIndex>,
    value_nodes: Vec<NodeIndex>,
    execution_order: Vec<NodeIndex>,
    outputs: Vec<(NodeIndex, usize)>,
    ref_out_map: HashMap<(NodeIndex, usize), (NodeIndex, usize)>,
    addresses: HashMap<NodeIndex, NodeAddresses>,
}

impl KernelGraph {
    pub fn new(graph_id: u32) -> Self {
        Self {
            graph_id,
            graph: DiGraph::new(),
            node_map: HashMap::new(),
            inputs: Vec::new(),
            value_nodes: Vec::new(),
            execution_order: Vec::new(),
            outputs: Vec::new(),
            ref_out_map: HashMap::new(),
            addresses: HashMap::new(),
        }
    }

    pub fn graph_id(&self) -> u32 {
        self.graph_id
    }

    fn insert(&mut self, node: AnfNode) -> anyhow::Result<NodeIndex> {
        let name = node.name().to_string();
        if self.node_map.contains_key(&name) {
            return Err(RuntimeError::malformed(format!("Duplicate node name '{}'", name)));
        }
        let idx = self.graph.add_node(node);
        self.node_map.insert(name, idx);
        Ok(idx)
    }

    pub fn add_parameter(&mut self, name: &str, shape: Shape, dtype: DataType) -> anyhow::Result<NodeIndex> {
        let idx = self.insert(AnfNode::Parameter(ParameterNode {
            name: name.to_string(),
            shape,
            dtype,
            format: Format::Default,
            valid: true,
        }))?;
        self.inputs.push(idx);
        Ok(idx)
    }

    pub fn set_input_valid(&mut self, node: NodeIndex, valid: bool) -> anyhow::Result<()> {
        match self.graph.node_weight_mut(node) {
            Some(AnfNode::Parameter(p)) => {
                p.valid = valid;
                Ok(())
            }
            _ => Err(RuntimeError::malformed(format!("{:?} is not a graph input", node))),
        }
    }

    pub fn add_value_node(&mut self, name: &str, value: ConstValue) -> anyhow::Result<NodeIndex> {
        let idx = self.insert(AnfNode::Value(ValueNode { name: name.to_string(), value }))?;
        self.value_nodes.push(idx);
        Ok(idx)
    }

    /// Adds a kernel fed by `inputs`, each a producer output `(node, index)`.
    pub fn add_kernel(
        &mut self,
        name: &str,
        op_type: &str,
        kernel_mod: Box<dyn KernelMod>,
        inputs: &[(NodeIndex, usize)],
    ) -> anyhow::Result<NodeIndex> {
        for &(producer, output_index) in inputs {
            let available = self.output_tensor_num(producer)?;
            if output_index >= available {
                return Err(RuntimeError::malformed(format!(
                    "Kernel '{}' reads output {} of '{}' which has {} outputs",
                    name,
                    output_index,
                    self.node_name(producer),
                    available
                )));
            }
        }
        let num_outputs = kernel_mod.output_size_list().len();
        let idx = self.insert(AnfNode::Kernel(KernelNode {
            name: name.to_string(),
            op_type: op_type.to_string(),
            kernel_mod,
            attrs: NodeAttrs::default(),
            output_dtypes: vec![DataType::F32; num_outputs],
            output_formats: vec![Format::Default; num_outputs],
            communication: false,
            clean_target: None,
        }))?;
        for (input_index, &(producer, output_index)) in inputs.iter().enumerate() {
            self.graph.add_edge(producer, idx, Edge::Data { output_index, input_index });
        }
        Ok(idx)
    }

    /// Adds an atomic clean kernel scheduled right before `target`.
    pub fn add_atomic_clean(
        &mut self,
        name: &str,
        kernel_mod: Box<dyn KernelMod>,
        target: NodeIndex,
    ) -> anyhow::Result<NodeIndex> {
        self.kernel(target)?;
        let idx = self.add_kernel(name, ATOMIC_ADDR_CLEAN_OP, kernel_mod, &[])?;
        self.kernel_mut(idx)?.clean_target = Some(target);
        self.graph.add_edge(idx, target, Edge::Control);
        Ok(idx)
    }

    pub fn kernel(&self, node: NodeIndex) -> anyhow::Result<&KernelNode> {
        match self.graph.node_weight(node) {
            Some(AnfNode::Kernel(k)) => Ok(k),
            Some(other) => Err(RuntimeError::malformed(format!("'{}' is not a kernel node", other.name()))),
            None => Err(RuntimeError::malformed(format!("Unknown node {:?}", node))),
        }
    }

    pub fn kernel_mut(&mut self, node: NodeIndex) -> anyhow::Result<&mut KernelNode> {
        match self.graph.node_weight_mut(node) {
            Some(AnfNode::Kernel(k)) => Ok(k),
            Some(other) => Err(RuntimeError::malformed(format!("'{}' is not a kernel node", other.name()))),
            None => Err(RuntimeError::malformed(format!("Unknown node {:?}", node))),
        }
    }

    pub fn node(&self, node: NodeIndex) -> anyhow::Result<&AnfNode> {
        self.graph
            .node_weight(node)
            .ok_or_else(|| RuntimeError::malformed(format!("Unknown node {:?}", node)))
    }

    pub fn is_kernel(&self, node: NodeIndex) -> bool {
        matches!(self.graph.node_weight(node), Some(AnfNode::Kernel(_)))
    }

    pub fn node_name(&self, node: NodeIndex) -> &str {
        self.graph.node_weight(node).map(|n| n.name()).unwrap_or("<unknown>")
    }

    pub fn find_node(&self, name: &str) -> Option<NodeIndex> {
        self.node_map.get(name).copied()
    }

    pub fn set_communication(&mut self, node: NodeIndex, communication: bool) -> anyhow::Result<()> {
        self.kernel_mut(node)?.communication = communication;
        Ok(())
    }

    pub fn set_attr(&mut self, node: NodeIndex, name: &str, value: AttrValue) -> anyhow::Result<()> {
        self.kernel_mut(node)?.attrs.set(name, value);
        Ok(())
    }

    pub fn is_communication_op(&self, node: NodeIndex) -> bool {
        matches!(self.graph.node_weight(node), Some(AnfNode::Kernel(k)) if k.communication)
    }

    pub fn op_type(&self, node: NodeIndex) -> Option<&str> {
        match self.graph.node_weight(node) {
            Some(AnfNode::Kernel(k)) => Some(&k.op_type),
            _ => None,
        }
    }

    pub fn inputs(&self) -> &[NodeIndex] {
        &self.inputs
    }

    pub fn value_nodes(&self) -> &[NodeIndex] {
        &self.value_nodes
    }

    pub fn outputs(&self) -> &[(NodeIndex, usize)] {
        &self.outputs
    }

    pub fn set_outputs(&mut self, outputs: Vec<(NodeIndex, usize)>) -> anyhow::Result<()> {
        for &(node, index) in &outputs {
            if index >= self.output_tensor_num(node)? {
                return Err(RuntimeError::malformed(format!(
                    "Graph output {} of '{}' does not exist",
                    index,
                    self.node_name(node)
                )));
            }
        }
        self.outputs = outputs;
        Ok(())
    }

    pub fn is_graph_output(&self, node: NodeIndex, index: usize) -> bool {
        self.outputs.contains(&(node, index))
    }

    pub fn execution_order(&self) -> &[NodeIndex] {
        &self.execution_order
    }

    pub fn set_execution_order(&mut self, order: Vec<NodeIndex>) -> anyhow::Result<()> {
        for &node in &order {
            self.kernel(node)?;
        }
        self.execution_order = order;
        Ok(())
    }

    /// Topological order of the kernel nodes.
    pub fn build_execution_order(&mut self) -> anyhow::Result<()> {
        let sorted = toposort(&self.graph, None)
            .map_err(|cycle| RuntimeError::malformed(format!(
                "Cycle in graph {} at '{}'",
                self.graph_id,
                self.node_name(cycle.node_id())
            )))?;
        self.execution_order = sorted.into_iter().filter(|&n| self.is_kernel(n)).collect();
        debug!("Graph {} execution order has {} kernels", self.graph_id, self.execution_order.len());
        Ok(())
    }

    /// Declares output `output_index` of `node` as alias of its input `input_index`.
    pub fn add_ref_output(&mut self, node: NodeIndex, output_index: usize, input_index: usize) -> anyhow::Result<()> {
        if output_index >= self.output_tensor_num(node)? {
            return Err(RuntimeError::malformed(format!(
                "Ref output {} of '{}' does not exist",
                output_index,
                self.node_name(node)
            )));
        }
        let origin = self.prev_node_output(node, input_index)?;
        self.ref_out_map.insert((node, output_index), origin);
        Ok(())
    }

    pub fn is_in_ref_output_map(&self, key: (NodeIndex, usize)) -> bool {
        self.ref_out_map.contains_key(&key)
    }

    pub fn get_ref_correspond_output(&self, key: (NodeIndex, usize)) -> Option<(NodeIndex, usize)> {
        self.ref_out_map.get(&key).copied()
    }

    /// True when some ref output aliases `(node, index)`.
    pub fn is_ref_origin(&self, key: (NodeIndex, usize)) -> bool {
        self.ref_out_map.values().any(|&origin| origin == key)
    }

    pub fn input_tensor_num(&self, node: NodeIndex) -> usize {
        self.graph
            .edges_directed(node, Direction::Incoming)
            .filter(|e| matches!(e.weight(), Edge::Data { .. }))
            .count()
    }

    /// Producer output feeding input `input_index` of `node`.
    pub fn prev_node_output(&self, node: NodeIndex, input_index: usize) -> anyhow::Result<(NodeIndex, usize)> {
        self.graph
            .edges_directed(node, Direction::Incoming)
            .find_map(|e| match *e.weight() {
                Edge::Data { output_index, input_index: i } if i == input_index => Some((e.source(), output_index)),
                _ => None,
            })
            .ok_or_else(|| {
                RuntimeError::malformed(format!("'{}' has no input {}", self.node_name(node), input_index))
            })
    }

    /// Kernels reading output `index` of `node`.
    pub fn consumers(&self, node: NodeIndex, index: usize) -> Vec<NodeIndex> {
        let mut seen = HashSet::new();
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .filter(|e| matches!(e.weight(), Edge::Data { output_index, .. } if *output_index == index))
            .map(|e| e.target())
            .filter(|n| seen.insert(*n))
            .collect()
    }

    /// Kernel input `index` mapped to graph input order.
    pub fn real_input_index(&self, node: NodeIndex, index: usize) -> anyhow::Result<usize> {
        let kernel = self.kernel(node)?;
        if !kernel.attrs.has(ATTR_INPUT_INDEX_MAP) {
            return Ok(index);
        }
        let map = kernel.attrs.get_int_list(ATTR_INPUT_INDEX_MAP)?;
        map.get(index)
            .and_then(|&i| usize::try_from(i).ok())
            .ok_or_else(|| {
                RuntimeError::malformed(format!(
                    "Input index map of '{}' has no entry {}",
                    kernel.name, index
                ))
            })
    }

    pub fn output_tensor_num(&self, node: NodeIndex) -> anyhow::Result<usize> {
        Ok(match self.node(node)? {
            AnfNode::Parameter(_) | AnfNode::Value(_) => 1,
            AnfNode::Kernel(k) => k.kernel_mod.output_size_list().len(),
        })
    }

    pub fn output_format(&self, node: NodeIndex, index: usize) -> Format {
        match self.graph.node_weight(node) {
            Some(AnfNode::Parameter(p)) => p.format,
            Some(AnfNode::Kernel(k)) => k.output_formats.get(index).copied().unwrap_or_default(),
            _ => Format::Default,
        }
    }

    pub fn output_dtype(&self, node: NodeIndex, index: usize) -> DataType {
        match self.graph.node_weight(node) {
            Some(AnfNode::Parameter(p)) => p.dtype,
            Some(AnfNode::Value(ValueNode { value: ConstValue::Tensor(t), .. })) => t.dtype(),
            Some(AnfNode::Value(ValueNode { value: ConstValue::Str(_), .. })) => DataType::U8,
            Some(AnfNode::Kernel(k)) => k.output_dtypes.get(index).copied().unwrap_or_default(),
            None => DataType::Unknown,
        }
    }

    /// Bytes of output `index`: shape product times type size for inputs,
    /// declared sizes for kernels.
    pub fn count_node_device_memory_size(&self, node: NodeIndex, index: usize) -> anyhow::Result<usize> {
        match self.node(node)? {
            AnfNode::Parameter(p) => Ok(p.shape.byte_size(p.dtype)),
            AnfNode::Value(ValueNode { value: ConstValue::Tensor(t), .. }) => Ok(t.byte_size()),
            AnfNode::Value(ValueNode { value: ConstValue::Str(s), .. }) => Ok(s.len()),
            AnfNode::Kernel(k) => k.kernel_mod.output_size_list().get(index).copied().ok_or_else(|| {
                RuntimeError::malformed(format!("'{}' has no output {}", k.name, index))
            }),
        }
    }

    pub fn output_addr(&self, node: NodeIndex, index: usize) -> Option<DeviceAddressPtr> {
        self.addresses
            .get(&node)
            .and_then(|a| a.outputs.get(index))
            .and_then(|a| a.clone())
    }

    pub fn output_addr_exist(&self, node: NodeIndex, index: usize) -> bool {
        self.output_addr(node, index).is_some()
    }

    pub fn set_output_addr(&mut self, node: NodeIndex, index: usize, addr: DeviceAddressPtr) {
        let entry = self.addresses.entry(node).or_default();
        *slot(&mut entry.outputs, index) = Some(addr);
    }

    pub fn workspace_addr(&self, node: NodeIndex, index: usize) -> Option<DeviceAddressPtr> {
        self.addresses
            .get(&node)
            .and_then(|a| a.workspaces.get(index))
            .and_then(|a| a.clone())
    }

    pub fn set_workspace_addr(&mut self, node: NodeIndex, index: usize, addr: DeviceAddressPtr) {
        let entry = self.addresses.entry(node).or_default();
        *slot(&mut entry.workspaces, index) = Some(addr);
    }

    /// Every address bound on the graph.
    pub fn all_addresses(&self) -> Vec<DeviceAddressPtr> {
        self.addresses
            .values()
            .flat_map(|a| a.outputs.iter().chain(a.workspaces.iter()))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn clear_addresses(&mut self) {
        self.addresses.clear();
    }
}
