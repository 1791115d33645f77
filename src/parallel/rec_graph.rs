use anyhow::bail;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Operator classes the recursive partitioner distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecOpType {
    MatMul,
    Convolution,
    Pooling,
    ReLU,
    BatchNorm,
    OneHot,
    Log,
    Exp,
    Add,
    ElmWiseOp,
    BiasAdd,
    Sub,
    Mul,
    Div,
    Squeeze,
    Reduce,
    Cast,
    Reshape,
    SoftmaxCrossEntropyWithLogits,
    Unknown,
}

impl RecOpType {
    pub fn from_op_name(name: &str) -> Self {
        match name {
            "MatMul" => RecOpType::MatMul,
            "Conv2D" => RecOpType::Convolution,
            "MaxPool" | "AvgPool" => RecOpType::Pooling,
            "ReLU" | "ReLU6" => RecOpType::ReLU,
            "BatchNorm" | "FusedBatchNorm" => RecOpType::BatchNorm,
            "OneHot" => RecOpType::OneHot,
            "Log" => RecOpType::Log,
            "Exp" => RecOpType::Exp,
            "Add" | "TensorAdd" => RecOpType::Add,
            "Sqrt" | "Neg" | "Tanh" | "Sigmoid" | "Maximum" | "Minimum" => RecOpType::ElmWiseOp,
            "BiasAdd" => RecOpType::BiasAdd,
            "Sub" => RecOpType::Sub,
            "Mul" => RecOpType::Mul,
            "Div" | "RealDiv" => RecOpType::Div,
            "Squeeze" => RecOpType::Squeeze,
            "ReduceSum" | "ReduceMean" | "ReduceMax" => RecOpType::Reduce,
            "Cast" => RecOpType::Cast,
            "Reshape" => RecOpType::Reshape,
            "SoftmaxCrossEntropyWithLogits" => RecOpType::SoftmaxCrossEntropyWithLogits,
            _ => RecOpType::Unknown,
        }
    }

    /// Ops that do not affect the partitioning and are contracted away.
    pub fn is_pass_through(self) -> bool {
        matches!(
            self,
            RecOpType::OneHot
                | RecOpType::ReLU
                | RecOpType::Log
                | RecOpType::Exp
                | RecOpType::Add
                | RecOpType::ElmWiseOp
                | RecOpType::BiasAdd
                | RecOpType::Sub
                | RecOpType::Mul
                | RecOpType::Div
                | RecOpType::Squeeze
                | RecOpType::Reduce
                | RecOpType::Cast
                | RecOpType::Reshape
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorShape4D {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl TensorShape4D {
    pub fn new(n: usize, c: usize, h: usize, w: usize) -> Self {
        Self { n, c, h, w }
    }

    /// Pads a shape of rank 0, 1, 2 or 4 on the left with ones.
    pub fn from_dims(dims: &[usize]) -> anyhow::Result<Self> {
        Ok(match *dims {
            [n, c, h, w] => Self::new(n, c, h, w),
            [h, w] => Self::new(1, 1, h, w),
            [w] => Self::new(1, 1, 1, w),
            [] => Self::new(1, 1, 1, 1),
            _ => bail!("Unsupported tensor rank {}", dims.len()),
        })
    }
}

/// Operator as handed over by the parallel planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorDesc {
    pub name: String,
    pub op_type: String,
    pub output_shape: Vec<usize>,
    #[serde(default)]
    pub input_shapes: Vec<Vec<usize>>,
    /// Names of the operators producing the inputs
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub transpose_a: bool,
    #[serde(default)]
    pub transpose_b: bool,
}

#[derive(Debug, Clone)]
pub struct RecNode {
    pub name: String,
    pub op_type: RecOpType,
    pub tensor: TensorShape4D,
    pub arguments: Vec<TensorShape4D>,
    pub node_in: Vec<usize>,
    pub node_out: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RecGraph {
    pub nodes: Vec<RecNode>,
}

fn input_shape(op: &OperatorDesc, op_type: RecOpType, index: usize, dims: &[usize]) -> anyhow::Result<TensorShape4D> {
    if let ([rows, cols], RecOpType::MatMul) = (dims, op_type) {
        let transposed = (op.transpose_a && index == 0) || (op.transpose_b && index == 1);
        if transposed {
            return Ok(TensorShape4D::new(1, 1, *cols, *rows));
        }
    }
    TensorShape4D::from_dims(dims)
}

pub fn parse_graph(ops: &[OperatorDesc]) -> anyhow::Result<RecGraph> {
    let mut graph = RecGraph::default();
    for op in ops {
        let op_type = RecOpType::from_op_name(&op.op_type);
        if op_type == RecOpType::Unknown {
            debug!("Operator '{}' has unknown type '{}'", op.name, op.op_type);
        }
        let arguments = op
            .input_shapes
            .iter()
            .enumerate()
            .map(|(i, dims)| input_shape(op, op_type, i, dims))
            .collect::<anyhow::Result<Vec<_>>>()?;
        graph.nodes.push(RecNode {
            name: op.name.clone(),
            op_type,
            tensor: TensorShape4D::from_dims(&op.output_shape)?,
            arguments,
            node_in: Vec::new(),
            node_out: Vec::new(),
        });
    }

    // Inputs from outside the operator list (parameters) get no edge
    let index: HashMap<&str, usize> = ops.iter().enumerate().map(|(i, op)| (op.name.as_str(), i)).collect();
    for (tail, op) in ops.iter().enumerate() {
        for input in &op.inputs {
            match index.get(input.as_str()) {
                Some(&head) if head != tail => {
                    graph.nodes[tail].node_in.push(head);
                    graph.nodes[head].node_out.push(tail);
                }
                _ => {}
            }
        }
    }
    Ok(graph)
}

/// Result of contracting pass-through operators.
#[derive(Debug, Clone)]
pub struct EliminatedGraph {
    pub graph: RecGraph,
    /// Each entry: removed node followed by its consumers at removal time
    pub eliminated: Vec<Vec<usize>>,
    /// Old index to new index, `None` for removed nodes
    pub index_map: Vec<Option<usize>>,
}

fn remove_first(list: &mut Vec<usize>, value: usize) -> bool {
    match list.iter().position(|&v| v == value) {
        Some(pos) => {
            list.remove(pos);
            true
        }
        None => false,
    }
}

fn bypass(graph: &mut RecGraph, node: usize) {
    let node_in = graph.nodes[node].node_in.clone();
    let node_out = graph.nodes[node].node_out.clone();
    for &input in &node_in {
        if remove_first(&mut graph.nodes[input].node_out, node) {
            graph.nodes[input].node_out.extend_from_slice(&node_out);
        }
    }
    for &output in &node_out {
        if remove_first(&mut graph.nodes[output].node_in, node) {
            graph.nodes[output].node_in.extend_from_slice(&node_in);
        }
    }
}

/// Rewires every pass-through node's producers to its consumers, then
/// compacts the arena.
pub fn eliminate_graph(mut graph: RecGraph) -> EliminatedGraph {
    let mut eliminated = Vec::new();
    for node in 0..graph.nodes.len() {
        if !graph.nodes[node].op_type.is_pass_through() {
            continue;
        }
        let mut entry = vec![node];
        entry.extend_from_slice(&graph.nodes[node].node_out);
        eliminated.push(entry);
        bypass(&mut graph, node);
    }

    let mut index_map = Vec::with_capacity(graph.nodes.len());
    let mut next = 0;
    for node in &graph.nodes {
        if node.op_type.is_pass_through() {
            index_map.push(None);
        } else {
            index_map.push(Some(next));
            next += 1;
        }
    }

    let remap = |list: &[usize]| -> Vec<usize> { list.iter().filter_map(|&i| index_map[i]).collect() };
    let nodes = graph
        .nodes
        .iter()
        .zip(&index_map)
        .filter(|(_, new)| new.is_some())
        .map(|(node, _)| RecNode {
            node_in: remap(&node.node_in),
            node_out: remap(&node.node_out),
            ..node.clone()
        })
        .collect();
    debug!("Eliminated {} pass-through operators", eliminated.len());

    EliminatedGraph {
        graph: RecGraph { nodes },
        eliminated,
        index_map,
    }
}
