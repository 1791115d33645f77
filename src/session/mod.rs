pub mod graph_def;
pub mod kernel_graph;

pub use graph_def::GraphDef;
pub use kernel_graph::{AnfNode, AttrValue, ConstValue, Edge, KernelGraph, KernelNode, NodeAttrs};
