pub mod rec_graph;

pub use rec_graph::{EliminatedGraph, OperatorDesc, RecGraph, RecNode, RecOpType, TensorShape4D, eliminate_graph, parse_graph};
