pub mod connector;
pub mod data_buffer;
pub mod dataset_op;
pub mod execution_tree;
pub mod ops;
pub mod pass;
pub mod sampler;
pub mod task_group;

pub use connector::{Connector, StopToken};
pub use data_buffer::{BufferFlag, DataBuffer, TensorRow};
pub use dataset_op::{DatasetOp, NodeId, OpContext, OpCore, OpRef, OpState, PrepareFlags};
pub use execution_tree::{ExecutionTree, TreeState};
pub use pass::{PassPipeline, PrinterPass, TreePass};
pub use task_group::TaskGroup;
