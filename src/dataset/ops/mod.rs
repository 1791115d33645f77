pub mod generator_op;
pub mod map_op;
pub mod repeat_op;

pub use generator_op::GeneratorOp;
pub use map_op::{MapOp, RowFn};
pub use repeat_op::RepeatOp;
