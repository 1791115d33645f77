use log::debug;
use std::fmt;
use std::sync::Mutex;

use crate::dataset::data_buffer::DataBuffer;
use crate::dataset::dataset_op::{DatasetOp, NodeId, OpContext, OpCore, PrepareFlags};
use crate::dataset::execution_tree::ExecutionTree;
use crate::error::RuntimeError;

#[derive(Default)]
struct RepeatState {
    repeat_count: usize,
    eoe_ops: Vec<NodeId>,
}

/// Replays its subtree `num_repeats` times. Inlined: runs on the thread
/// of its parent.
pub struct RepeatOp {
    core: OpCore,
    num_repeats: usize,
    state: Mutex<RepeatState>,
}

impl RepeatOp {
    pub fn new(num_repeats: usize) -> anyhow::Result<Self> {
        if num_repeats == 0 {
            return Err(RuntimeError::unexpected("RepeatOp needs at least one repeat"));
        }
        Ok(Self {
            core: OpCore::new("RepeatOp", 1, 0),
            num_repeats,
            state: Mutex::new(RepeatState::default()),
        })
    }

    pub fn num_repeats(&self) -> usize {
        self.num_repeats
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, RepeatState>> {
        self.state
            .lock()
            .map_err(|_| RuntimeError::unexpected("RepeatOp mutex poisoned"))
    }
}

impl DatasetOp for RepeatOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn prepare_flags(&self) -> PrepareFlags {
        PrepareFlags::REPEAT
    }

    fn prepare_node_post_action(&self, tree: &mut ExecutionTree) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        while let Some(id) = tree.pop_from_repeat_stack() {
            if self.num_repeats == 1 {
                if let Some(op) = tree.op(id) {
                    op.core().set_control_flag(OpCore::LAST_REPEAT);
                }
            }
            state.eoe_ops.push(id);
        }
        debug!("RepeatOp controls {} leaf operators", state.eoe_ops.len());
        Ok(())
    }

    fn get_next_buffer(&self, ctx: &OpContext) -> anyhow::Result<DataBuffer> {
        let mut buffer = ctx.child_next_buffer(0)?;
        while buffer.is_eoe() {
            let eoe_ops = {
                let mut state = self.lock()?;
                state.repeat_count += 1;
                if state.repeat_count == self.num_repeats {
                    state.repeat_count = 0;
                    return Ok(buffer);
                }
                if state.repeat_count + 1 == self.num_repeats {
                    for &id in &state.eoe_ops {
                        ctx.op_by_id(id)?.core().set_control_flag(OpCore::LAST_REPEAT);
                    }
                }
                state.eoe_ops.clone()
            };
            for id in eoe_ops {
                ctx.op_by_id(id)?.reset()?;
            }
            buffer = ctx.child_next_buffer(0)?;
        }
        Ok(buffer)
    }

    fn print(&self, f: &mut dyn fmt::Write, detailed: bool) -> fmt::Result {
        let id = self.id().map(|i| i.to_string()).unwrap_or_else(|| "-".into());
        if !detailed {
            return write!(f, "({:>3}) <RepeatOp>: [repeats: {}]", id, self.num_repeats);
        }
        writeln!(f, "Operator 'RepeatOp' (id {})", id)?;
        writeln!(f, "  repeats: {}", self.num_repeats)
    }
}
