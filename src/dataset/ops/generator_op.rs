use log::debug;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::dataset::data_buffer::{DataBuffer, TensorRow};
use crate::dataset::dataset_op::{DatasetOp, OpContext, OpCore, PrepareFlags};
use crate::dataset::execution_tree::ExecutionTree;
use crate::dataset::sampler::{buffer_ids, RandomAccessOp, Sampler};
use crate::dataset::connector::StopToken;
use crate::error::RuntimeError;

const RESET_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Leaf source over rows held in memory, read in sampler order.
pub struct GeneratorOp {
    core: OpCore,
    rows: Vec<TensorRow>,
    label_column: Option<usize>,
    rows_per_buffer: usize,
    sampler: Mutex<Box<dyn Sampler>>,
    reset_pending: Mutex<bool>,
    reset_signal: Condvar,
}

impl GeneratorOp {
    pub fn new(
        rows: Vec<TensorRow>,
        sampler: Box<dyn Sampler>,
        rows_per_buffer: usize,
        connector_capacity: usize,
    ) -> Self {
        Self {
            core: OpCore::new("GeneratorOp", 1, connector_capacity.max(1)),
            rows,
            label_column: None,
            rows_per_buffer: rows_per_buffer.max(1),
            sampler: Mutex::new(sampler),
            reset_pending: Mutex::new(false),
            reset_signal: Condvar::new(),
        }
    }

    /// Column holding an int64 class label, enables `get_class_ids`.
    pub fn with_label_column(mut self, column: usize) -> Self {
        self.label_column = Some(column);
        self
    }

    fn sampler(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Box<dyn Sampler>>> {
        self.sampler
            .lock()
            .map_err(|_| RuntimeError::unexpected("Sampler mutex poisoned"))
    }

    fn wait_for_reset(&self, stop: &StopToken) -> anyhow::Result<()> {
        let mut pending = self
            .reset_pending
            .lock()
            .map_err(|_| RuntimeError::unexpected("Reset mutex poisoned"))?;
        while !*pending {
            stop.check()?;
            pending = self
                .reset_signal
                .wait_timeout(pending, RESET_POLL_INTERVAL)
                .map_err(|_| RuntimeError::unexpected("Reset mutex poisoned"))?
                .0;
        }
        *pending = false;
        Ok(())
    }

    fn load_rows(&self, ids: &[i64]) -> anyhow::Result<Vec<TensorRow>> {
        ids.iter()
            .map(|&id| {
                usize::try_from(id)
                    .ok()
                    .and_then(|i| self.rows.get(i))
                    .cloned()
                    .ok_or_else(|| RuntimeError::unexpected(format!("Row id {} out of range", id)))
            })
            .collect()
    }
}

impl RandomAccessOp for GeneratorOp {
    fn get_num_rows_in_dataset(&self) -> anyhow::Result<i64> {
        if self.rows.is_empty() {
            return Err(RuntimeError::unexpected("GeneratorOp holds no rows"));
        }
        Ok(self.rows.len() as i64)
    }

    fn get_class_ids(&self) -> anyhow::Result<BTreeMap<i64, Vec<i64>>> {
        let column = self
            .label_column
            .ok_or_else(|| RuntimeError::unexpected("GeneratorOp has no label column"))?;
        let mut classes: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for (id, row) in self.rows.iter().enumerate() {
            let label = row
                .get(column)
                .ok_or_else(|| RuntimeError::unexpected(format!("Row {} has no column {}", id, column)))?
                .item_i64(0)?;
            classes.entry(label).or_default().push(id as i64);
        }
        Ok(classes)
    }
}

impl DatasetOp for GeneratorOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn prepare_node_post_action(&self, tree: &mut ExecutionTree) -> anyhow::Result<()> {
        self.sampler()?.handshake_random_access_op(self)?;
        if tree.prepare_flags().contains(PrepareFlags::REPEAT) {
            let id = self
                .id()
                .ok_or_else(|| RuntimeError::unexpected("GeneratorOp prepared before registration"))?;
            tree.add_to_repeat_stack(id);
            self.core.set_control_flag(OpCore::REPEATED);
        }
        Ok(())
    }

    fn run(&self, ctx: &OpContext) -> anyhow::Result<()> {
        let stop = ctx.stop_token();
        let mut buffer_id = 0;
        loop {
            loop {
                let sample = self.sampler()?.get_next_buffer()?;
                if sample.is_eoe() {
                    break;
                }
                let ids = buffer_ids(&sample)?;
                for chunk in ids.chunks(self.rows_per_buffer) {
                    ctx.push(0, DataBuffer::new(buffer_id, self.load_rows(chunk)?))?;
                    buffer_id += 1;
                }
            }
            ctx.push(0, DataBuffer::eoe())?;

            let repeated = self.core.has_control_flag(OpCore::REPEATED);
            if !repeated || self.core.has_control_flag(OpCore::LAST_REPEAT) {
                ctx.push(0, DataBuffer::eof())?;
                return Ok(());
            }
            self.wait_for_reset(&stop)?;
            debug!("GeneratorOp({}) starts a new epoch", ctx.node_id());
            self.sampler()?.reset()?;
        }
    }

    fn reset(&self) -> anyhow::Result<()> {
        let mut pending = self
            .reset_pending
            .lock()
            .map_err(|_| RuntimeError::unexpected("Reset mutex poisoned"))?;
        *pending = true;
        self.reset_signal.notify_all();
        Ok(())
    }

    fn print(&self, f: &mut dyn fmt::Write, detailed: bool) -> fmt::Result {
        let id = self.id().map(|i| i.to_string()).unwrap_or_else(|| "-".into());
        if !detailed {
            return write!(f, "({:>3}) <GeneratorOp>: [rows: {}]", id, self.rows.len());
        }
        let sampler = self.sampler.lock().map(|s| s.name().to_string()).unwrap_or_default();
        writeln!(f, "Operator 'GeneratorOp' (id {})", id)?;
        writeln!(f, "  rows: {}", self.rows.len())?;
        writeln!(f, "  rows per buffer: {}", self.rows_per_buffer)?;
        writeln!(f, "  sampler: {}", sampler)
    }
}
