use std::fmt;
use std::sync::Arc;

use crate::dataset::connector::BoundedQueue;
use crate::dataset::data_buffer::{DataBuffer, TensorRow};
use crate::dataset::dataset_op::{DatasetOp, OpContext, OpCore};

pub type RowFn = Arc<dyn Fn(TensorRow) -> anyhow::Result<TensorRow> + Send + Sync>;

/// Applies a row function with a pool of workers.
///
/// The main task deals child buffers round-robin to per-worker queues;
/// worker `i` writes to producer queue `i` of the output connector, which
/// the parent reads round-robin, so buffer order survives the pool.
pub struct MapOp {
    core: OpCore,
    func: RowFn,
}

impl MapOp {
    pub fn new(num_workers: usize, connector_capacity: usize, func: RowFn) -> Self {
        Self {
            core: OpCore::new("MapOp", num_workers, connector_capacity.max(1)),
            func,
        }
    }

    fn worker_entry(
        worker_id: usize,
        queue: &BoundedQueue<DataBuffer>,
        func: &RowFn,
        ctx: &OpContext,
    ) -> anyhow::Result<()> {
        loop {
            let buffer = queue.pop()?;
            if buffer.is_eof() {
                return ctx.push(worker_id, buffer);
            }
            if buffer.is_eoe() {
                ctx.push(worker_id, buffer)?;
                continue;
            }
            let id = buffer.id();
            let rows = buffer
                .into_rows()
                .into_iter()
                .map(|row| func(row))
                .collect::<anyhow::Result<Vec<_>>>()?;
            ctx.push(worker_id, DataBuffer::new(id, rows))?;
        }
    }
}

impl DatasetOp for MapOp {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn run(&self, ctx: &OpContext) -> anyhow::Result<()> {
        let num_workers = self.num_workers();
        let stop = ctx.stop_token();
        let capacity = self.core.connector_capacity();
        let queues: Arc<Vec<BoundedQueue<DataBuffer>>> =
            Arc::new((0..num_workers).map(|_| BoundedQueue::new(capacity, stop.clone())).collect());

        {
            let queues = queues.clone();
            let func = self.func.clone();
            let worker_ctx = ctx.clone();
            ctx.launch_workers(
                num_workers,
                Arc::new(move |worker_id| Self::worker_entry(worker_id, &queues[worker_id], &func, &worker_ctx)),
            )?;
        }

        let mut next = 0;
        loop {
            let buffer = ctx.child_next_buffer(0)?;
            if buffer.is_eof() {
                for i in 0..num_workers {
                    queues[(next + i) % num_workers].push(DataBuffer::eof())?;
                }
                return Ok(());
            }
            queues[next].push(buffer)?;
            next = (next + 1) % num_workers;
        }
    }

    fn print(&self, f: &mut dyn fmt::Write, detailed: bool) -> fmt::Result {
        let id = self.id().map(|i| i.to_string()).unwrap_or_else(|| "-".into());
        if detailed {
            writeln!(f, "Operator 'MapOp' (id {})", id)?;
            writeln!(f, "  workers: {}", self.num_workers())
        } else {
            write!(f, "({:>3}) <MapOp>: [workers: {}]", id, self.num_workers())
        }
    }
}
