use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crate::dataset::connector::{Connector, StopToken};
use crate::dataset::data_buffer::DataBuffer;
use crate::dataset::execution_tree::ExecutionTree;
use crate::dataset::task_group::{TaskGroup, WorkerFn};
use crate::error::RuntimeError;

pub type NodeId = usize;
pub type OpRef = Arc<dyn DatasetOp>;

/// Bits an operator raises for its whole subtree during the prepare walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrepareFlags(u32);

impl PrepareFlags {
    pub const NONE: PrepareFlags = PrepareFlags(0);
    pub const REPEAT: PrepareFlags = PrepareFlags(1);
    pub const CACHE: PrepareFlags = PrepareFlags(1 << 1);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn set(&mut self, other: PrepareFlags) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: PrepareFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for PrepareFlags {
    type Output = PrepareFlags;
    fn bitor(self, rhs: Self) -> Self::Output {
        PrepareFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PrepareFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Idle,
    Running,
    Finished,
}

impl OpState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => OpState::Running,
            2 => OpState::Finished,
            _ => OpState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Registration {
    pub tree: u64,
    pub id: NodeId,
}

/// State every operator shares: identity, worker layout and lifecycle.
pub struct OpCore {
    name: String,
    registration: OnceLock<Registration>,
    state: AtomicU8,
    control_flags: AtomicU32,
    num_workers: usize,
    connector_capacity: usize,
}

impl OpCore {
    /// Operator sits below a repeat and must wait for a reset after each epoch.
    pub const REPEATED: u32 = 1;
    /// Current epoch is the last one of the enclosing repeat.
    pub const LAST_REPEAT: u32 = 1 << 1;

    /// `connector_capacity == 0` makes the operator inlined.
    pub fn new(name: impl Into<String>, num_workers: usize, connector_capacity: usize) -> Self {
        Self {
            name: name.into(),
            registration: OnceLock::new(),
            state: AtomicU8::new(0),
            control_flags: AtomicU32::new(0),
            num_workers: num_workers.max(1),
            connector_capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<NodeId> {
        self.registration.get().map(|r| r.id)
    }

    pub(crate) fn registration(&self) -> Option<Registration> {
        self.registration.get().copied()
    }

    pub(crate) fn register(&self, registration: Registration) -> bool {
        self.registration.set(registration).is_ok()
    }

    pub fn state(&self) -> OpState {
        OpState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: OpState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn set_control_flag(&self, flag: u32) {
        self.control_flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn has_control_flag(&self, flag: u32) -> bool {
        self.control_flags.load(Ordering::SeqCst) & flag != 0
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn connector_capacity(&self) -> usize {
        self.connector_capacity
    }
}

/// A node of the dataset execution tree.
pub trait DatasetOp: Send + Sync {
    fn core(&self) -> &OpCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn id(&self) -> Option<NodeId> {
        self.core().id()
    }

    fn state(&self) -> OpState {
        self.core().state()
    }

    fn num_workers(&self) -> usize {
        self.core().num_workers()
    }

    /// Queues feeding the output connector, one per worker.
    fn num_producers(&self) -> usize {
        self.num_workers()
    }

    fn num_consumers(&self) -> usize {
        1
    }

    fn inlined(&self) -> bool {
        self.core().connector_capacity() == 0
    }

    fn prepare_flags(&self) -> PrepareFlags {
        PrepareFlags::NONE
    }

    fn prepare_node_pre_action(&self, _tree: &mut ExecutionTree) -> anyhow::Result<()> {
        Ok(())
    }

    fn prepare_node_post_action(&self, _tree: &mut ExecutionTree) -> anyhow::Result<()> {
        Ok(())
    }

    /// Entry point of the dedicated task of a non-inlined operator.
    fn run(&self, _ctx: &OpContext) -> anyhow::Result<()> {
        Err(RuntimeError::unexpected(format!(
            "Operator '{}' has no task entry point",
            self.name()
        )))
    }

    /// Pull interface. Non-inlined operators read their own connector,
    /// inlined operators override this and compute on the caller's thread.
    fn get_next_buffer(&self, ctx: &OpContext) -> anyhow::Result<DataBuffer> {
        ctx.out_connector()?.pop()
    }

    /// Rewinds the operator for another epoch.
    fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn print(&self, f: &mut dyn fmt::Write, detailed: bool) -> fmt::Result {
        let id = self.id().map(|i| i.to_string()).unwrap_or_else(|| "-".into());
        if !detailed {
            return write!(f, "({:>3}) <{}>: [workers: {}]", id, self.name(), self.num_workers());
        }
        writeln!(f, "Operator '{}' (id {})", self.name(), id)?;
        writeln!(f, "  state: {:?}", self.state())?;
        writeln!(f, "  workers: {}", self.num_workers())?;
        writeln!(f, "  inlined: {}", self.inlined())?;
        writeln!(f, "  connector capacity: {}", self.core().connector_capacity())
    }
}

/// Frozen tree shape shared by every running task.
pub(crate) struct Topology {
    pub ops: Vec<OpRef>,
    pub children: Vec<Vec<NodeId>>,
    pub connectors: Vec<Option<Arc<Connector>>>,
}

/// Handle an operator uses while executing: its edges, its connector
/// and the task group of the tree.
#[derive(Clone)]
pub struct OpContext {
    topology: Arc<Topology>,
    tasks: Arc<TaskGroup>,
    node: NodeId,
}

impl OpContext {
    pub(crate) fn new(topology: Arc<Topology>, tasks: Arc<TaskGroup>, node: NodeId) -> Self {
        Self { topology, tasks, node }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn op(&self) -> &OpRef {
        &self.topology.ops[self.node]
    }

    pub fn num_children(&self) -> usize {
        self.topology.children[self.node].len()
    }

    pub fn child(&self, index: usize) -> anyhow::Result<OpContext> {
        let id = *self.topology.children[self.node].get(index).ok_or_else(|| {
            RuntimeError::unexpected(format!("Operator '{}' has no child {}", self.op().name(), index))
        })?;
        Ok(self.for_node(id))
    }

    pub fn for_node(&self, node: NodeId) -> OpContext {
        OpContext { topology: self.topology.clone(), tasks: self.tasks.clone(), node }
    }

    /// Operator registered under `node` in the same tree.
    pub fn op_by_id(&self, node: NodeId) -> anyhow::Result<&OpRef> {
        self.topology
            .ops
            .get(node)
            .ok_or_else(|| RuntimeError::unexpected(format!("No operator with id {}", node)))
    }

    /// Next buffer of child `index`: popped from its connector, or computed
    /// right here when the child is inlined.
    pub fn child_next_buffer(&self, index: usize) -> anyhow::Result<DataBuffer> {
        let child = self.child(index)?;
        let op = child.op().clone();
        op.get_next_buffer(&child)
    }

    pub fn out_connector(&self) -> anyhow::Result<&Arc<Connector>> {
        self.topology.connectors[self.node].as_ref().ok_or_else(|| {
            RuntimeError::unexpected(format!("Operator '{}' has no output connector", self.op().name()))
        })
    }

    pub fn push(&self, worker_id: usize, buffer: DataBuffer) -> anyhow::Result<()> {
        self.out_connector()?.push(worker_id, buffer)
    }

    pub fn stop_token(&self) -> StopToken {
        self.tasks.stop_token()
    }

    pub fn launch_workers(&self, num_workers: usize, f: WorkerFn) -> anyhow::Result<()> {
        let name = format!("{}({})", self.op().name(), self.node);
        self.tasks.launch_workers(&name, num_workers, f)
    }
}
