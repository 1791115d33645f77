use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dataset::connector::Connector;
use crate::dataset::data_buffer::DataBuffer;
use crate::dataset::dataset_op::{
    NodeId, OpContext, OpRef, OpState, PrepareFlags, Registration, Topology,
};
use crate::dataset::pass::{PassPipeline, TreePass};
use crate::dataset::task_group::{TaskGroup, WorkerFn};
use crate::error::RuntimeError;

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a tree. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TreeState {
    Init,
    Building,
    Prepare,
    Ready,
    Executing,
}

impl fmt::Display for TreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TreeState::Init => "Init",
            TreeState::Building => "Building",
            TreeState::Prepare => "Prepare",
            TreeState::Ready => "Ready",
            TreeState::Executing => "Executing",
        };
        write!(f, "{}", name)
    }
}

/// Dataset pipeline: an arena of operators with index edges, a lifecycle
/// state machine and the task group running the non-inlined operators.
pub struct ExecutionTree {
    tree_id: u64,
    id_count: usize,
    ops: Vec<OpRef>,
    children: Vec<Vec<NodeId>>,
    parents: Vec<Option<NodeId>>,
    root: Option<NodeId>,
    tree_state: TreeState,
    repeat_stack: Vec<NodeId>,
    prepare_flags: PrepareFlags,
    pre_actions: PassPipeline,
    optimizations: PassPipeline,
    post_actions: PassPipeline,
    tasks: Arc<TaskGroup>,
    topology: Option<Arc<Topology>>,
}

impl ExecutionTree {
    pub fn new() -> Self {
        Self {
            tree_id: NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed),
            id_count: 0,
            ops: Vec::new(),
            children: Vec::new(),
            parents: Vec::new(),
            root: None,
            tree_state: TreeState::Init,
            repeat_stack: Vec::new(),
            prepare_flags: PrepareFlags::NONE,
            pre_actions: PassPipeline::new(),
            optimizations: PassPipeline::new(),
            post_actions: PassPipeline::new(),
            tasks: Arc::new(TaskGroup::new()),
            topology: None,
        }
    }

    pub fn tree_state(&self) -> TreeState {
        self.tree_state
    }

    pub fn id_count(&self) -> usize {
        self.id_count
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn op(&self, id: NodeId) -> Option<&OpRef> {
        self.ops.get(id)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.children.get(id).map(|c| c.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(id).copied().flatten()
    }

    pub fn task_group(&self) -> &Arc<TaskGroup> {
        &self.tasks
    }

    fn invalid_state(&self, action: &'static str, expected: &'static str) -> anyhow::Error {
        RuntimeError::InvalidTreeState { action, current: self.tree_state, expected }.into()
    }

    /// Registers `op` in the arena and hands out the next sequential id.
    pub fn associate_node(&mut self, op: OpRef) -> anyhow::Result<NodeId> {
        if self.tree_state != TreeState::Init && self.tree_state != TreeState::Building {
            return Err(self.invalid_state("AssociateNode", "Init or Building"));
        }
        if let Some(reg) = op.core().registration() {
            if reg.tree != self.tree_id {
                return Err(RuntimeError::ForeignNode(op.name().to_string()).into());
            }
            return Err(RuntimeError::AlreadyAssociated { name: op.name().to_string(), id: reg.id }.into());
        }
        let id = self.id_count;
        if !op.core().register(Registration { tree: self.tree_id, id }) {
            return Err(RuntimeError::AlreadyAssociated { name: op.name().to_string(), id }.into());
        }
        self.ops.push(op);
        self.children.push(Vec::new());
        self.parents.push(None);
        self.id_count += 1;
        self.tree_state = TreeState::Building;
        Ok(id)
    }

    fn local_id(&self, op: &OpRef) -> anyhow::Result<NodeId> {
        match op.core().registration() {
            Some(reg) if reg.tree == self.tree_id => Ok(reg.id),
            _ => Err(RuntimeError::ForeignNode(op.name().to_string()).into()),
        }
    }

    /// Links `child` under `parent`. Both must already belong to this tree.
    pub fn add_child(&mut self, parent: &OpRef, child: &OpRef) -> anyhow::Result<()> {
        if self.tree_state != TreeState::Building && self.tree_state != TreeState::Prepare {
            return Err(self.invalid_state("AddChild", "Building or Prepare"));
        }
        let parent_id = self.local_id(parent)?;
        let child_id = self.local_id(child)?;
        if let Some(existing) = self.parents[child_id] {
            return Err(RuntimeError::malformed(format!(
                "Operator '{}' already has parent '{}'",
                child.name(),
                self.ops[existing].name()
            )));
        }
        // parent must not sit below child
        let mut cursor = Some(parent_id);
        while let Some(id) = cursor {
            if id == child_id {
                return Err(RuntimeError::malformed(format!(
                    "Linking '{}' under '{}' creates a cycle",
                    child.name(),
                    parent.name()
                )));
            }
            cursor = self.parents[id];
        }
        self.children[parent_id].push(child_id);
        self.parents[child_id] = Some(parent_id);
        Ok(())
    }

    /// Sets the single root of the tree, registering it first when needed.
    pub fn assign_root(&mut self, op: OpRef) -> anyhow::Result<NodeId> {
        if self.tree_state != TreeState::Building {
            return Err(self.invalid_state("AssignRoot", "Building"));
        }
        let id = match op.core().registration() {
            None => self.associate_node(op)?,
            Some(_) => self.local_id(&op)?,
        };
        self.root = Some(id);
        self.tree_state = TreeState::Prepare;
        Ok(id)
    }

    pub fn add_pre_action<P: TreePass + 'static>(&mut self, pass: P) {
        self.pre_actions.add_pass(pass);
    }

    pub fn add_optimization<P: TreePass + 'static>(&mut self, pass: P) {
        self.optimizations.add_pass(pass);
    }

    pub fn add_post_action<P: TreePass + 'static>(&mut self, pass: P) {
        self.post_actions.add_pass(pass);
    }

    fn run_passes(&mut self, select: fn(&mut Self) -> &mut PassPipeline) -> anyhow::Result<bool> {
        let pipeline = std::mem::take(select(self));
        let result = pipeline.execute(self);
        *select(self) = pipeline;
        result
    }

    /// Pre-actions, optimizations, post-actions, then the per-node walk.
    pub fn prepare(&mut self) -> anyhow::Result<()> {
        if self.tree_state != TreeState::Prepare {
            return Err(self.invalid_state("Prepare", "Prepare"));
        }
        self.run_passes(|t| &mut t.pre_actions)?;
        if self.run_passes(|t| &mut t.optimizations)? {
            debug!("Optimization passes modified the tree");
        }
        self.run_passes(|t| &mut t.post_actions)?;

        let root = self
            .root
            .ok_or_else(|| RuntimeError::unexpected("Tree has no root to prepare"))?;
        self.prepare_node(root)?;
        self.tree_state = TreeState::Ready;
        info!("Execution tree {} prepared with {} operators", self.tree_id, self.ops.len());
        Ok(())
    }

    fn prepare_node(&mut self, id: NodeId) -> anyhow::Result<()> {
        let op = self.ops[id].clone();
        op.prepare_node_pre_action(self)?;

        let flags = op.prepare_flags();
        self.prepare_flags.set(flags);
        for child in self.children[id].clone() {
            self.prepare_node(child)?;
        }
        self.prepare_flags.clear(flags);

        op.prepare_node_post_action(self)
    }

    pub fn prepare_flags(&self) -> PrepareFlags {
        self.prepare_flags
    }

    pub fn add_to_repeat_stack(&mut self, id: NodeId) {
        self.repeat_stack.push(id);
    }

    pub fn pop_from_repeat_stack(&mut self) -> Option<NodeId> {
        self.repeat_stack.pop()
    }

    /// Post-order walk from the root, root last.
    pub fn iter(&self) -> TreeIter<'_> {
        let mut order = Vec::with_capacity(self.ops.len());
        if let Some(root) = self.root {
            self.post_order(root, &mut order);
        }
        TreeIter { tree: self, order, pos: 0 }
    }

    fn post_order(&self, id: NodeId, order: &mut Vec<NodeId>) {
        for &child in &self.children[id] {
            self.post_order(child, order);
        }
        order.push(id);
    }

    /// Starts one task per non-inlined operator. Does not wait for them.
    pub fn launch(&mut self) -> anyhow::Result<()> {
        if self.tree_state != TreeState::Ready {
            return Err(self.invalid_state("Launch", "Ready"));
        }
        debug!("Printing the tree before launch tasks:\n{}", self);

        let stop = self.tasks.stop_token();
        let connectors = self
            .ops
            .iter()
            .map(|op| {
                (!op.inlined()).then(|| {
                    Arc::new(Connector::new(op.num_producers(), op.core().connector_capacity(), stop.clone()))
                })
            })
            .collect();
        let topology = Arc::new(Topology {
            ops: self.ops.clone(),
            children: self.children.clone(),
            connectors,
        });

        let order: Vec<NodeId> = self.iter().map(|(id, _)| id).collect();
        for id in order {
            let op = self.ops[id].clone();
            op.core().set_state(OpState::Running);
            if op.inlined() {
                continue;
            }
            let ctx = OpContext::new(topology.clone(), self.tasks.clone(), id);
            self.tasks.create_async_task(format!("Op launched, OperatorId:{}", id), move || {
                let result = op.run(&ctx);
                op.core().set_state(OpState::Finished);
                result
            })?;
        }
        self.topology = Some(topology);
        self.tree_state = TreeState::Executing;
        Ok(())
    }

    /// Spawns `num_workers` tasks running `f(worker_id)` in the tree's task group.
    pub fn launch_workers(&self, num_workers: usize, f: WorkerFn) -> anyhow::Result<()> {
        self.tasks.launch_workers(&format!("tree-{}", self.tree_id), num_workers, f)
    }

    fn root_context(&self) -> anyhow::Result<OpContext> {
        if self.tree_state != TreeState::Executing {
            return Err(self.invalid_state("GetNextBuffer", "Executing"));
        }
        let topology = self
            .topology
            .clone()
            .ok_or_else(|| RuntimeError::unexpected("Executing tree without topology"))?;
        let root = self
            .root
            .ok_or_else(|| RuntimeError::unexpected("Executing tree without root"))?;
        Ok(OpContext::new(topology, self.tasks.clone(), root))
    }

    /// Pulls the next buffer out of the root on the caller's thread.
    pub fn next_buffer(&self) -> anyhow::Result<DataBuffer> {
        let ctx = self.root_context()?;
        let op = ctx.op().clone();
        op.get_next_buffer(&ctx)
    }

    /// Waits for every task and reports the first failure.
    pub fn join(&self) -> anyhow::Result<()> {
        self.tasks.join_all()
    }

    fn print_node(
        &self,
        f: &mut fmt::Formatter<'_>,
        id: NodeId,
        indent: &str,
        last: bool,
        detailed: bool,
    ) -> fmt::Result {
        let op = &self.ops[id];
        let mut indent = indent.to_string();
        if detailed {
            op.print(&mut *f, true)?;
        } else {
            write!(f, "{}+- ", indent)?;
            op.print(&mut *f, false)?;
            writeln!(f)?;
            indent.push_str(if last { "    " } else { "|   " });
        }
        let children = &self.children[id];
        for (i, &child) in children.iter().enumerate() {
            self.print_node(f, child, &indent, i + 1 == children.len(), detailed)?;
        }
        Ok(())
    }
}

impl Default for ExecutionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Execution tree summary:")?;
        writeln!(f, "-----------------------")?;
        if let Some(root) = self.root {
            self.print_node(f, root, "", true, false)?;
        }
        writeln!(f, "\nExecution tree operator details:")?;
        writeln!(f, "--------------------------------")?;
        if let Some(root) = self.root {
            self.print_node(f, root, "", true, true)?;
        }
        Ok(())
    }
}

impl Drop for ExecutionTree {
    fn drop(&mut self) {
        self.tasks.service_stop();
        if let Err(e) = self.tasks.join_all() {
            warn!("Execution tree {} stopped with error: {:#}", self.tree_id, e);
        }
    }
}

pub struct TreeIter<'a> {
    tree: &'a ExecutionTree,
    order: Vec<NodeId>,
    pos: usize,
}

impl<'a> Iterator for TreeIter<'a> {
    type Item = (NodeId, &'a OpRef);

    fn next(&mut self) -> Option<Self::Item> {
        let id = *self.order.get(self.pos)?;
        self.pos += 1;
        Some((id, &self.tree.ops[id]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::dataset_op::{DatasetOp, OpCore};
    use std::sync::Mutex;

    struct Probe {
        core: OpCore,
        flags: PrepareFlags,
        seen_flags: Mutex<Vec<PrepareFlags>>,
        fail_pre: bool,
    }

    impl Probe {
        fn new(name: &str, capacity: usize) -> Arc<Self> {
            Arc::new(Self {
                core: OpCore::new(name, 1, capacity),
                flags: PrepareFlags::NONE,
                seen_flags: Mutex::new(Vec::new()),
                fail_pre: false,
            })
        }

        fn with_flags(name: &str, flags: PrepareFlags) -> Arc<Self> {
            Arc::new(Self {
                core: OpCore::new(name, 1, 0),
                flags,
                seen_flags: Mutex::new(Vec::new()),
                fail_pre: false,
            })
        }
    }

    impl DatasetOp for Probe {
        fn core(&self) -> &OpCore {
            &self.core
        }

        fn prepare_flags(&self) -> PrepareFlags {
            self.flags
        }

        fn prepare_node_pre_action(&self, tree: &mut ExecutionTree) -> anyhow::Result<()> {
            if self.fail_pre {
                anyhow::bail!("pre-action of {} failed", self.name());
            }
            self.seen_flags.lock().unwrap().push(tree.prepare_flags());
            Ok(())
        }

        fn run(&self, ctx: &OpContext) -> anyhow::Result<()> {
            ctx.push(0, DataBuffer::eof())
        }
    }

    #[test]
    fn associate_assigns_sequential_ids() {
        let mut tree = ExecutionTree::new();
        let a: OpRef = Probe::new("a", 0);
        let b: OpRef = Probe::new("b", 0);
        assert_eq!(tree.associate_node(a.clone()).unwrap(), 0);
        assert_eq!(tree.associate_node(b.clone()).unwrap(), 1);
        assert_eq!(tree.tree_state(), TreeState::Building);
        assert_eq!(a.id(), Some(0));
        assert_eq!(b.id(), Some(1));

        let err = tree.associate_node(a).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::AlreadyAssociated { id: 0, .. })
        ));
        assert_eq!(tree.id_count(), 2);
    }

    #[test]
    fn associate_after_building_is_rejected_without_mutation() {
        let mut tree = tree_with_root();
        let late: OpRef = Probe::new("late", 0);
        let err = tree.associate_node(late.clone()).unwrap_err();
        match err.downcast_ref::<RuntimeError>() {
            Some(RuntimeError::InvalidTreeState { current, .. }) => assert_eq!(*current, TreeState::Prepare),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(tree.id_count(), 1);
        assert_eq!(late.id(), None);
    }

    fn tree_with_root() -> ExecutionTree {
        let mut tree = ExecutionTree::new();
        let root: OpRef = Probe::new("root", 0);
        tree.associate_node(root.clone()).unwrap();
        tree.assign_root(root).unwrap();
        tree
    }

    #[test]
    fn assign_root_registers_unassociated_node_once() {
        let mut tree = ExecutionTree::new();
        let leaf: OpRef = Probe::new("leaf", 0);
        tree.associate_node(leaf).unwrap();
        let root: OpRef = Probe::new("root", 0);
        assert_eq!(root.id(), None);
        let id = tree.assign_root(root.clone()).unwrap();
        assert_eq!(root.id(), Some(id));
        assert_eq!(tree.tree_state(), TreeState::Prepare);

        let other: OpRef = Probe::new("other", 0);
        assert!(tree.assign_root(other).is_err());
        assert_eq!(tree.root(), Some(id));
    }

    #[test]
    fn assign_root_in_init_is_rejected() {
        let mut tree = ExecutionTree::new();
        let root: OpRef = Probe::new("root", 0);
        assert!(tree.assign_root(root.clone()).is_err());
        assert_eq!(root.id(), None);
        assert_eq!(tree.tree_state(), TreeState::Init);
    }

    #[test]
    fn nodes_of_other_trees_cannot_be_linked() {
        let mut first = ExecutionTree::new();
        let mut second = ExecutionTree::new();
        let a: OpRef = Probe::new("a", 0);
        let b: OpRef = Probe::new("b", 0);
        first.associate_node(a.clone()).unwrap();
        second.associate_node(b.clone()).unwrap();
        let err = first.add_child(&a, &b).unwrap_err();
        assert!(matches!(err.downcast_ref::<RuntimeError>(), Some(RuntimeError::ForeignNode(_))));
        assert!(first.children(0).is_empty());
        assert!(second.associate_node(a).is_err());
    }

    #[test]
    fn iteration_is_post_order_and_empty_without_root() {
        let mut tree = ExecutionTree::new();
        assert_eq!(tree.iter().count(), 0);
        let root: OpRef = Probe::new("root", 0);
        let left: OpRef = Probe::new("left", 0);
        let right: OpRef = Probe::new("right", 0);
        let leaf: OpRef = Probe::new("leaf", 0);
        for op in [&root, &left, &right, &leaf] {
            tree.associate_node((*op).clone()).unwrap();
        }
        tree.add_child(&root, &left).unwrap();
        tree.add_child(&root, &right).unwrap();
        tree.add_child(&left, &leaf).unwrap();
        assert_eq!(tree.iter().count(), 0);
        tree.assign_root(root).unwrap();
        let names: Vec<&str> = tree.iter().map(|(_, op)| op.name()).collect();
        assert_eq!(names, vec!["leaf", "left", "right", "root"]);
    }

    #[test]
    fn prepare_flags_are_scoped_to_the_subtree() {
        let mut tree = ExecutionTree::new();
        let root = Probe::new("root", 0);
        let repeat = Probe::with_flags("repeat", PrepareFlags::REPEAT);
        let below = Probe::new("below", 0);
        let sibling = Probe::new("sibling", 0);
        let (root_ref, repeat_ref, below_ref, sibling_ref): (OpRef, OpRef, OpRef, OpRef) =
            (root.clone(), repeat.clone(), below.clone(), sibling.clone());
        for op in [&root_ref, &repeat_ref, &below_ref, &sibling_ref] {
            tree.associate_node(op.clone()).unwrap();
        }
        tree.add_child(&root_ref, &repeat_ref).unwrap();
        tree.add_child(&repeat_ref, &below_ref).unwrap();
        tree.add_child(&root_ref, &sibling_ref).unwrap();
        tree.assign_root(root_ref).unwrap();
        tree.prepare().unwrap();

        assert_eq!(tree.tree_state(), TreeState::Ready);
        assert_eq!(*repeat.seen_flags.lock().unwrap(), vec![PrepareFlags::NONE]);
        assert_eq!(*below.seen_flags.lock().unwrap(), vec![PrepareFlags::REPEAT]);
        assert_eq!(*sibling.seen_flags.lock().unwrap(), vec![PrepareFlags::NONE]);
        assert_eq!(tree.prepare_flags(), PrepareFlags::NONE);
    }

    #[test]
    fn failing_node_aborts_prepare() {
        let mut tree = ExecutionTree::new();
        let root = Probe::new("root", 0);
        let broken = Arc::new(Probe {
            core: OpCore::new("broken", 1, 0),
            flags: PrepareFlags::NONE,
            seen_flags: Mutex::new(Vec::new()),
            fail_pre: true,
        });
        let sibling = Probe::new("sibling", 0);
        let (root_ref, broken_ref, sibling_ref): (OpRef, OpRef, OpRef) =
            (root.clone(), broken.clone(), sibling.clone());
        for op in [&root_ref, &broken_ref, &sibling_ref] {
            tree.associate_node(op.clone()).unwrap();
        }
        tree.add_child(&root_ref, &broken_ref).unwrap();
        tree.add_child(&root_ref, &sibling_ref).unwrap();
        tree.assign_root(root_ref).unwrap();

        assert!(tree.prepare().is_err());
        assert!(sibling.seen_flags.lock().unwrap().is_empty());
        assert_eq!(tree.tree_state(), TreeState::Prepare);
    }

    #[test]
    fn repeat_stack_is_lifo() {
        let mut tree = ExecutionTree::new();
        tree.add_to_repeat_stack(3);
        tree.add_to_repeat_stack(1);
        tree.add_to_repeat_stack(3);
        assert_eq!(tree.pop_from_repeat_stack(), Some(3));
        assert_eq!(tree.pop_from_repeat_stack(), Some(1));
        assert_eq!(tree.pop_from_repeat_stack(), Some(3));
        assert_eq!(tree.pop_from_repeat_stack(), None);
    }

    #[test]
    fn launch_requires_ready_and_spawns_one_task_per_non_inlined_op() {
        let mut tree = ExecutionTree::new();
        let root: OpRef = Probe::new("root", 0);
        let leaf: OpRef = Probe::new("leaf", 4);
        tree.associate_node(root.clone()).unwrap();
        tree.associate_node(leaf.clone()).unwrap();
        tree.add_child(&root, &leaf).unwrap();
        tree.assign_root(root.clone()).unwrap();

        assert!(tree.launch().is_err());
        assert_eq!(tree.task_group().num_tasks(), 0);

        tree.prepare().unwrap();
        tree.launch().unwrap();
        assert_eq!(tree.tree_state(), TreeState::Executing);
        assert_eq!(tree.task_group().num_tasks(), 1);
        assert_eq!(root.state(), OpState::Running);

        let ctx = tree.root_context().unwrap();
        assert!(ctx.child_next_buffer(0).unwrap().is_eof());
        tree.join().unwrap();
        assert_eq!(leaf.state(), OpState::Finished);
    }

    #[test]
    fn print_shows_summary_and_details() {
        let mut tree = ExecutionTree::new();
        let root: OpRef = Probe::new("root", 0);
        let a: OpRef = Probe::new("a", 0);
        let b: OpRef = Probe::new("b", 0);
        for op in [&root, &a, &b] {
            tree.associate_node(op.clone()).unwrap();
        }
        tree.add_child(&root, &a).unwrap();
        tree.add_child(&root, &b).unwrap();
        tree.assign_root(root).unwrap();
        let text = tree.to_string();
        assert!(text.contains("+- (  0) <root>"));
        assert!(text.contains("    +- (  1) <a>"));
        assert!(text.contains("    +- (  2) <b>"));
        assert!(text.contains("Execution tree operator details:"));
        assert!(text.contains("Operator 'b' (id 2)"));
    }
}
