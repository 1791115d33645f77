use log::{debug, info};

use crate::dataset::execution_tree::ExecutionTree;

/// A tree rewrite run during `ExecutionTree::prepare`.
pub trait TreePass: Send {
    fn name(&self) -> &str;
    /// Returns true when the tree was modified.
    fn run(&self, tree: &mut ExecutionTree) -> anyhow::Result<bool>;
}

#[derive(Default)]
pub struct PassPipeline {
    passes: Vec<Box<dyn TreePass>>,
}

impl PassPipeline {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn add_pass<P: TreePass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    pub fn with_pass<P: TreePass + 'static>(mut self, pass: P) -> Self {
        self.add_pass(pass);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn execute(&self, tree: &mut ExecutionTree) -> anyhow::Result<bool> {
        let mut modified = false;
        for pass in &self.passes {
            debug!("[Pass: {}]", pass.name());
            modified |= pass.run(tree)?;
        }
        Ok(modified)
    }
}

/// Dumps the tree to the log, never modifies it.
pub struct PrinterPass;

impl TreePass for PrinterPass {
    fn name(&self) -> &str {
        "PrinterPass"
    }

    fn run(&self, tree: &mut ExecutionTree) -> anyhow::Result<bool> {
        info!("Execution tree:\n{}", tree);
        Ok(false)
    }
}
