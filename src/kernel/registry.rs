use anyhow::{anyhow, ensure};
use std::collections::HashMap;

use crate::kernel::KernelMod;
use crate::kernel::builtin::{
    AllReduceKernel, AssignAddKernel, AtomicAddrCleanKernel, BinaryKernel, BinaryOp, ReduceSumKernel,
};
use crate::session::NodeAttrs;

/// What a factory knows about the node it builds a kernel for.
#[derive(Debug, Clone, Default)]
pub struct KernelBuildInfo {
    /// Byte sizes of the producer outputs feeding the node
    pub input_sizes: Vec<usize>,
    /// Explicit output sizes, overriding what the factory would infer
    pub output_sizes: Option<Vec<usize>>,
    pub attrs: NodeAttrs,
}

pub type KernelFactory = fn(&KernelBuildInfo) -> anyhow::Result<Box<dyn KernelMod>>;

/// Op type name to kernel factory. Built once at startup and passed
/// to whoever builds graphs.
#[derive(Default)]
pub struct KernelRegistry {
    factories: HashMap<String, KernelFactory>,
}

fn single_output(info: &KernelBuildInfo, inferred: usize) -> usize {
    info.output_sizes
        .as_ref()
        .and_then(|s| s.first().copied())
        .unwrap_or(inferred)
}

fn binary(info: &KernelBuildInfo, op: BinaryOp) -> anyhow::Result<Box<dyn KernelMod>> {
    ensure!(info.input_sizes.len() == 2, "{:?} takes 2 inputs, got {}", op, info.input_sizes.len());
    let inferred = info.input_sizes.iter().copied().max().unwrap_or(0);
    Ok(Box::new(BinaryKernel::new(op, single_output(info, inferred))))
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_kernels() -> Self {
        let mut registry = Self::new();
        registry.register("Add", |info| binary(info, BinaryOp::Add));
        registry.register("Sub", |info| binary(info, BinaryOp::Sub));
        registry.register("Mul", |info| binary(info, BinaryOp::Mul));
        registry.register("AssignAdd", |info| {
            ensure!(info.input_sizes.len() == 2, "AssignAdd takes 2 inputs");
            Ok(Box::new(AssignAddKernel::new(info.input_sizes[0])))
        });
        registry.register("ReduceSum", |info| {
            ensure!(info.input_sizes.len() == 1, "ReduceSum takes 1 input");
            Ok(Box::new(ReduceSumKernel::default()))
        });
        registry.register("AllReduce", |info| {
            ensure!(!info.input_sizes.is_empty(), "AllReduce needs at least one input");
            Ok(Box::new(AllReduceKernel::new(info.input_sizes.clone())))
        });
        registry.register("AtomicAddrClean", |_| Ok(Box::new(AtomicAddrCleanKernel)));
        registry
    }

    pub fn register(&mut self, op_type: &str, factory: KernelFactory) {
        self.factories.insert(op_type.to_string(), factory);
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.factories.contains_key(op_type)
    }

    pub fn create(&self, op_type: &str, info: &KernelBuildInfo) -> anyhow::Result<Box<dyn KernelMod>> {
        let factory = self
            .factories
            .get(op_type)
            .ok_or_else(|| anyhow!("No kernel registered for op type '{}'", op_type))?;
        factory(info).map_err(|e| e.context(format!("Failed to build '{}' kernel", op_type)))
    }
}
