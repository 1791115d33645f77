use anyhow::{anyhow, bail, ensure};

use crate::device::sim_device::Stream;
use crate::kernel::{Address, KernelMod};

const F32_SIZE: usize = std::mem::size_of::<f32>();

fn read_f32(stream: &Stream, arg: &Address) -> anyhow::Result<Vec<f32>> {
    stream.device().read_f32(arg.addr, arg.size)
}

fn arg<'a>(list: &'a [Address], index: usize, what: &str) -> anyhow::Result<&'a Address> {
    list.get(index).ok_or_else(|| anyhow!("Missing {} {}", what, index))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
        }
    }
}

/// Element-wise binary op over f32, a one-element operand broadcasts.
pub struct BinaryKernel {
    op: BinaryOp,
    output_sizes: Vec<usize>,
}

impl BinaryKernel {
    pub fn new(op: BinaryOp, output_size: usize) -> Self {
        Self { op, output_sizes: vec![output_size] }
    }
}

fn broadcast(op: BinaryOp, lhs: &[f32], rhs: &[f32]) -> anyhow::Result<Vec<f32>> {
    match (lhs.len(), rhs.len()) {
        (l, r) if l == r => Ok(lhs.iter().zip(rhs).map(|(&a, &b)| op.apply(a, b)).collect()),
        (_, 1) => Ok(lhs.iter().map(|&a| op.apply(a, rhs[0])).collect()),
        (1, _) => Ok(rhs.iter().map(|&b| op.apply(lhs[0], b)).collect()),
        (l, r) => bail!("{:?}: operand lengths {} and {} do not broadcast", op, l, r),
    }
}

impl KernelMod for BinaryKernel {
    fn output_size_list(&self) -> &[usize] {
        &self.output_sizes
    }

    fn launch(&self, inputs: &[Address], _: &[Address], outputs: &[Address], stream: &Stream) -> anyhow::Result<()> {
        let lhs = read_f32(stream, arg(inputs, 0, "input")?)?;
        let rhs = read_f32(stream, arg(inputs, 1, "input")?)?;
        let out = arg(outputs, 0, "output")?;
        let result = broadcast(self.op, &lhs, &rhs)?;
        ensure!(
            result.len() * F32_SIZE <= out.size,
            "{:?}: result of {} elements does not fit output of {} bytes",
            self.op,
            result.len(),
            out.size
        );
        stream.record_launch();
        stream.device().write_f32(out.addr, &result)
    }
}

/// `ref += value`; output 0 is declared as a ref of input 0.
pub struct AssignAddKernel {
    output_sizes: Vec<usize>,
}

impl AssignAddKernel {
    pub fn new(size: usize) -> Self {
        Self { output_sizes: vec![size] }
    }
}

impl KernelMod for AssignAddKernel {
    fn output_size_list(&self) -> &[usize] {
        &self.output_sizes
    }

    fn launch(&self, inputs: &[Address], _: &[Address], outputs: &[Address], stream: &Stream) -> anyhow::Result<()> {
        let target = arg(inputs, 0, "input")?;
        let value = read_f32(stream, arg(inputs, 1, "input")?)?;
        let current = read_f32(stream, target)?;
        let result = broadcast(BinaryOp::Add, &current, &value)?;
        stream.record_launch();
        stream.device().write_f32(target.addr, &result)?;
        let out = arg(outputs, 0, "output")?;
        if out.addr != target.addr {
            stream.device().write_f32(out.addr, &result)?;
        }
        Ok(())
    }
}

/// Sum of all elements. The workspace holds the running total.
pub struct ReduceSumKernel {
    output_sizes: Vec<usize>,
    workspace_sizes: Vec<usize>,
}

impl Default for ReduceSumKernel {
    fn default() -> Self {
        Self {
            output_sizes: vec![F32_SIZE],
            workspace_sizes: vec![F32_SIZE],
        }
    }
}

impl KernelMod for ReduceSumKernel {
    fn output_size_list(&self) -> &[usize] {
        &self.output_sizes
    }

    fn workspace_size_list(&self) -> &[usize] {
        &self.workspace_sizes
    }

    fn launch(&self, inputs: &[Address], workspaces: &[Address], outputs: &[Address], stream: &Stream) -> anyhow::Result<()> {
        let values = read_f32(stream, arg(inputs, 0, "input")?)?;
        let scratch = arg(workspaces, 0, "workspace")?;
        let device = stream.device();
        device.write_f32(scratch.addr, &[0.0])?;
        for v in values {
            let acc = device.read_f32(scratch.addr, F32_SIZE)?;
            device.write_f32(scratch.addr, &[acc[0] + v])?;
        }
        stream.record_launch();
        let total = device.read(scratch.addr, F32_SIZE)?;
        device.write(arg(outputs, 0, "output")?.addr, &total)
    }
}

/// Collective sum over one device: every input is copied to its output.
pub struct AllReduceKernel {
    output_sizes: Vec<usize>,
}

impl AllReduceKernel {
    pub fn new(input_sizes: Vec<usize>) -> Self {
        Self { output_sizes: input_sizes }
    }
}

impl KernelMod for AllReduceKernel {
    fn output_size_list(&self) -> &[usize] {
        &self.output_sizes
    }

    fn launch(&self, inputs: &[Address], _: &[Address], outputs: &[Address], stream: &Stream) -> anyhow::Result<()> {
        ensure!(
            inputs.len() == outputs.len(),
            "AllReduce has {} inputs but {} outputs",
            inputs.len(),
            outputs.len()
        );
        stream.record_launch();
        for (input, output) in inputs.iter().zip(outputs) {
            let data = stream.device().read(input.addr, input.size.min(output.size))?;
            stream.device().write(output.addr, &data)?;
        }
        Ok(())
    }
}

/// Zeroes every buffer passed as input.
#[derive(Default)]
pub struct AtomicAddrCleanKernel;

impl KernelMod for AtomicAddrCleanKernel {
    fn output_size_list(&self) -> &[usize] {
        &[]
    }

    fn launch(&self, inputs: &[Address], _: &[Address], _: &[Address], stream: &Stream) -> anyhow::Result<()> {
        stream.record_launch();
        for input in inputs {
            stream.device().fill(input.addr, input.size, 0)?;
        }
        Ok(())
    }
}
