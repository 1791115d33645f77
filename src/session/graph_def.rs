use anyhow::{Context, anyhow, bail};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::core::{DataType, Shape, Tensor};
use crate::kernel::{KernelBuildInfo, KernelRegistry};
use crate::session::kernel_graph::{AttrValue, ConstValue, KernelGraph, NodeAttrs};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ParameterDef {
    pub name: String,
    pub shape: Shape,
    #[serde(default)]
    pub dtype: DataType,
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

/// Constant: either f32 values with a shape or a raw string.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConstantDef {
    pub name: String,
    #[serde(default)]
    pub shape: Option<Shape>,
    #[serde(default)]
    pub values: Option<Vec<f32>>,
    #[serde(default)]
    pub string: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelDef {
    pub name: String,
    pub op: String,
    /// `"node"` or `"node:output_index"`
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub output_sizes: Option<Vec<usize>>,
    #[serde(default)]
    pub communication: bool,
    #[serde(default)]
    pub attrs: HashMap<String, serde_json::Value>,
    /// Target of an atomic clean kernel
    #[serde(default)]
    pub clean: Option<String>,
    /// `(output_index, input_index)` alias pairs
    #[serde(default)]
    pub refs: Vec<(usize, usize)>,
}

/// JSON description of a kernel graph.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GraphDef {
    #[serde(default)]
    pub graph_id: u32,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
    #[serde(default)]
    pub constants: Vec<ConstantDef>,
    #[serde(default)]
    pub kernels: Vec<KernelDef>,
    pub outputs: Vec<String>,
}

fn parse_ref(reference: &str) -> anyhow::Result<(&str, usize)> {
    match reference.rsplit_once(':') {
        Some((name, index)) => {
            let index = index
                .parse()
                .with_context(|| format!("Bad output index in '{}'", reference))?;
            Ok((name, index))
        }
        None => Ok((reference, 0)),
    }
}

fn to_attr(name: &str, value: &serde_json::Value) -> anyhow::Result<AttrValue> {
    use serde_json::Value;
    Ok(match value {
        Value::Bool(b) => AttrValue::Bool(*b),
        Value::Number(n) if n.is_i64() => AttrValue::Int(n.as_i64().unwrap_or_default()),
        Value::Number(n) => AttrValue::Float(n.as_f64().unwrap_or_default()),
        Value::String(s) => AttrValue::Str(s.clone()),
        Value::Array(items) => AttrValue::IntList(
            items
                .iter()
                .map(|v| v.as_i64().ok_or_else(|| anyhow!("Attribute '{}' must be a list of integers", name)))
                .collect::<anyhow::Result<_>>()?,
        ),
        other => bail!("Unsupported value for attribute '{}': {}", name, other),
    })
}

impl GraphDef {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read graph {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Failed to parse graph {}", path.display()))
    }

    /// Kernel defs in an order where producers come first.
    fn kernel_build_order(&self) -> anyhow::Result<Vec<usize>> {
        let by_name: HashMap<&str, usize> = self.kernels.iter().enumerate().map(|(i, k)| (k.name.as_str(), i)).collect();
        let mut deps: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..self.kernels.len()).map(|i| deps.add_node(i)).collect();

        for (i, kernel) in self.kernels.iter().enumerate() {
            for input in &kernel.inputs {
                let (name, _) = parse_ref(input)?;
                if let Some(&producer) = by_name.get(name) {
                    deps.add_edge(nodes[producer], nodes[i], ());
                }
            }
            // Чистка строится после своей цели, а выполняется перед ней
            if let Some(target) = &kernel.clean {
                let &t = by_name
                    .get(target.as_str())
                    .ok_or_else(|| anyhow!("Clean kernel '{}' targets unknown kernel '{}'", kernel.name, target))?;
                deps.add_edge(nodes[t], nodes[i], ());
            }
        }

        let sorted = toposort(&deps, None).map_err(|_| anyhow!("Cycle between kernel definitions"))?;
        Ok(sorted.into_iter().map(|n| deps[n]).collect())
    }

    pub fn build(&self, registry: &KernelRegistry) -> anyhow::Result<KernelGraph> {
        let mut graph = KernelGraph::new(self.graph_id);

        // 1. Входы и константы
        for p in &self.parameters {
            let idx = graph.add_parameter(&p.name, p.shape.clone(), p.dtype)?;
            if !p.valid {
                graph.set_input_valid(idx, false)?;
            }
        }
        for c in &self.constants {
            let value = match (&c.values, &c.string) {
                (Some(values), None) => {
                    let shape = c.shape.clone().unwrap_or_else(|| Shape::new(vec![values.len()]));
                    ConstValue::Tensor(Tensor::from_f32(shape, values)?)
                }
                (None, Some(s)) => ConstValue::Str(s.clone()),
                _ => bail!("Constant '{}' needs exactly one of 'values' or 'string'", c.name),
            };
            graph.add_value_node(&c.name, value)?;
        }

        // 2. Ядра в порядке зависимостей
        for i in self.kernel_build_order()? {
            let def = &self.kernels[i];
            let mut inputs = Vec::with_capacity(def.inputs.len());
            for input in &def.inputs {
                let (name, index) = parse_ref(input)?;
                let producer = graph
                    .find_node(name)
                    .ok_or_else(|| anyhow!("Kernel '{}' references unknown node '{}'", def.name, name))?;
                inputs.push((producer, index));
            }

            let mut attrs = NodeAttrs::default();
            for (name, value) in &def.attrs {
                attrs.set(name.clone(), to_attr(name, value)?);
            }
            let info = KernelBuildInfo {
                input_sizes: inputs
                    .iter()
                    .map(|&(n, idx)| graph.count_node_device_memory_size(n, idx))
                    .collect::<anyhow::Result<_>>()?,
                output_sizes: def.output_sizes.clone(),
                attrs: attrs.clone(),
            };
            let kernel_mod = registry
                .create(&def.op, &info)
                .with_context(|| format!("Kernel '{}'", def.name))?;

            let idx = match &def.clean {
                Some(target) => {
                    let target = graph
                        .find_node(target)
                        .ok_or_else(|| anyhow!("Unknown clean target '{}'", target))?;
                    graph.add_atomic_clean(&def.name, kernel_mod, target)?
                }
                None => graph.add_kernel(&def.name, &def.op, kernel_mod, &inputs)?,
            };
            graph.kernel_mut(idx)?.attrs = attrs;
            graph.set_communication(idx, def.communication)?;
            for &(output_index, input_index) in &def.refs {
                graph.add_ref_output(idx, output_index, input_index)?;
            }
        }

        // 3. Выходы и порядок исполнения
        let mut outputs = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            let (name, index) = parse_ref(output)?;
            let node = graph
                .find_node(name)
                .ok_or_else(|| anyhow!("Graph output references unknown node '{}'", name))?;
            outputs.push((node, index));
        }
        graph.set_outputs(outputs)?;
        graph.build_execution_order()?;
        Ok(graph)
    }
}
