use log::info;
use std::env;
use std::sync::Arc;

use sion_exec_rt::core::{Shape, Tensor};
use sion_exec_rt::dataset::ops::{GeneratorOp, MapOp, RepeatOp};
use sion_exec_rt::dataset::sampler::SequentialSampler;
use sion_exec_rt::dataset::{ExecutionTree, OpRef, TensorRow};
use sion_exec_rt::device::KernelRuntime;
use sion_exec_rt::kernel::KernelRegistry;
use sion_exec_rt::session::GraphDef;
use sion_exec_rt::RuntimeConfig;

fn run_graph(config: &RuntimeConfig) -> anyhow::Result<()> {
    let asset_path = "assets/example_graph.json";
    println!("1. Загрузка графа из {}...", asset_path);
    let registry = KernelRegistry::with_builtin_kernels();
    let mut graph = GraphDef::from_file(asset_path)?.build(&registry)?;

    println!("2. Граф построен: {} ядер. Распределение памяти...", graph.execution_order().len());
    let mut runtime = KernelRuntime::new(config.clone())?;
    runtime.assign_memory(&mut graph)?;
    info!(
        "Static memory {} bytes, dynamic memory {} bytes",
        runtime.mem_manager().static_mem_size(),
        runtime.mem_manager().dynamic_mem_size()
    );

    let shape = Shape::new(vec![4]);
    let inputs = vec![
        Tensor::from_f32(shape.clone(), &[1.0, 2.0, 3.0, 4.0])?,
        Tensor::from_f32(shape, &[10.0, 20.0, 30.0, 40.0])?,
    ];
    runtime.load_input_data(&graph, &inputs)?;

    println!("3. Запуск...");
    runtime.run(&graph)?;

    for &(node, index) in graph.outputs() {
        let output = runtime.read_output(&graph, node, index)?;
        println!("   {}:{} = {:?}", graph.node_name(node), index, output.to_f32_vec()?);
    }
    runtime.clear_graph_runtime_resource(&mut graph)?;
    Ok(())
}

fn run_dataset(config: &RuntimeConfig) -> anyhow::Result<()> {
    println!("4. Конвейер данных: generator -> map -> repeat");
    let rows = (0..10).map(|i| vec![Tensor::scalar_i64(i)]).collect();
    let generator: OpRef = Arc::new(GeneratorOp::new(
        rows,
        Box::new(SequentialSampler::new(0, 0)),
        config.rows_per_buffer.min(4),
        config.connector_capacity,
    ));
    let map: OpRef = Arc::new(MapOp::new(
        2,
        config.connector_capacity,
        Arc::new(|row: TensorRow| -> anyhow::Result<TensorRow> {
            row.into_iter()
                .map(|t| Ok(Tensor::scalar_i64(t.item_i64(0)? * 10)))
                .collect()
        }),
    ));
    let repeat: OpRef = Arc::new(RepeatOp::new(2)?);

    let mut tree = ExecutionTree::new();
    for op in [&repeat, &map, &generator] {
        tree.associate_node((*op).clone())?;
    }
    tree.add_child(&repeat, &map)?;
    tree.add_child(&map, &generator)?;
    tree.assign_root(repeat)?;
    tree.prepare()?;
    tree.launch()?;
    print!("{}", tree);

    loop {
        let buffer = tree.next_buffer()?;
        if buffer.is_eof() {
            break;
        }
        if buffer.is_eoe() {
            println!("   <end of epoch>");
            continue;
        }
        let values = buffer
            .rows()
            .iter()
            .map(|row| row[0].item_i64(0))
            .collect::<anyhow::Result<Vec<_>>>()?;
        println!("   buffer {}: {:?}", buffer.id(), values);
    }
    tree.join()
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match env::args().nth(1) {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };

    run_graph(&config)?;
    run_dataset(&config)?;
    println!("Готово.");
    Ok(())
}
