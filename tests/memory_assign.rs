use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sion_exec_rt::RuntimeConfig;
use sion_exec_rt::RuntimeError;
use sion_exec_rt::core::{DataType, Format, Shape, Tensor};
use sion_exec_rt::device::{DeviceAddress, KernelRuntime, MemFlag, Stream};
use sion_exec_rt::kernel::builtin::{AtomicAddrCleanKernel, BinaryKernel, BinaryOp};
use sion_exec_rt::kernel::{Address, KernelMod, KernelRegistry};
use sion_exec_rt::session::kernel_graph::ATTR_ATOMIC_OUTPUT_INDEXS;
use sion_exec_rt::session::{AttrValue, GraphDef, KernelGraph};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_config() -> RuntimeConfig {
    RuntimeConfig {
        device_mem_size: 64 * 1024,
        mem_pool_size: 16 * 1024,
        ..Default::default()
    }
}

/// Kernel with declared sizes that only counts its launches.
struct FixedKernel {
    outputs: Vec<usize>,
    workspaces: Vec<usize>,
    launches: Arc<AtomicUsize>,
    fail: bool,
}

impl FixedKernel {
    fn boxed(outputs: &[usize]) -> Box<dyn KernelMod> {
        Box::new(FixedKernel {
            outputs: outputs.to_vec(),
            workspaces: Vec::new(),
            launches: Arc::new(AtomicUsize::new(0)),
            fail: false,
        })
    }
}

impl KernelMod for FixedKernel {
    fn output_size_list(&self) -> &[usize] {
        &self.outputs
    }

    fn workspace_size_list(&self) -> &[usize] {
        &self.workspaces
    }

    fn launch(&self, _: &[Address], _: &[Address], _: &[Address], stream: &Stream) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("device rejected the kernel");
        }
        stream.record_launch();
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn error_kind(err: &anyhow::Error) -> Option<&RuntimeError> {
    err.downcast_ref::<RuntimeError>()
}

#[test]
fn communication_inputs_share_one_contiguous_block() {
    init_logger();
    let mut graph = KernelGraph::new(0);
    let p0 = graph.add_kernel("p0", "Fixed", FixedKernel::boxed(&[128]), &[]).unwrap();
    let p1 = graph.add_kernel("p1", "Fixed", FixedKernel::boxed(&[256]), &[]).unwrap();
    let p2 = graph.add_kernel("p2", "Fixed", FixedKernel::boxed(&[128]), &[]).unwrap();
    let comm = graph
        .add_kernel("all_reduce", "AllReduce", FixedKernel::boxed(&[128, 256, 128]), &[(p0, 0), (p1, 0), (p2, 0)])
        .unwrap();
    graph.set_communication(comm, true).unwrap();
    graph.set_outputs(vec![(comm, 0)]).unwrap();
    graph.build_execution_order().unwrap();

    let mut runtime = KernelRuntime::new(small_config()).unwrap();
    runtime.assign_memory(&mut graph).unwrap();

    let base = runtime.mem_manager().base();
    let addr = |n, i| graph.output_addr(n, i).unwrap();
    assert_eq!(addr(p0, 0).ptr(), Some(base));
    assert_eq!(addr(p1, 0).ptr(), Some(base + 128));
    assert_eq!(addr(p2, 0).ptr(), Some(base + 384));
    assert_eq!(addr(p0, 0).size(), 128);
    assert_eq!(addr(p1, 0).size(), 256);
    assert_eq!(addr(p2, 0).size(), 128);

    // outputs follow in a second block of the same layout
    assert_eq!(addr(comm, 0).ptr(), Some(base + 512));
    assert_eq!(addr(comm, 1).ptr(), Some(base + 640));
    assert_eq!(addr(comm, 2).ptr(), Some(base + 896));
    assert_eq!(runtime.mem_manager().dynamic_mem_size(), 1024);
}

#[test]
fn communication_input_from_parameter_is_rejected() {
    let mut graph = KernelGraph::new(0);
    let x = graph.add_parameter("x", Shape::new(vec![8]), DataType::F32).unwrap();
    let comm = graph.add_kernel("all_reduce", "AllReduce", FixedKernel::boxed(&[32]), &[(x, 0)]).unwrap();
    graph.set_communication(comm, true).unwrap();
    graph.build_execution_order().unwrap();

    let mut runtime = KernelRuntime::new(small_config()).unwrap();
    let err = runtime.assign_memory(&mut graph).unwrap_err();
    assert!(matches!(error_kind(&err), Some(RuntimeError::MalformedGraph(_))));
}

#[test]
fn ref_output_aliases_its_input() {
    init_logger();
    let mut graph = KernelGraph::new(0);
    let w = graph.add_parameter("w", Shape::new(vec![4]), DataType::F32).unwrap();
    let grad = graph.add_kernel("grad", "Fixed", FixedKernel::boxed(&[16]), &[]).unwrap();
    let update = graph
        .add_kernel("update", "AssignAdd", FixedKernel::boxed(&[16]), &[(w, 0), (grad, 0)])
        .unwrap();
    let after = graph.add_kernel("after", "Fixed", FixedKernel::boxed(&[16]), &[(grad, 0)]).unwrap();
    let inplace = graph.add_kernel("inplace", "Fixed", FixedKernel::boxed(&[16]), &[(after, 0)]).unwrap();
    graph.add_ref_output(update, 0, 0).unwrap();
    graph.add_ref_output(inplace, 0, 0).unwrap();
    graph.set_outputs(vec![(update, 0), (inplace, 0)]).unwrap();
    graph.build_execution_order().unwrap();

    let mut runtime = KernelRuntime::new(small_config()).unwrap();
    runtime.assign_memory(&mut graph).unwrap();

    let w_addr = graph.output_addr(w, 0).unwrap();
    assert!(Arc::ptr_eq(&graph.output_addr(update, 0).unwrap(), &w_addr));
    assert!(Arc::ptr_eq(
        &graph.output_addr(inplace, 0).unwrap(),
        &graph.output_addr(after, 0).unwrap()
    ));
    assert!(!Arc::ptr_eq(&graph.output_addr(grad, 0).unwrap(), &w_addr));
}

#[test]
fn output_binding_is_idempotent() {
    let mut graph = KernelGraph::new(0);
    let node = graph.add_kernel("k", "Fixed", FixedKernel::boxed(&[64, 32]), &[]).unwrap();
    graph.build_execution_order().unwrap();

    let mut runtime = KernelRuntime::new(small_config()).unwrap();
    let first = runtime.assign_node_output_mem(MemFlag::Dynamic, &mut graph, node, None).unwrap();
    let used = runtime.mem_manager().dynamic_mem_size();
    let before = graph.output_addr(node, 1).unwrap();

    let second = runtime.assign_node_output_mem(MemFlag::Dynamic, &mut graph, node, None).unwrap();
    assert_eq!(first, 2);
    assert_eq!(second, 0);
    assert_eq!(runtime.mem_manager().dynamic_mem_size(), used);
    assert!(Arc::ptr_eq(&before, &graph.output_addr(node, 1).unwrap()));
}

#[test]
fn caller_supplied_input_address_is_kept() {
    let mut graph = KernelGraph::new(0);
    let x = graph.add_parameter("x", Shape::new(vec![4]), DataType::F32).unwrap();
    let y = graph.add_parameter("y", Shape::new(vec![4]), DataType::F32).unwrap();
    graph.set_input_valid(y, false).unwrap();
    graph.build_execution_order().unwrap();

    let mut runtime = KernelRuntime::new(small_config()).unwrap();
    let supplied = DeviceAddress::new(Some(runtime.mem_manager().base() + 4096), 16, Format::Default, DataType::F32);
    graph.set_output_addr(x, 0, supplied.clone());
    runtime.assign_memory(&mut graph).unwrap();

    assert!(Arc::ptr_eq(&graph.output_addr(x, 0).unwrap(), &supplied));
    assert!(graph.output_addr(y, 0).is_none());
    assert_eq!(runtime.mem_manager().static_mem_size(), 0);
}

#[test]
fn string_constants_are_copied_as_raw_bytes() {
    let mut graph = KernelGraph::new(0);
    let tag = graph
        .add_value_node("tag", sion_exec_rt::session::ConstValue::Str("hello".into()))
        .unwrap();
    graph.build_execution_order().unwrap();

    let mut runtime = KernelRuntime::new(small_config()).unwrap();
    runtime.assign_memory(&mut graph).unwrap();
    let addr = graph.output_addr(tag, 0).unwrap();
    assert_eq!(addr.size(), 5);
    assert_eq!(addr.dtype(), DataType::U8);
    assert_eq!(runtime.device().read(addr.ptr().unwrap(), 5).unwrap(), b"hello".to_vec());
}

#[test]
fn reuse_planner_shares_slots_of_dead_buffers() {
    init_logger();
    let mut graph = KernelGraph::new(0);
    let a = graph.add_kernel("a", "Fixed", FixedKernel::boxed(&[64]), &[]).unwrap();
    let b = graph.add_kernel("b", "Fixed", FixedKernel::boxed(&[64]), &[(a, 0)]).unwrap();
    let c = graph.add_kernel("c", "Fixed", FixedKernel::boxed(&[64]), &[(b, 0)]).unwrap();
    let d = graph.add_kernel("d", "Fixed", FixedKernel::boxed(&[64]), &[(c, 0)]).unwrap();
    graph.set_outputs(vec![(d, 0)]).unwrap();
    graph.build_execution_order().unwrap();

    let config = RuntimeConfig { enable_mem_reuse: true, ..small_config() };
    let mut runtime = KernelRuntime::new(config).unwrap();
    runtime.assign_memory(&mut graph).unwrap();

    let ptr = |n| graph.output_addr(n, 0).unwrap().ptr().unwrap();
    assert_ne!(ptr(a), ptr(b));
    assert_ne!(ptr(b), ptr(c));
    assert_eq!(ptr(a), ptr(c));
    // two live slots of 64 bytes
    assert_eq!(runtime.mem_manager().dynamic_mem_size(), 128);
}

#[test]
fn reuse_keeps_cleaned_output_apart_from_live_buffers() {
    init_logger();
    let add = || Box::new(BinaryKernel::new(BinaryOp::Add, 16)) as Box<dyn KernelMod>;
    let mut graph = KernelGraph::new(0);
    let a = graph.add_parameter("a", Shape::new(vec![4]), DataType::F32).unwrap();
    let p = graph.add_kernel("p", "Add", add(), &[(a, 0), (a, 0)]).unwrap();
    let c = graph.add_kernel("c", "Add", add(), &[(p, 0), (p, 0)]).unwrap();
    let t = graph.add_kernel("t", "Add", add(), &[(c, 0), (a, 0)]).unwrap();
    let u = graph.add_kernel("u", "Add", add(), &[(t, 0), (a, 0)]).unwrap();
    graph.set_attr(t, ATTR_ATOMIC_OUTPUT_INDEXS, AttrValue::IntList(vec![0])).unwrap();
    let clean = graph.add_atomic_clean("clean_t", Box::new(AtomicAddrCleanKernel), t).unwrap();
    graph.set_outputs(vec![(u, 0)]).unwrap();
    // the clean runs while p is still waiting for its consumer
    graph.set_execution_order(vec![p, clean, c, t, u]).unwrap();

    let config = RuntimeConfig { enable_mem_reuse: true, ..small_config() };
    let mut runtime = KernelRuntime::new(config).unwrap();
    runtime.assign_memory(&mut graph).unwrap();

    let ptr = |n| graph.output_addr(n, 0).unwrap().ptr().unwrap();
    assert_ne!(ptr(p), ptr(t));
    assert_ne!(ptr(c), ptr(t));

    let input = Tensor::from_f32(Shape::new(vec![4]), &[1.0, 2.0, 3.0, 4.0]).unwrap();
    runtime.load_input_data(&graph, &[input]).unwrap();
    runtime.run(&graph).unwrap();
    let read = |n| runtime.read_output(&graph, n, 0).unwrap().to_f32_vec().unwrap();
    assert_eq!(read(c), vec![4.0, 8.0, 12.0, 16.0]);
    assert_eq!(read(u), vec![6.0, 12.0, 18.0, 24.0]);
}

#[test]
fn get_next_outputs_stay_out_of_the_reuse_region() {
    let mut graph = KernelGraph::new(0);
    let next = graph.add_kernel("get_next", "GetNext", FixedKernel::boxed(&[64, 32]), &[]).unwrap();
    let c = graph.add_kernel("c", "Fixed", FixedKernel::boxed(&[64]), &[(next, 0), (next, 1)]).unwrap();
    let d = graph.add_kernel("d", "Fixed", FixedKernel::boxed(&[64]), &[(c, 0)]).unwrap();
    graph.set_outputs(vec![(d, 0)]).unwrap();
    graph.build_execution_order().unwrap();

    let config = RuntimeConfig { enable_mem_reuse: true, ..small_config() };
    let mut runtime = KernelRuntime::new(config).unwrap();
    runtime.assign_memory(&mut graph).unwrap();

    let base = runtime.mem_manager().base();
    let ptr = |n, i| graph.output_addr(n, i).unwrap().ptr().unwrap();
    // the reuse region holds only c, GetNext follows it as plain dynamic memory
    assert_eq!(ptr(c, 0), base);
    assert_eq!(ptr(next, 0), base + 64);
    assert_eq!(ptr(next, 1), base + 128);
    assert_eq!(runtime.mem_manager().dynamic_mem_size(), 160);
}

#[test]
fn communication_outputs_skip_bound_indices() {
    let mut graph = KernelGraph::new(0);
    let p0 = graph.add_kernel("p0", "Fixed", FixedKernel::boxed(&[128]), &[]).unwrap();
    let p1 = graph.add_kernel("p1", "Fixed", FixedKernel::boxed(&[256]), &[]).unwrap();
    let p2 = graph.add_kernel("p2", "Fixed", FixedKernel::boxed(&[128]), &[]).unwrap();
    let comm = graph
        .add_kernel("all_reduce", "AllReduce", FixedKernel::boxed(&[128, 256, 128]), &[(p0, 0), (p1, 0), (p2, 0)])
        .unwrap();
    graph.set_communication(comm, true).unwrap();
    graph.build_execution_order().unwrap();

    let mut runtime = KernelRuntime::new(small_config()).unwrap();
    let base = runtime.mem_manager().base();
    let bound = DeviceAddress::new(Some(base + 8192), 256, Format::Default, DataType::F32);
    graph.set_output_addr(comm, 1, bound.clone());
    runtime.assign_memory(&mut graph).unwrap();

    assert!(Arc::ptr_eq(&graph.output_addr(comm, 1).unwrap(), &bound));
    let ptr = |i| graph.output_addr(comm, i).unwrap().ptr().unwrap();
    // pending outputs 0 and 2 are packed back to back after the input block
    assert_eq!(ptr(0), base + 512);
    assert_eq!(ptr(2), base + 640);
    assert_eq!(graph.output_addr(comm, 2).unwrap().size(), 128);
    assert_eq!(runtime.mem_manager().dynamic_mem_size(), 768);
}

#[test]
fn launch_args_fail_on_unbound_or_null_addresses() {
    let mut graph = KernelGraph::new(0);
    let x = graph.add_parameter("x", Shape::new(vec![4]), DataType::F32).unwrap();
    let k = graph.add_kernel("k", "Fixed", FixedKernel::boxed(&[16]), &[(x, 0)]).unwrap();
    graph.build_execution_order().unwrap();

    let runtime = KernelRuntime::new(small_config()).unwrap();
    let err = runtime.gen_launch_args(&graph, k).unwrap_err();
    assert!(matches!(error_kind(&err), Some(RuntimeError::MalformedGraph(_))));

    graph.set_output_addr(x, 0, DeviceAddress::new(None, 16, Format::Default, DataType::F32));
    graph.set_output_addr(k, 0, DeviceAddress::new(Some(runtime.mem_manager().base()), 16, Format::Default, DataType::F32));
    let err = runtime.run(&graph).unwrap_err();
    assert!(matches!(error_kind(&err), Some(RuntimeError::MalformedGraph(_))));
}

#[test]
fn launch_failure_aborts_the_run() {
    let launches = Arc::new(AtomicUsize::new(0));
    let kernel = |fail| {
        Box::new(FixedKernel {
            outputs: vec![16],
            workspaces: vec![8],
            launches: launches.clone(),
            fail,
        }) as Box<dyn KernelMod>
    };
    let mut graph = KernelGraph::new(0);
    let first = graph.add_kernel("first", "Fixed", kernel(false), &[]).unwrap();
    let broken = graph.add_kernel("broken", "Fixed", kernel(true), &[(first, 0)]).unwrap();
    graph.add_kernel("last", "Fixed", kernel(false), &[(broken, 0)]).unwrap();
    graph.build_execution_order().unwrap();

    let mut runtime = KernelRuntime::new(small_config()).unwrap();
    runtime.assign_memory(&mut graph).unwrap();
    let args = runtime.gen_launch_args(&graph, broken).unwrap();
    assert_eq!(args.inputs.len(), 1);
    assert_eq!(args.workspaces.len(), 1);
    assert_eq!(args.outputs.len(), 1);

    let err = runtime.run(&graph).unwrap_err();
    match error_kind(&err) {
        Some(RuntimeError::LaunchFailed(msg)) => assert!(msg.contains("broken")),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.stream().synced(), 0);
}

#[test]
fn example_graph_runs_end_to_end() {
    init_logger();
    let registry = KernelRegistry::with_builtin_kernels();
    let mut graph = GraphDef::from_json(include_str!("../assets/example_graph.json"))
        .unwrap()
        .build(&registry)
        .unwrap();
    let mut runtime = KernelRuntime::new(small_config()).unwrap();
    runtime.assign_memory(&mut graph).unwrap();

    let shape = Shape::new(vec![4]);
    let inputs = vec![
        Tensor::from_f32(shape.clone(), &[1.0, 2.0, 3.0, 4.0]).unwrap(),
        Tensor::from_f32(shape, &[10.0, 20.0, 30.0, 40.0]).unwrap(),
    ];
    runtime.load_input_data(&graph, &inputs).unwrap();
    runtime.run(&graph).unwrap();
    assert_eq!(runtime.stream().synced(), runtime.stream().launched());

    let read = |name: &str, index| {
        let node = graph.find_node(name).unwrap();
        runtime.read_output(&graph, node, index).unwrap().to_f32_vec().unwrap()
    };
    assert_eq!(read("all_reduce", 0), vec![11.0, 22.0, 33.0, 44.0]);
    assert_eq!(read("all_reduce", 1), vec![5.5, 11.0, 16.5, 22.0]);
    assert_eq!(read("total", 0), vec![55.0]);
    assert_eq!(read("acc", 0), vec![56.0, 57.0, 58.0, 59.0]);
    // in-place update is visible through the input
    assert_eq!(read("x", 0), vec![56.0, 57.0, 58.0, 59.0]);

    let clean = graph.find_node("clean_total").unwrap();
    let total = graph.find_node("total").unwrap();
    let args = runtime.gen_launch_args(&graph, clean).unwrap();
    let total_out = graph.output_addr(total, 0).unwrap();
    let total_ws = graph.workspace_addr(total, 0).unwrap();
    assert_eq!(
        args.inputs,
        vec![
            Address { addr: total_out.ptr().unwrap(), size: 4 },
            Address { addr: total_ws.ptr().unwrap(), size: 4 },
        ]
    );
}
