use std::collections::BTreeSet;

use anyhow::Result;
use openactor::{
    cpu, fetch_outputs, run_inputs, ActorType, ExecutionStrategy, GraphBuilder, RunInputs,
    Scheduler, TensorValue,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::{self, Counting};

fn chain(name: &str, length: usize, counter: &std::sync::Arc<Counting>) -> Result<openactor::CompiledGraph> {
    let mut builder = GraphBuilder::new(name);
    let main = builder.add_graph("main", cpu());
    let mut value = builder.input(main, "x")?;
    for index in 0..length {
        let id = format!("k{index}");
        value = builder.kernel(main, id.clone(), counter.op(&id), &[value])?.out(0);
    }
    builder.output(value);
    Ok(builder.finish())
}

#[test]
fn linear_chain_fires_every_kernel_each_iteration() -> Result<()> {
    let counter = Counting::shared();
    let scheduler = common::scheduler();
    let set = common::launch(&scheduler, &chain("chain", 6, &counter)?)?;
    assert_eq!(set.count_of(ActorType::Kernel), 6);

    let mut runs = 0;
    for strategy in common::STRATEGIES {
        let inputs = RunInputs::new(vec![TensorValue::from(vec![7i32, 8])]).with_iterations(5);
        let report = scheduler.run(&set, &inputs, strategy)?;
        runs += 1;
        assert_eq!(report.iterations, 5);
        assert_eq!(report.snapshots.len(), 5);
        let iterations: Vec<usize> = report.snapshots.iter().map(|s| s.iteration).collect();
        assert_eq!(iterations, [0, 1, 2, 3, 4]);
        assert_eq!(common::i32s(&report.outputs[0]), [7, 8]);
        assert_eq!(counter.count(), 6 * 5 * runs);
    }
    Ok(())
}

#[test]
fn add_runs_once_per_iteration() -> Result<()> {
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("add");
    let main = builder.add_graph("main", cpu());
    let x = builder.input(main, "x")?;
    let y = builder.input(main, "y")?;
    let sum = builder.kernel(main, "sum", common::host("sum", "add"), &[x, y])?;
    builder.output(sum.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;

    for iterations in [1, 3] {
        let inputs = run_inputs!([vec![1i32, 2], vec![3i32, 4]], iterations: iterations);
        let report = scheduler.run(&set, &inputs, ExecutionStrategy::Pipeline)?;
        assert_eq!(report.iterations, iterations);
        assert_eq!(report.snapshots.len(), iterations);
        for snapshot in &report.snapshots {
            assert_eq!(common::i32s(&snapshot.values[0]), [4, 6]);
        }
        fetch_outputs!(report, { total: i32 });
        assert_eq!(total.data, [4, 6]);
    }
    Ok(())
}

#[test]
fn graph_loop_count_is_the_default() -> Result<()> {
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("looped");
    let main = builder.add_graph("main", cpu());
    let x = builder.input(main, "x")?;
    let copy = builder.kernel(main, "copy", common::host("copy", "copy"), &[x])?;
    builder.output(copy.out(0));
    builder.loop_count(4);
    let set = common::launch(&scheduler, &builder.finish())?;
    assert_eq!(set.default_iterations(), 4);
    let report = scheduler.run(&set, &run_inputs!([vec![1.5f32]]), ExecutionStrategy::Step)?;
    assert_eq!(report.iterations, 4);
    Ok(())
}

#[test]
fn zero_iterations_only_validate() -> Result<()> {
    let counter = Counting::shared();
    let scheduler = common::scheduler();
    let set = common::launch(&scheduler, &chain("idle", 3, &counter)?)?;
    let report = scheduler.run(&set, &run_inputs!([vec![1i32]], iterations: 0), ExecutionStrategy::Pipeline)?;
    assert_eq!(report.iterations, 0);
    assert!(report.outputs.is_empty());
    assert!(report.snapshots.is_empty());
    assert_eq!(counter.count(), 0);
    Ok(())
}

#[test]
fn strategies_agree_on_outputs() -> Result<()> {
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("diamond");
    let main = builder.add_graph("main", cpu());
    let x = builder.input(main, "x")?;
    let left = builder.kernel(main, "left", common::host("left", "add"), &[x, x])?;
    let right = builder.kernel(main, "right", common::host("right", "mul"), &[x, x])?;
    let join = builder.kernel(main, "join", common::host("join", "sub"), &[right.out(0), left.out(0)])?;
    builder.output(join.out(0));
    builder.output(left.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;

    let inputs = run_inputs!([vec![1i32, 3, 5]], iterations: 2);
    let step = scheduler.run(&set, &inputs, ExecutionStrategy::Step)?;
    let pipeline = scheduler.run(&set, &inputs, ExecutionStrategy::Pipeline)?;
    assert_eq!(step.outputs, pipeline.outputs);
    assert_eq!(common::i32s(&step.outputs[0]), [-1, 3, 15]);
    assert_eq!(common::i32s(&step.outputs[1]), [2, 6, 10]);
    assert_ne!(step.run_id, pipeline.run_id);
    Ok(())
}

#[test]
fn random_inputs_match_the_host_result() -> Result<()> {
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("random");
    let main = builder.add_graph("main", cpu());
    let x = builder.input(main, "x")?;
    let y = builder.input(main, "y")?;
    let sum = builder.kernel(main, "sum", common::host("sum", "add"), &[x, y])?;
    let product = builder.kernel(main, "product", common::host("product", "mul"), &[sum.out(0), y])?;
    builder.output(product.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..8 {
        let len = rng.gen_range(1..16);
        let xs: Vec<i32> = (0..len).map(|_| rng.gen_range(-100..100)).collect();
        let ys: Vec<i32> = (0..len).map(|_| rng.gen_range(-100..100)).collect();
        let expected: Vec<i32> = xs.iter().zip(&ys).map(|(x, y)| (x + y) * y).collect();
        for strategy in common::STRATEGIES {
            let inputs = run_inputs!([xs.clone(), ys.clone()], iterations: 2);
            let report = scheduler.run(&set, &inputs, strategy)?;
            assert_eq!(common::i32s(&report.outputs[0]), expected);
        }
    }
    Ok(())
}

#[test]
fn trace_events_cover_each_firing() -> Result<()> {
    let scheduler = Scheduler::new(common::config().with_trace_events());
    let counter = Counting::shared();
    let set = common::launch(&scheduler, &chain("traced", 2, &counter)?)?;
    let report = scheduler.run(&set, &run_inputs!([vec![1i32]], iterations: 3), ExecutionStrategy::Pipeline)?;
    let kernels: Vec<_> = report
        .trace
        .iter()
        .filter(|event| event.kind == ActorType::Kernel)
        .collect();
    assert_eq!(kernels.len(), 6);
    let iterations: BTreeSet<usize> = kernels.iter().map(|event| event.iteration).collect();
    assert_eq!(iterations.into_iter().collect::<Vec<_>>(), [0, 1, 2]);
    assert!(report.trace.iter().all(|event| event.run_id == report.run_id));
    let outputs = report
        .trace
        .iter()
        .filter(|event| event.kind == ActorType::Output)
        .count();
    assert_eq!(outputs, 3);
    let json = serde_json::to_value(&report.trace[0])?;
    assert!(json.get("micros").is_some());

    let quiet = common::scheduler();
    let set = common::launch(&quiet, &chain("untraced", 2, &counter)?)?;
    let report = quiet.run(&set, &run_inputs!([vec![1i32]]), ExecutionStrategy::Step)?;
    assert!(report.trace.is_empty());
    Ok(())
}
