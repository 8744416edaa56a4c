use std::sync::{Arc, Mutex};

use anyhow::Result;
use openactor::{
    cpu, run_inputs, ActorType, DeviceId, DeviceKind, ExecutionStrategy, GraphBuilder,
    SideEffect, TensorValue,
};

use crate::common::{self, Journal};

fn accumulator() -> Result<openactor::CompiledGraph> {
    let mut builder = GraphBuilder::new("accumulate");
    let main = builder.add_graph("main", cpu());
    let w = builder.weight(main, "w", TensorValue::scalar(1i32))?;
    let before = builder.kernel(main, "before", common::host("before", "copy"), &[w])?;
    let update = builder.kernel(
        main,
        "update",
        common::host("update", "add").in_place(0),
        &[w, before.out(0)],
    )?;
    let after = builder.kernel(main, "after", common::host("after", "copy"), &[w])?;
    builder.output(before.out(0));
    builder.output(update.out(0));
    builder.output(after.out(0));
    Ok(builder.finish())
}

#[test]
fn in_place_update_is_seen_by_later_readers_only() -> Result<()> {
    for strategy in common::STRATEGIES {
        let scheduler = common::scheduler();
        let set = common::launch(&scheduler, &accumulator()?)?;
        let report = scheduler.run(&set, &run_inputs!([], iterations: 3), strategy)?;
        let rows: Vec<Vec<i32>> = report
            .snapshots
            .iter()
            .map(|snapshot| snapshot.values.iter().flat_map(|value| common::i32s(value)).collect())
            .collect();
        assert_eq!(rows, [[1, 2, 2], [2, 4, 4], [4, 8, 8]]);
        let cpu0 = DeviceId::new(DeviceKind::Cpu, 0);
        assert_eq!(scheduler.store().value("w", cpu0), Some(TensorValue::scalar(8i32)));

        // The store outlives the run: the next run continues from 8.
        let report = scheduler.run(&set, &run_inputs!([]), strategy)?;
        assert_eq!(common::i32s(&report.outputs[2]), [16]);
    }
    Ok(())
}

#[test]
fn store_outputs_are_read_before_the_next_iteration() -> Result<()> {
    for strategy in common::STRATEGIES {
        let scheduler = common::scheduler();
        let mut builder = GraphBuilder::new("counter");
        let main = builder.add_graph("main", cpu());
        let w = builder.weight(main, "w", TensorValue::scalar(0i32))?;
        let one = builder.value(main, "one", TensorValue::scalar(1i32))?;
        builder.kernel(main, "bump", common::host("bump", "add").in_place(0), &[w, one])?;
        builder.output(w);
        let set = common::launch(&scheduler, &builder.finish())?;

        let report = scheduler.run(&set, &run_inputs!([], iterations: 32), strategy)?;
        let seen: Vec<i32> = report
            .snapshots
            .iter()
            .flat_map(|snapshot| common::i32s(&snapshot.values[0]))
            .collect();
        let expected: Vec<i32> = (1..=32).collect();
        assert_eq!(seen, expected, "{strategy:?}");
    }
    Ok(())
}

#[test]
fn root_reader_and_branch_writer_never_race() -> Result<()> {
    for strategy in common::STRATEGIES {
        let scheduler = common::scheduler();
        let mut builder = GraphBuilder::new("scoped");
        let main = builder.add_graph("main", cpu());
        let body = builder.add_graph("body", cpu());
        let w = builder.weight(main, "w", TensorValue::scalar(0i32))?;
        let reader = builder.kernel(main, "reader", common::host("reader", "copy"), &[w])?;
        let one = builder.value(body, "one", TensorValue::scalar(1i32))?;
        let update = builder.kernel(body, "update", common::host("update", "add").in_place(0), &[w, one])?;
        builder.set_results(body, &[update.out(0)])?;
        let call = builder.call(main, "step", body, &[], 1)?;
        builder.output(reader.out(0));
        builder.output(call.out(0));
        let set = common::launch(&scheduler, &builder.finish())?;

        let report = scheduler.run(&set, &run_inputs!([], iterations: 64), strategy)?;
        for snapshot in &report.snapshots {
            let i = snapshot.iteration as i32;
            assert_eq!(common::i32s(&snapshot.values[0]), [i], "{strategy:?} reader");
            assert_eq!(common::i32s(&snapshot.values[1]), [i + 1], "{strategy:?} writer");
        }
        assert_eq!(report.snapshots.len(), 64);
    }
    Ok(())
}

#[test]
fn value_nodes_replace_persistent_tensors() -> Result<()> {
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("scaled");
    let main = builder.add_graph("main", cpu());
    let x = builder.input(main, "x")?;
    let scale = builder.value(main, "scale", TensorValue::scalar(2i32))?;
    let out = builder.kernel(main, "scale_x", common::host("scale_x", "mul"), &[x, scale])?;
    builder.output(out.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;

    let report = scheduler.run(&set, &run_inputs!([vec![1i32, 2]]), ExecutionStrategy::Pipeline)?;
    assert_eq!(common::i32s(&report.outputs[0]), [2, 4]);

    let inputs = run_inputs!([vec![1i32, 2]], { scale: vec![5i32] });
    let report = scheduler.run(&set, &inputs, ExecutionStrategy::Pipeline)?;
    assert_eq!(common::i32s(&report.outputs[0]), [5, 10]);

    let report = scheduler.run(&set, &run_inputs!([vec![3i32]]), ExecutionStrategy::Step)?;
    assert_eq!(common::i32s(&report.outputs[0]), [15]);
    Ok(())
}

#[test]
fn collectives_keep_one_global_order() -> Result<()> {
    let ring = Arc::new(Mutex::new(Vec::new()));
    let effects = Arc::new(Mutex::new(Vec::new()));
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("collective");
    let main = builder.add_graph("main", cpu());
    let x = builder.input(main, "x")?;
    for name in ["all_reduce", "all_gather", "broadcast"] {
        let op = Journal::op(name, &ring).collective("ring");
        let node = builder.kernel(main, name, op, &[x])?;
        builder.output(node.out(0));
    }
    for name in ["print", "flush"] {
        let op = Journal::op(name, &effects).with_side_effect(SideEffect::Opaque);
        let node = builder.kernel(main, name, op, &[x])?;
        builder.output(node.out(0));
    }
    let set = common::launch(&scheduler, &builder.finish())?;
    scheduler.run(&set, &run_inputs!([vec![1.0f32]], iterations: 4), ExecutionStrategy::Pipeline)?;

    let ring = ring.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.clone();
    assert_eq!(ring.len(), 12);
    for round in ring.chunks(3) {
        assert_eq!(round, ["all_reduce", "all_gather", "broadcast"]);
    }
    let effects = effects.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.clone();
    assert_eq!(effects, ["print", "flush"].repeat(4));
    Ok(())
}

#[test]
fn skipped_nodes_forward_their_input() -> Result<()> {
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("aliased");
    let main = builder.add_graph("main", cpu());
    let x = builder.input(main, "x")?;
    let doubled = builder.kernel(main, "double", common::host("double", "add"), &[x, x])?;
    let reshape = builder.skipped(main, "reshape", common::host("reshape", "copy"), &[doubled.out(0)])?;
    let squared = builder.kernel(main, "square", common::host("square", "mul"), &[reshape.out(0), reshape.out(0)])?;
    builder.output(squared.out(0));
    builder.output(reshape.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;
    assert_eq!(set.count_of(ActorType::Kernel), 2);
    assert!(set.actor("aliased/kernel/main/reshape").is_none());

    let report = scheduler.run(&set, &run_inputs!([vec![3i32]], iterations: 2), ExecutionStrategy::Step)?;
    assert_eq!(common::i32s(&report.outputs[0]), [36]);
    assert_eq!(common::i32s(&report.outputs[1]), [6]);
    Ok(())
}
