use std::sync::Arc;

use anyhow::Result;
use openactor::{cpu, run_inputs, ActorType, CompiledGraph, ExecutionStrategy, GraphBuilder, TensorValue};

use crate::common::{self, Counting};

/// `abs(x)`: branch 0 negates when `x < 0`, branch 1 adds a stored zero offset.
fn abs_graph(negate: &std::sync::Arc<Counting>, keep: &std::sync::Arc<Counting>) -> Result<CompiledGraph> {
    let mut builder = GraphBuilder::new("abs");
    let main = builder.add_graph("main", cpu());
    let then = builder.add_graph("negate", cpu());
    let other = builder.add_graph("keep", cpu());

    let x = builder.input(main, "x")?;
    let zero = builder.value(main, "zero", TensorValue::scalar(0i32))?;
    let cond = builder.kernel(main, "is_neg", common::host("is_neg", "lt"), &[x, zero])?;

    let p = builder.formal(then, "p")?;
    let origin = builder.value(then, "origin", TensorValue::scalar(0i32))?;
    let flipped = builder.kernel(then, "flip", common::host("flip", "sub"), &[origin, p])?;
    let counted = builder.kernel(then, "count_neg", negate.op("count_neg"), &[flipped.out(0)])?;
    builder.set_results(then, &[counted.out(0)])?;

    let q = builder.formal(other, "q")?;
    let offset = builder.value(other, "offset", TensorValue::scalar(0i32))?;
    let bump = builder.kernel(other, "bump", keep.op("bump"), &[offset])?;
    let same = builder.kernel(other, "same", common::host("same", "add"), &[q, bump.out(0)])?;
    builder.set_results(other, &[same.out(0)])?;

    let call = builder.switch(main, "pick", cond.out(0), vec![(then, vec![x]), (other, vec![x])], 1)?;
    builder.output(call.out(0));
    Ok(builder.finish())
}

#[test]
fn only_the_selected_branch_runs() -> Result<()> {
    let negate = Counting::shared();
    let keep = Counting::shared();
    let scheduler = common::scheduler();
    let set = common::launch(&scheduler, &abs_graph(&negate, &keep)?)?;
    assert_eq!(set.count_of(ActorType::Switch), 1);
    assert_eq!(set.count_of(ActorType::Gather), 1);

    for strategy in common::STRATEGIES {
        let before = (negate.count(), keep.count());
        let report = scheduler.run(&set, &run_inputs!([vec![-3i32]], iterations: 2), strategy)?;
        assert_eq!(common::i32s(&report.outputs[0]), [3]);
        assert_eq!(report.branches_of("pick"), [0, 0]);
        assert_eq!(negate.count(), before.0 + 2);
        assert_eq!(keep.count(), before.1);

        let report = scheduler.run(&set, &run_inputs!([vec![5i32]], iterations: 3), strategy)?;
        assert_eq!(common::i32s(&report.outputs[0]), [5]);
        assert_eq!(report.branches_of("pick"), [1, 1, 1]);
        assert_eq!(negate.count(), before.0 + 2);
        assert_eq!(keep.count(), before.1 + 3);
    }
    Ok(())
}

/// A stored sign flips every iteration, so the switch alternates branches.
fn flip_flop(negate: &Arc<Counting>, keep: &Arc<Counting>) -> Result<CompiledGraph> {
    let mut builder = GraphBuilder::new("flip_flop");
    let main = builder.add_graph("main", cpu());
    let then = builder.add_graph("negate", cpu());
    let other = builder.add_graph("keep", cpu());

    let x = builder.input(main, "x")?;
    let sign = builder.weight(main, "sign", TensorValue::scalar(1i32))?;
    let zero = builder.value(main, "zero", TensorValue::scalar(0i32))?;
    let minus = builder.value(main, "minus", TensorValue::scalar(-1i32))?;
    let cond = builder.kernel(main, "is_neg", common::host("is_neg", "lt"), &[sign, zero])?;
    builder.kernel(main, "flip", common::host("flip", "mul").in_place(0), &[sign, minus])?;

    let p = builder.formal(then, "p")?;
    let origin = builder.value(then, "origin", TensorValue::scalar(0i32))?;
    let negated = builder.kernel(then, "negated", common::host("negated", "sub"), &[origin, p])?;
    let counted = builder.kernel(then, "count_neg", negate.op("count_neg"), &[negated.out(0)])?;
    builder.set_results(then, &[counted.out(0)])?;

    let q = builder.formal(other, "q")?;
    let kept = builder.kernel(other, "count_keep", keep.op("count_keep"), &[q])?;
    builder.set_results(other, &[kept.out(0)])?;

    let call = builder.switch(main, "pick", cond.out(0), vec![(then, vec![x]), (other, vec![x])], 1)?;
    builder.output(call.out(0));
    Ok(builder.finish())
}

#[test]
fn alternating_condition_switches_branch_every_iteration() -> Result<()> {
    for strategy in common::STRATEGIES {
        let negate = Counting::shared();
        let keep = Counting::shared();
        let scheduler = common::scheduler();
        let set = common::launch(&scheduler, &flip_flop(&negate, &keep)?)?;

        let report = scheduler.run(&set, &run_inputs!([vec![5i32]], iterations: 8), strategy)?;
        assert_eq!(report.branches_of("pick"), [1, 0, 1, 0, 1, 0, 1, 0], "{strategy:?}");
        let seen: Vec<i32> = report
            .snapshots
            .iter()
            .flat_map(|snapshot| common::i32s(&snapshot.values[0]))
            .collect();
        assert_eq!(seen, [5, -5, 5, -5, 5, -5, 5, -5], "{strategy:?}");
        assert_eq!(negate.count(), 4);
        assert_eq!(keep.count(), 4);
    }
    Ok(())
}

#[test]
fn integer_condition_indexes_branches() -> Result<()> {
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("select");
    let main = builder.add_graph("main", cpu());
    let index = builder.input(main, "index")?;
    let x = builder.input(main, "x")?;
    let mut branches = Vec::new();
    for (name, kernel) in [("plus", "add"), ("minus", "sub"), ("times", "mul")] {
        let graph = builder.add_graph(name, cpu());
        let p = builder.formal(graph, "p")?;
        let node = builder.kernel(graph, name, common::host(name, kernel), &[p, p])?;
        builder.set_results(graph, &[node.out(0)])?;
        branches.push((graph, vec![x]));
    }
    let call = builder.switch(main, "op", index, branches, 1)?;
    builder.output(call.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;

    for (selector, expected) in [(0i32, 8), (1, 0), (2, 16)] {
        let report = scheduler.run(
            &set,
            &run_inputs!([vec![selector], vec![4i32]]),
            ExecutionStrategy::Pipeline,
        )?;
        assert_eq!(common::i32s(&report.outputs[0]), [expected]);
        assert_eq!(report.branches_of("op"), [selector as usize]);
    }
    Ok(())
}

#[test]
fn plain_call_always_takes_its_only_branch() -> Result<()> {
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("call");
    let main = builder.add_graph("main", cpu());
    let body = builder.add_graph("double", cpu());
    let x = builder.input(main, "x")?;
    let p = builder.formal(body, "p")?;
    let twice = builder.kernel(body, "twice", common::host("twice", "add"), &[p, p])?;
    builder.set_results(body, &[twice.out(0)])?;
    let call = builder.call(main, "double", body, &[x], 1)?;
    let after = builder.kernel(main, "inc", common::host("inc", "add"), &[call.out(0), x])?;
    builder.output(after.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;

    let report = scheduler.run(&set, &run_inputs!([vec![2i32, 5]], iterations: 2), ExecutionStrategy::Step)?;
    assert_eq!(common::i32s(&report.outputs[0]), [6, 15]);
    assert_eq!(report.branches_of("double"), [0, 0]);
    Ok(())
}
