use std::sync::Arc;

use anyhow::Result;
use openactor::{
    cpu, run_inputs, CompiledGraph, ExecutionStrategy, GraphBuilder, OpDescriptor, SchedulerError,
};

use crate::common::{self, Failing};

fn selector() -> Result<CompiledGraph> {
    let mut builder = GraphBuilder::new("selector");
    let main = builder.add_graph("main", cpu());
    let index = builder.input(main, "index")?;
    let x = builder.input(main, "x")?;
    let mut branches = Vec::new();
    for name in ["first", "second", "third"] {
        let graph = builder.add_graph(name, cpu());
        let p = builder.formal(graph, "p")?;
        let node = builder.kernel(graph, name, common::host(name, "copy"), &[p])?;
        builder.set_results(graph, &[node.out(0)])?;
        branches.push((graph, vec![x]));
    }
    let call = builder.switch(main, "route", index, branches, 1)?;
    builder.output(call.out(0));
    Ok(builder.finish())
}

#[test]
fn out_of_range_branch_fails_the_run() -> Result<()> {
    let scheduler = common::scheduler();
    let set = common::launch(&scheduler, &selector()?)?;
    for strategy in common::STRATEGIES {
        let err = scheduler
            .run(&set, &run_inputs!([vec![3i32], vec![1i32]], iterations: 2), strategy)
            .unwrap_err();
        match common::classify(&err) {
            SchedulerError::Runtime { actor, message } => {
                assert_eq!(actor, "selector/switch/route");
                assert!(
                    message.contains("branch index 3 out of range for call route with 3 branches"),
                    "{message}"
                );
            }
            other => panic!("unexpected {other:?}"),
        }

        // A failed run leaves nothing behind for the next one.
        let report = scheduler.run(&set, &run_inputs!([vec![2i32], vec![9i32]]), strategy)?;
        assert_eq!(common::i32s(&report.outputs[0]), [9]);
        assert_eq!(report.branches_of("route"), [2]);
    }
    let history = scheduler.history();
    assert_eq!(history.len(), 4);
    assert!(history[0].error.as_deref().unwrap_or_default().contains("out of range"));
    assert!(history[1].error.is_none());
    Ok(())
}

#[test]
fn non_integer_condition_is_rejected() -> Result<()> {
    let scheduler = common::scheduler();
    let set = common::launch(&scheduler, &selector()?)?;
    let err = scheduler
        .run(&set, &run_inputs!([vec![0.5f32], vec![1i32]]), ExecutionStrategy::Step)
        .unwrap_err();
    match common::classify(&err) {
        SchedulerError::Runtime { message, .. } => {
            assert!(message.contains("invalid condition for call route"), "{message}")
        }
        other => panic!("unexpected {other:?}"),
    }
    let err = scheduler
        .run(&set, &run_inputs!([vec![-1i32], vec![1i32]]), ExecutionStrategy::Step)
        .unwrap_err();
    assert!(format!("{:#}", err).contains("negative branch index -1"));
    Ok(())
}

#[test]
fn kernel_failure_names_the_actor() -> Result<()> {
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("broken");
    let main = builder.add_graph("main", cpu());
    let x = builder.input(main, "x")?;
    let ok = builder.kernel(main, "ok", common::host("ok", "copy"), &[x])?;
    let boom = builder.kernel(main, "boom", OpDescriptor::new("boom", Arc::new(Failing), 1, 1), &[ok.out(0)])?;
    builder.output(boom.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;

    for strategy in common::STRATEGIES {
        let err = scheduler
            .run(&set, &run_inputs!([vec![1i32]], iterations: 5), strategy)
            .unwrap_err();
        match common::classify(&err) {
            SchedulerError::Runtime { actor, message } => {
                assert_eq!(actor, "broken/kernel/main/boom");
                assert!(message.contains("op boom failed"), "{message}");
                assert!(message.contains("device lost"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(!set.is_running());
    Ok(())
}

#[test]
fn inputs_are_checked_before_running() -> Result<()> {
    let scheduler = common::scheduler();
    let set = common::launch(&scheduler, &selector()?)?;

    let err = scheduler
        .run(&set, &run_inputs!([vec![0i32]]), ExecutionStrategy::Pipeline)
        .unwrap_err();
    match common::classify(&err) {
        SchedulerError::Runtime { actor, message } => {
            assert_eq!(actor, "selector/data_prepare");
            assert_eq!(message, "expected 2 inputs, got 1");
        }
        other => panic!("unexpected {other:?}"),
    }

    let inputs = run_inputs!([vec![0i32], vec![1i32]], { bias: vec![1i32] });
    let err = scheduler.run(&set, &inputs, ExecutionStrategy::Pipeline).unwrap_err();
    assert!(err.to_string().contains("unknown value node bias"));
    assert!(scheduler.history().is_empty());
    Ok(())
}

#[test]
fn malformed_graphs_are_not_registered() -> Result<()> {
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("looping");
    let main = builder.add_graph("main", cpu());
    let x = builder.input(main, "x")?;
    let first = builder.kernel(main, "first", common::host("first", "copy"), &[x])?;
    let second = builder.kernel(main, "second", common::host("second", "copy"), &[first.out(0)])?;
    builder.order(second, first)?;
    builder.output(second.out(0));
    let err = scheduler.transform(&builder.finish()).unwrap_err();
    assert!(matches!(common::classify(&err), SchedulerError::Build(_)));
    assert!(scheduler.names().is_empty());

    let mut builder = GraphBuilder::new("leaky");
    let main = builder.add_graph("main", cpu());
    let body = builder.add_graph("body", cpu());
    let x = builder.input(main, "x")?;
    let p = builder.formal(body, "p")?;
    let local = builder.kernel(body, "local", common::host("local", "copy"), &[p])?;
    builder.set_results(body, &[local.out(0)])?;
    builder.call(main, "call", body, &[x], 1)?;
    builder.output(local.out(0));
    let err = scheduler.transform(&builder.finish()).unwrap_err();
    match common::classify(&err) {
        SchedulerError::Build(message) => {
            assert!(message.contains("graph output references local outside its scope"), "{message}")
        }
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}
