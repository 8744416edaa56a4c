use std::sync::Arc;

use anyhow::Result;
use openactor::{
    cpu, linearize, run_inputs, DType, ExecutionStrategy, GraphBuilder, Operand, Program,
    ProgramBuilder, StackEventKind, TensorValue, ValueType,
};

use crate::common;

fn int() -> ValueType {
    ValueType::scalar(DType::I64)
}

/// `fact(n) = n <= 1 ? 1 : n * fact(n - 1)`, recursing through `rec`.
pub fn factorial() -> Result<Program> {
    let mut b = ProgramBuilder::new("factorial");
    let main = b.func("main", vec![int()]);
    let fact = b.func("fact", vec![int()]);
    let base = b.func("base", vec![int()]);
    let rec = b.func("rec", vec![int()]);

    let out = b.call(main, fact, vec![Operand::Param(0)], int())?;
    b.ret(main, out, int())?;

    let one = || Operand::constant(TensorValue::scalar(1i64));
    let done = b.host(fact, "le", vec![Operand::Param(0), one()], ValueType::scalar(DType::Bool))?;
    let picked = b.switch(
        fact,
        done,
        vec![(base, vec![Operand::Param(0)]), (rec, vec![Operand::Param(0)])],
        int(),
    )?;
    b.ret(fact, picked, int())?;

    b.ret(base, one(), int())?;

    let smaller = b.host(rec, "sub", vec![Operand::Param(0), one()], int())?;
    let inner = b.call(rec, fact, vec![smaller], int())?;
    let product = b.host(rec, "mul", vec![Operand::Param(0), inner], int())?;
    b.ret(rec, product, int())?;
    b.build(main)
}

#[test]
fn recursion_runs_inside_one_kernel_actor() -> Result<()> {
    let linear = Arc::new(linearize(&factorial()?)?);
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("recursive");
    let main = builder.add_graph("main", cpu());
    let n = builder.input(main, "n")?;
    let fact = builder.linear_program(main, "fact", linear, &[n])?;
    builder.output(fact.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;

    for strategy in common::STRATEGIES {
        let report = scheduler.run(&set, &run_inputs!([TensorValue::scalar(6i64)]), strategy)?;
        assert_eq!(report.outputs[0], TensorValue::scalar(720i64));
        let report = scheduler.run(&set, &run_inputs!([TensorValue::scalar(3i64)], iterations: 3), strategy)?;
        assert_eq!(report.outputs[0], TensorValue::scalar(6i64));
    }
    Ok(())
}

#[test]
fn deeper_recursion_pushes_more_frames() -> Result<()> {
    let linear = linearize(&factorial()?)?;
    let mut previous = 0;
    for n in 1..=6i64 {
        let (out, events) = linear.run_traced(&[TensorValue::scalar(n)])?;
        let expected: i64 = (1..=n).product();
        assert_eq!(out, TensorValue::scalar(expected));
        let pushes = events.iter().filter(|event| event.kind == StackEventKind::Push).count();
        let pops = events.len() - pushes;
        assert_eq!(pushes, pops);
        assert!(pushes >= previous, "n={n}: {pushes} < {previous}");
        previous = pushes;
        let deepest = events.iter().map(|event| event.depth).max().unwrap_or(0);
        assert!(deepest <= linear.stack_capacity());
    }
    Ok(())
}

#[test]
fn linearized_program_reports_wrong_arity() -> Result<()> {
    let linear = linearize(&factorial()?)?;
    let err = linear.run(&[]).unwrap_err();
    assert!(err.to_string().contains("factorial expects 1 inputs, got 0"), "{err}");
    assert!(linear.dump().starts_with("linear program factorial: 1 inputs"));
    Ok(())
}

#[test]
fn linearized_program_in_a_switch_branch() -> Result<()> {
    let linear = Arc::new(linearize(&factorial()?)?);
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("guarded");
    let main = builder.add_graph("main", cpu());
    let small = builder.add_graph("small", cpu());
    let large = builder.add_graph("large", cpu());
    let n = builder.input(main, "n")?;
    let limit = builder.value(main, "limit", TensorValue::scalar(10i64))?;
    let fits = builder.kernel(main, "fits", common::host("fits", "le"), &[n, limit])?;

    let p = builder.formal(small, "p")?;
    let fact = builder.linear_program(small, "fact", linear, &[p])?;
    builder.set_results(small, &[fact.out(0)])?;
    let q = builder.formal(large, "q")?;
    let zero = builder.value(large, "zero", TensorValue::scalar(0i64))?;
    let clamp = builder.kernel(large, "clamp", common::host("clamp", "mul"), &[q, zero])?;
    builder.set_results(large, &[clamp.out(0)])?;

    let call = builder.switch(main, "guard", fits.out(0), vec![(small, vec![n]), (large, vec![n])], 1)?;
    builder.output(call.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;

    let report = scheduler.run(&set, &run_inputs!([TensorValue::scalar(5i64)]), ExecutionStrategy::Pipeline)?;
    assert_eq!(report.outputs[0], TensorValue::scalar(120i64));
    assert_eq!(report.branches_of("guard"), [0]);
    let report = scheduler.run(&set, &run_inputs!([TensorValue::scalar(40i64)]), ExecutionStrategy::Step)?;
    assert_eq!(report.outputs[0], TensorValue::scalar(0i64));
    assert_eq!(report.branches_of("guard"), [1]);
    Ok(())
}
