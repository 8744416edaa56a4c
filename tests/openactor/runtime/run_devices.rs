use std::sync::Arc;

use anyhow::Result;
use openactor::{
    cpu, run_inputs, ActorType, DeviceId, DeviceKind, ExecutionStrategy, GraphBuilder, SimDevice,
    TensorValue,
};

use crate::common;

#[test]
fn cross_device_reads_go_through_one_copy() -> Result<()> {
    let sim = Arc::new(SimDevice::new(0));
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("offload");
    let main = builder.add_graph("main", cpu());
    let accel = builder.add_graph("accel", sim.clone());
    let x = builder.input(main, "x")?;
    let y = builder.input(accel, "y")?;
    let w = builder.weight(accel, "w", TensorValue::scalar(2i32))?;
    let a = builder.kernel(main, "a", common::host("a", "copy"), &[x])?;
    let b = builder.kernel(accel, "b", common::host("b", "add"), &[a.out(0), y])?;
    let c = builder.kernel(accel, "c", common::host("c", "mul"), &[b.out(0), w])?;
    let d = builder.kernel(accel, "d", common::host("d", "sub"), &[c.out(0), a.out(0)])?;
    builder.output(d.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;

    assert_eq!(set.names_of(ActorType::Copy), ["offload/copy/kernel/main/a:0->sim:0"]);
    assert_eq!(set.count_of(ActorType::DataSource), 2);

    let report = scheduler.run(
        &set,
        &run_inputs!([vec![1i32, 2], vec![10i32, 20]], iterations: 3),
        ExecutionStrategy::Pipeline,
    )?;
    assert_eq!(common::i32s(&report.outputs[0]), [21, 42]);
    assert_eq!(sim.copies(), 3);
    assert_eq!(sim.uploads(), 1 + 3);

    let memory = scheduler.memory();
    let on_sim = memory[&DeviceId::new(DeviceKind::Sim, 0)];
    assert_eq!(on_sim.copies, 3);
    assert_eq!(on_sim.copy_bytes, 3 * 2 * 4);
    assert_eq!(on_sim.uploads, 4);
    let on_cpu = memory[&DeviceId::new(DeviceKind::Cpu, 0)];
    assert_eq!(on_cpu.uploads, 3);
    assert_eq!(on_cpu.copies, 0);
    Ok(())
}

#[test]
fn branches_on_another_device_copy_in_and_out() -> Result<()> {
    let sim = Arc::new(SimDevice::new(1));
    let scheduler = common::scheduler();
    let mut builder = GraphBuilder::new("remote");
    let main = builder.add_graph("main", cpu());
    let neg = builder.add_graph("neg", sim.clone());
    let keep = builder.add_graph("keep", sim.clone());
    let x = builder.input(main, "x")?;
    let zero = builder.value(main, "zero", TensorValue::scalar(0i32))?;
    let cond = builder.kernel(main, "cond", common::host("cond", "lt"), &[x, zero])?;

    let p = builder.formal(neg, "p")?;
    let origin = builder.value(neg, "origin", TensorValue::scalar(0i32))?;
    let flipped = builder.kernel(neg, "flip", common::host("flip", "sub"), &[origin, p])?;
    builder.set_results(neg, &[flipped.out(0)])?;
    let q = builder.formal(keep, "q")?;
    let kept = builder.kernel(keep, "kept", common::host("kept", "copy"), &[q])?;
    builder.set_results(keep, &[kept.out(0)])?;

    let call = builder.switch(main, "abs", cond.out(0), vec![(neg, vec![x]), (keep, vec![x])], 1)?;
    builder.output(call.out(0));
    let set = common::launch(&scheduler, &builder.finish())?;

    let copies = set.names_of(ActorType::Copy);
    assert_eq!(copies.len(), 4);
    assert_eq!(copies.iter().filter(|name| name.ends_with("->sim:1@call0.b0")).count(), 1);
    assert_eq!(copies.iter().filter(|name| name.ends_with("->cpu:0@call0.b1")).count(), 1);

    let report = scheduler.run(&set, &run_inputs!([vec![-4i32]], iterations: 2), ExecutionStrategy::Step)?;
    assert_eq!(common::i32s(&report.outputs[0]), [4]);
    assert_eq!(sim.copies(), 2);
    let memory = scheduler.memory();
    assert_eq!(memory[&DeviceId::new(DeviceKind::Cpu, 0)].copies, 2);
    Ok(())
}
