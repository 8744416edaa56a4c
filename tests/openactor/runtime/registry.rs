use std::fs;

use anyhow::Result;
use openactor::{
    cpu, linearize, run_inputs, CompiledGraph, ExecutionStrategy, GraphBuilder, Scheduler,
    SchedulerError,
};

use crate::common;

fn identity(name: &str) -> Result<CompiledGraph> {
    let mut builder = GraphBuilder::new(name);
    let main = builder.add_graph("main", cpu());
    let x = builder.input(main, "x")?;
    let w = builder.weight(main, "w", vec![1i32].into())?;
    let copy = builder.kernel(main, "copy", common::host("copy", "add"), &[x, w])?;
    builder.output(copy.out(0));
    Ok(builder.finish())
}

#[test]
fn sets_are_registered_by_name() -> Result<()> {
    let scheduler = common::scheduler();
    let first = scheduler.transform(&identity("first")?)?;
    scheduler.transform(&identity("second")?)?;
    assert_eq!(scheduler.names(), ["first", "second"]);
    assert!(std::sync::Arc::ptr_eq(&scheduler.fetch("first").expect("registered"), &first));

    let err = scheduler.transform(&identity("first")?).unwrap_err();
    assert!(matches!(common::classify(&err), SchedulerError::Registry(_)));

    let err = scheduler
        .run(&first, &run_inputs!([vec![1i32]]), ExecutionStrategy::Step)
        .unwrap_err();
    assert!(err.to_string().contains("has not been scheduled"));
    scheduler.schedule(&first)?;
    assert!(scheduler.is_scheduled("first"));
    assert!(!scheduler.is_scheduled("second"));
    let report = scheduler.run(&first, &run_inputs!([vec![1i32]]), ExecutionStrategy::Step)?;
    assert_eq!(common::i32s(&report.outputs[0]), [2]);
    assert_eq!(report.actor_set, "first");

    scheduler.clear("first")?;
    assert!(scheduler.fetch("first").is_none());
    assert!(!scheduler.is_scheduled("first"));
    assert!(scheduler.clear("first").is_err());
    let err = scheduler
        .run(&first, &run_inputs!([vec![1i32]]), ExecutionStrategy::Step)
        .unwrap_err();
    assert!(matches!(common::classify(&err), SchedulerError::Registry(_)));
    assert!(!scheduler.store().is_empty());

    // The name is free again once cleared.
    common::launch(&scheduler, &identity("first")?)?;
    Ok(())
}

#[test]
fn sets_belong_to_their_scheduler() -> Result<()> {
    let owner = common::scheduler();
    let other = common::scheduler();
    let set = common::launch(&owner, &identity("owned")?)?;
    assert!(other.schedule(&set).is_err());
    common::launch(&other, &identity("owned")?)?;
    let err = other
        .run(&set, &run_inputs!([vec![1i32]]), ExecutionStrategy::Pipeline)
        .unwrap_err();
    assert!(matches!(common::classify(&err), SchedulerError::Registry(_)));
    Ok(())
}

#[test]
fn clear_all_resets_the_store() -> Result<()> {
    let scheduler = common::scheduler();
    let set = common::launch(&scheduler, &identity("stored")?)?;
    scheduler.run(&set, &run_inputs!([vec![4i32]]), ExecutionStrategy::Pipeline)?;
    assert_eq!(scheduler.store().len(), 1);
    assert!(!scheduler.memory().is_empty());

    scheduler.clear_all();
    assert!(scheduler.names().is_empty());
    assert!(scheduler.store().is_empty());
    assert!(scheduler.memory().values().all(|memory| memory.uploads == 0));
    Ok(())
}

#[test]
fn dumps_land_in_the_configured_directory() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("openactor-dump-{}", uuid::Uuid::new_v4()));
    let scheduler = Scheduler::new(common::config().with_dump_dir(&dir));
    scheduler.transform(&identity("dumped/set")?)?;

    let listing = fs::read_to_string(dir.join("dumped_set.actors.txt"))?;
    assert!(listing.starts_with("actor set dumped/set (5 actors)"));
    assert!(listing.contains("store w@cpu:0 -> [0]1"));
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(dir.join("dumped_set.actors.json"))?)?;
    assert_eq!(json["actors"].as_array().map(Vec::len), Some(5));

    let program = linearize(&crate::linearized::factorial()?)?;
    let path = scheduler.dump_program(&program)?.expect("dump directory is set");
    assert!(fs::read_to_string(path)?.contains("push"));

    let quiet = common::scheduler();
    assert!(quiet.dump_program(&program)?.is_none());
    fs::remove_dir_all(&dir)?;
    Ok(())
}
