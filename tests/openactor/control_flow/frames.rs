use std::sync::Arc;

use anyhow::Result;
use openactor::{CallFrameArena, CallSiteId, Slot, TensorValue};
use proptest::prelude::*;

fn value(n: i64) -> Arc<TensorValue> {
    Arc::new(TensorValue::scalar(n))
}

proptest! {
    #[test]
    fn frames_pop_in_reverse_push_order(sites in prop::collection::vec((0usize..3, 0usize..4), 1..48)) {
        let mut arena = CallFrameArena::new(64);
        let mut pushed = Vec::new();
        for (n, (site, slot)) in sites.iter().enumerate() {
            let (index, tag) = arena.push(CallSiteId(*site), Slot(*slot), value(n as i64)).unwrap();
            prop_assert_eq!(index.0, n);
            prop_assert_eq!(arena.tag(index), Some(tag));
            if let Some((_, last)) = pushed.last() {
                prop_assert!(tag > *last);
            }
            pushed.push((n, tag));
        }
        prop_assert_eq!(arena.depth(), sites.len());

        for (site, slot) in sites.iter().rev() {
            let (n, tag) = pushed.pop().unwrap();
            let popped = arena.pop(CallSiteId(*site), Slot(*slot)).unwrap();
            prop_assert_eq!(popped.tag, tag);
            prop_assert_eq!(popped.index.0, n);
            prop_assert_eq!(popped.value.as_ref(), &TensorValue::scalar(n as i64));
        }
        prop_assert!(arena.is_empty());
    }

    #[test]
    fn tags_keep_growing_after_pops(rounds in 1usize..10, depth in 1usize..8) {
        let mut arena = CallFrameArena::new(depth);
        let mut last = None;
        for _ in 0..rounds {
            for level in 0..depth {
                let (_, tag) = arena.push(CallSiteId(0), Slot(level), value(level as i64)).unwrap();
                prop_assert!(last.map_or(true, |last| tag > last));
                last = Some(tag);
            }
            for level in (0..depth).rev() {
                arena.pop(CallSiteId(0), Slot(level)).unwrap();
            }
        }
        prop_assert_eq!(last, Some((rounds * depth - 1) as u64));
    }
}

#[test]
fn mismatched_pop_is_an_imbalance() -> Result<()> {
    let mut arena = CallFrameArena::new(4);
    arena.push(CallSiteId(1), Slot(2), value(7))?;
    let err = arena.pop(CallSiteId(1), Slot(3)).unwrap_err();
    assert!(err.to_string().contains("stack imbalance"), "{err}");
    assert_eq!(arena.depth(), 1);

    arena.pop(CallSiteId(1), Slot(2))?;
    let err = arena.pop(CallSiteId(1), Slot(2)).unwrap_err();
    assert!(err.to_string().contains("empty arena"), "{err}");
    Ok(())
}

#[test]
fn full_arena_refuses_pushes() -> Result<()> {
    let mut arena = CallFrameArena::new(2);
    arena.push(CallSiteId(0), Slot(0), value(1))?;
    arena.push(CallSiteId(0), Slot(0), value(2))?;
    let err = arena.push(CallSiteId(0), Slot(0), value(3)).unwrap_err();
    assert!(err.to_string().contains("exhausted (2 frames)"), "{err}");
    assert_eq!(arena.capacity(), 2);
    assert_eq!(arena.depth(), 2);
    Ok(())
}
