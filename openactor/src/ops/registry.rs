use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;

use super::host::{BinaryKind, BinaryOp, CompareKind, CompareOp, CopyOp};
use super::Operation;

/// A built-in host kernel and its arity.
#[derive(Debug, Clone)]
pub struct HostOpEntry {
    pub op: Arc<dyn Operation>,
    pub inputs: usize,
    pub outputs: usize,
}

fn entry(op: impl Operation + 'static, inputs: usize) -> HostOpEntry {
    HostOpEntry {
        op: Arc::new(op),
        inputs,
        outputs: 1,
    }
}

static HOST_OPS: Lazy<BTreeMap<&'static str, HostOpEntry>> = Lazy::new(|| {
    let mut ops = BTreeMap::new();
    ops.insert("copy", entry(CopyOp, 1));
    ops.insert("add", entry(BinaryOp::new(BinaryKind::Add), 2));
    ops.insert("sub", entry(BinaryOp::new(BinaryKind::Sub), 2));
    ops.insert("mul", entry(BinaryOp::new(BinaryKind::Mul), 2));
    ops.insert("lt", entry(CompareOp::new(CompareKind::Lt), 2));
    ops.insert("le", entry(CompareOp::new(CompareKind::Le), 2));
    ops.insert("gt", entry(CompareOp::new(CompareKind::Gt), 2));
    ops.insert("ge", entry(CompareOp::new(CompareKind::Ge), 2));
    ops.insert("eq", entry(CompareOp::new(CompareKind::Eq), 2));
    ops
});

/// Look up a shared host kernel by name.
pub fn host_op(name: &str) -> Result<&'static HostOpEntry> {
    HOST_OPS
        .get(name)
        .ok_or_else(|| anyhow!("unknown host op: {}", name))
}

pub fn host_op_names() -> Vec<&'static str> {
    HOST_OPS.keys().copied().collect()
}
