//! Core graph data types.
//!
//! A compiled graph is a set of kernel graphs, each pinned to one device,
//! plus the call sites that connect them. Root graphs run every iteration;
//! branch graphs run only when a call site selects them.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::SharedDevice;
use crate::ops::OpDescriptor;
use crate::tensor::TensorValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub graph: GraphId,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub usize);

impl NodeId {
    pub fn out(self, output: usize) -> ValueRef {
        ValueRef::Node { node: self, output }
    }
}

impl CallId {
    pub fn out(self, output: usize) -> ValueRef {
        ValueRef::Call { call: self, output }
    }
}

/// Reference to one output of a node or of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueRef {
    Node { node: NodeId, output: usize },
    Call { call: CallId, output: usize },
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueRef::Node { node, output } => {
                write!(f, "g{}.n{}:{}", node.graph.0, node.index, output)
            }
            ValueRef::Call { call, output } => write!(f, "call{}:{}", call.0, output),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ParameterKind {
    /// Per-iteration host input at this position of the run inputs.
    Input { position: usize },
    /// Persistent tensor uploaded once into the device tensor store.
    Weight { value: TensorValue },
    /// Argument slot of a branch graph, filled by its call site.
    Formal { position: usize },
}

#[derive(Debug, Clone)]
pub struct KernelNode {
    pub op: OpDescriptor,
    pub inputs: Vec<ValueRef>,
    /// Nodes of the same graph that must have run first.
    pub after: Vec<NodeId>,
    /// Optimized away: output 0 aliases input 0 and no actor is built.
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Parameter(ParameterKind),
    /// Constant folded into the graph; stored like a weight.
    Value(TensorValue),
    Kernel(KernelNode),
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
}

impl GraphNode {
    pub fn output_count(&self) -> usize {
        match &self.kind {
            NodeKind::Kernel(kernel) if !kernel.skipped => kernel.op.outputs.len(),
            _ => 1,
        }
    }

    /// Value backing a device tensor store entry, if this node is persistent.
    pub fn persistent_value(&self) -> Option<&TensorValue> {
        match &self.kind {
            NodeKind::Parameter(ParameterKind::Weight { value }) | NodeKind::Value(value) => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn kernel(&self) -> Option<&KernelNode> {
        match &self.kind {
            NodeKind::Kernel(kernel) => Some(kernel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KernelGraph {
    pub id: GraphId,
    pub name: String,
    pub device: SharedDevice,
    pub nodes: Vec<GraphNode>,
    /// Values returned to the call site when this graph is a branch.
    pub results: Vec<ValueRef>,
}

impl KernelGraph {
    pub fn formal_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node.kind, NodeKind::Parameter(ParameterKind::Formal { .. })))
            .count()
    }

    pub fn has_inputs(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| matches!(node.kind, NodeKind::Parameter(ParameterKind::Input { .. })))
    }

    pub fn kernels(&self) -> impl Iterator<Item = (&GraphNode, &KernelNode)> {
        self.nodes
            .iter()
            .filter_map(|node| node.kernel().map(|kernel| (node, kernel)))
    }
}

#[derive(Debug, Clone)]
pub struct CallBranch {
    pub graph: GraphId,
    pub args: Vec<ValueRef>,
}

/// Call of one branch graph out of `branches`, selected by `cond`.
///
/// A plain call has one branch and no condition.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub id: CallId,
    pub name: String,
    pub caller: GraphId,
    /// Number of caller nodes that existed when the call was added.
    pub position: usize,
    pub cond: Option<ValueRef>,
    pub branches: Vec<CallBranch>,
    pub outputs: usize,
}

impl CallSite {
    /// References read by the call site itself, condition first.
    pub fn operands(&self) -> impl Iterator<Item = &ValueRef> {
        self.cond
            .iter()
            .chain(self.branches.iter().flat_map(|branch| branch.args.iter()))
    }
}

#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub name: String,
    pub graphs: Vec<KernelGraph>,
    pub calls: Vec<CallSite>,
    pub outputs: Vec<ValueRef>,
    /// Default iteration count when the run inputs do not override it.
    pub loop_count: usize,
}

impl CompiledGraph {
    pub fn graph(&self, id: GraphId) -> Option<&KernelGraph> {
        self.graphs.get(id.0)
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.graph(id.graph)?.nodes.get(id.index)
    }

    pub fn call(&self, id: CallId) -> Option<&CallSite> {
        self.calls.get(id.0)
    }

    /// Number of per-iteration host inputs the graph reads.
    pub fn input_count(&self) -> usize {
        self.graphs
            .iter()
            .flat_map(|graph| graph.nodes.iter())
            .filter_map(|node| match node.kind {
                NodeKind::Parameter(ParameterKind::Input { position }) => Some(position + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn kernel_count(&self) -> usize {
        self.graphs.iter().map(|graph| graph.kernels().count()).sum()
    }
}
