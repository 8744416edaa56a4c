mod builder;
mod node;
mod types;

pub use builder::GraphBuilder;
pub use node::{describe_graph, describe_node};
pub use types::{
    CallBranch, CallId, CallSite, CompiledGraph, GraphId, GraphNode, KernelGraph, KernelNode,
    NodeId, NodeKind, ParameterKind, ValueRef,
};
