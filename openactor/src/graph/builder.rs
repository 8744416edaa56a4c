use std::sync::Arc;

use anyhow::Result;

use crate::control_flow::LinearProgram;
use crate::device::SharedDevice;
use crate::error::SchedulerError;
use crate::ops::OpDescriptor;
use crate::tensor::TensorValue;

use super::{
    CallBranch, CallId, CallSite, CompiledGraph, GraphId, GraphNode, KernelGraph, KernelNode,
    NodeId, NodeKind, ParameterKind, ValueRef,
};

/// Incremental construction of a [`CompiledGraph`].
///
/// The builder only checks that referenced graphs exist; structural
/// validation happens when the graph is transformed into actors.
#[derive(Debug)]
pub struct GraphBuilder {
    graph: CompiledGraph,
    next_input: usize,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: CompiledGraph {
                name: name.into(),
                graphs: Vec::new(),
                calls: Vec::new(),
                outputs: Vec::new(),
                loop_count: 1,
            },
            next_input: 0,
        }
    }

    pub fn add_graph(&mut self, name: impl Into<String>, device: SharedDevice) -> GraphId {
        let id = GraphId(self.graph.graphs.len());
        self.graph.graphs.push(KernelGraph {
            id,
            name: name.into(),
            device,
            nodes: Vec::new(),
            results: Vec::new(),
        });
        id
    }

    fn graph_mut(&mut self, graph: GraphId) -> Result<&mut KernelGraph> {
        self.graph
            .graphs
            .get_mut(graph.0)
            .ok_or_else(|| SchedulerError::build(format!("unknown graph g{}", graph.0)))
    }

    fn push_node(&mut self, graph: GraphId, name: impl Into<String>, kind: NodeKind) -> Result<NodeId> {
        let target = self.graph_mut(graph)?;
        let id = NodeId {
            graph,
            index: target.nodes.len(),
        };
        target.nodes.push(GraphNode {
            id,
            name: name.into(),
            kind,
        });
        Ok(id)
    }

    /// Per-iteration host input; positions are assigned in call order.
    pub fn input(&mut self, graph: GraphId, name: impl Into<String>) -> Result<ValueRef> {
        let position = self.next_input;
        let node = self.push_node(
            graph,
            name,
            NodeKind::Parameter(ParameterKind::Input { position }),
        )?;
        self.next_input += 1;
        Ok(node.out(0))
    }

    pub fn weight(&mut self, graph: GraphId, name: impl Into<String>, value: TensorValue) -> Result<ValueRef> {
        let node = self.push_node(
            graph,
            name,
            NodeKind::Parameter(ParameterKind::Weight { value }),
        )?;
        Ok(node.out(0))
    }

    pub fn value(&mut self, graph: GraphId, name: impl Into<String>, value: TensorValue) -> Result<ValueRef> {
        let node = self.push_node(graph, name, NodeKind::Value(value))?;
        Ok(node.out(0))
    }

    /// Next argument slot of a branch graph.
    pub fn formal(&mut self, graph: GraphId, name: impl Into<String>) -> Result<ValueRef> {
        let position = self.graph_mut(graph)?.formal_count();
        let node = self.push_node(
            graph,
            name,
            NodeKind::Parameter(ParameterKind::Formal { position }),
        )?;
        Ok(node.out(0))
    }

    pub fn kernel(
        &mut self,
        graph: GraphId,
        name: impl Into<String>,
        op: OpDescriptor,
        inputs: &[ValueRef],
    ) -> Result<NodeId> {
        self.push_kernel(graph, name, op, inputs, false)
    }

    /// Kernel removed by optimization: no actor is built and output 0
    /// aliases input 0, but ordering through it is preserved.
    pub fn skipped(
        &mut self,
        graph: GraphId,
        name: impl Into<String>,
        op: OpDescriptor,
        inputs: &[ValueRef],
    ) -> Result<NodeId> {
        self.push_kernel(graph, name, op, inputs, true)
    }

    fn push_kernel(
        &mut self,
        graph: GraphId,
        name: impl Into<String>,
        op: OpDescriptor,
        inputs: &[ValueRef],
        skipped: bool,
    ) -> Result<NodeId> {
        self.push_node(
            graph,
            name,
            NodeKind::Kernel(KernelNode {
                op,
                inputs: inputs.to_vec(),
                after: Vec::new(),
                skipped,
            }),
        )
    }

    /// Kernel node executing a linearized control-flow program.
    pub fn linear_program(
        &mut self,
        graph: GraphId,
        name: impl Into<String>,
        program: Arc<LinearProgram>,
        inputs: &[ValueRef],
    ) -> Result<NodeId> {
        let name = name.into();
        let op = OpDescriptor::new(name.clone(), program.clone(), program.input_count(), 1);
        self.kernel(graph, name, op, inputs)
    }

    /// Require `later` to run after `earlier` without a data dependency.
    pub fn order(&mut self, earlier: NodeId, later: NodeId) -> Result<()> {
        let graph = self.graph_mut(later.graph)?;
        let node = graph
            .nodes
            .get_mut(later.index)
            .ok_or_else(|| SchedulerError::build(format!("unknown node g{}.n{}", later.graph.0, later.index)))?;
        match &mut node.kind {
            NodeKind::Kernel(kernel) => {
                kernel.after.push(earlier);
                Ok(())
            }
            _ => Err(SchedulerError::build(format!(
                "ordering marker on non-kernel node {}",
                node.name
            ))),
        }
    }

    /// Unconditional call of `callee`.
    pub fn call(
        &mut self,
        caller: GraphId,
        name: impl Into<String>,
        callee: GraphId,
        args: &[ValueRef],
        outputs: usize,
    ) -> Result<CallId> {
        self.push_call(caller, name, None, vec![(callee, args.to_vec())], outputs)
    }

    /// Conditional call: `cond` selects one of `branches`.
    pub fn switch(
        &mut self,
        caller: GraphId,
        name: impl Into<String>,
        cond: ValueRef,
        branches: Vec<(GraphId, Vec<ValueRef>)>,
        outputs: usize,
    ) -> Result<CallId> {
        self.push_call(caller, name, Some(cond), branches, outputs)
    }

    fn push_call(
        &mut self,
        caller: GraphId,
        name: impl Into<String>,
        cond: Option<ValueRef>,
        branches: Vec<(GraphId, Vec<ValueRef>)>,
        outputs: usize,
    ) -> Result<CallId> {
        let position = self.graph_mut(caller)?.nodes.len();
        for (graph, _) in &branches {
            self.graph_mut(*graph)?;
        }
        let id = CallId(self.graph.calls.len());
        self.graph.calls.push(CallSite {
            id,
            name: name.into(),
            caller,
            position,
            cond,
            branches: branches
                .into_iter()
                .map(|(graph, args)| CallBranch { graph, args })
                .collect(),
            outputs,
        });
        Ok(id)
    }

    pub fn set_results(&mut self, graph: GraphId, results: &[ValueRef]) -> Result<()> {
        self.graph_mut(graph)?.results = results.to_vec();
        Ok(())
    }

    /// Declare the next graph output; returns its position.
    pub fn output(&mut self, value: ValueRef) -> usize {
        self.graph.outputs.push(value);
        self.graph.outputs.len() - 1
    }

    pub fn loop_count(&mut self, count: usize) -> &mut Self {
        self.graph.loop_count = count;
        self
    }

    pub fn finish(self) -> CompiledGraph {
        self.graph
    }
}
