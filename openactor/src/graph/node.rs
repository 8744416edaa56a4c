use super::{CompiledGraph, GraphNode, NodeKind, ParameterKind};

pub fn describe_node(node: &GraphNode) -> String {
    match &node.kind {
        NodeKind::Parameter(ParameterKind::Input { position }) => {
            format!("input {} #{}", node.name, position)
        }
        NodeKind::Parameter(ParameterKind::Weight { value }) => {
            format!("weight {} {}", node.name, value.describe())
        }
        NodeKind::Parameter(ParameterKind::Formal { position }) => {
            format!("formal {} #{}", node.name, position)
        }
        NodeKind::Value(value) => format!("value {} {}", node.name, value.describe()),
        NodeKind::Kernel(kernel) => {
            let inputs: Vec<String> = kernel.inputs.iter().map(|input| input.to_string()).collect();
            let mut text = format!("op {}({}) >> {}", kernel.op.id, inputs.join(","), node.name);
            if kernel.skipped {
                text.push_str(" [skipped]");
            }
            if !kernel.after.is_empty() {
                let after: Vec<String> = kernel
                    .after
                    .iter()
                    .map(|id| format!("g{}.n{}", id.graph.0, id.index))
                    .collect();
                text.push_str(&format!(" after({})", after.join(",")));
            }
            text
        }
    }
}

/// Multi-line listing of every graph, node and call site.
pub fn describe_graph(graph: &CompiledGraph) -> String {
    let mut out = format!("compiled graph {} (loop count {})\n", graph.name, graph.loop_count);
    for kernel_graph in &graph.graphs {
        out.push_str(&format!(
            "graph g{} {} on {}\n",
            kernel_graph.id.0,
            kernel_graph.name,
            kernel_graph.device.id()
        ));
        for node in &kernel_graph.nodes {
            out.push_str(&format!("  n{}: {}\n", node.id.index, describe_node(node)));
        }
        if !kernel_graph.results.is_empty() {
            let results: Vec<String> = kernel_graph.results.iter().map(|r| r.to_string()).collect();
            out.push_str(&format!("  return {}\n", results.join(", ")));
        }
    }
    for call in &graph.calls {
        let branches: Vec<String> = call
            .branches
            .iter()
            .map(|branch| format!("g{}", branch.graph.0))
            .collect();
        match &call.cond {
            Some(cond) => out.push_str(&format!(
                "call{} {} in g{}: switch {} [{}]\n",
                call.id.0,
                call.name,
                call.caller.0,
                cond,
                branches.join(", ")
            )),
            None => out.push_str(&format!(
                "call{} {} in g{}: call {}\n",
                call.id.0,
                call.name,
                call.caller.0,
                branches.join(", ")
            )),
        }
    }
    let outputs: Vec<String> = graph.outputs.iter().map(|r| r.to_string()).collect();
    out.push_str(&format!("outputs {}\n", outputs.join(", ")));
    out
}
