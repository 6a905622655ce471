use std::fmt::Write;

use crate::graph::{GraphInfo, OperandKind};

/// Renders the graph as Graphviz DOT: one box per operation, one ellipse per graph input,
/// output and constant, and one edge per operand flowing between them.
pub fn graph_to_dot(graph: &GraphInfo) -> String {
    let mut dot = String::new();
    let _ = render(graph, &mut dot);
    dot
}

fn render(graph: &GraphInfo, dot: &mut String) -> std::fmt::Result {
    writeln!(dot, "digraph G {{")?;
    writeln!(dot, "  rankdir=TB;")?;

    let mut producers = std::collections::HashMap::new();
    for (idx, op) in graph.operations.iter().enumerate() {
        let name = escape(&op.display_name());
        writeln!(dot, r#"  op{} [shape=box, label="{}\n{}"];"#, idx, escape(&op.op_type), name)?;
        if let Some(out) = op.output_operand {
            producers.insert(out, idx);
        }
    }

    for (id, operand) in graph.operands.iter().enumerate() {
        let id = id as u32;
        let is_output = graph.output_operands.contains(&id);
        let is_source = matches!(operand.kind, OperandKind::Input | OperandKind::Constant)
            && graph.is_consumed(id);
        if !is_output && !is_source {
            continue;
        }
        let name = operand
            .name
            .clone()
            .unwrap_or_else(|| format!("operand_{}", id));
        let style = if operand.quantization.is_some() {
            ", style=dashed"
        } else {
            ""
        };
        writeln!(
            dot,
            r#"  v{} [shape=ellipse{}, label="{}\n{:?} {:?}"];"#,
            id,
            style,
            escape(&name),
            operand.descriptor.data_type,
            operand.descriptor.shape
        )?;
        if let Some(&producer) = producers.get(&id) {
            writeln!(dot, "  op{} -> v{};", producer, id)?;
        }
    }

    for (idx, op) in graph.operations.iter().enumerate() {
        for &input in &op.input_operands {
            match producers.get(&input) {
                Some(&producer) => writeln!(dot, "  op{} -> op{};", producer, idx)?,
                None => writeln!(dot, "  v{} -> op{};", input, idx)?,
            }
        }
    }

    writeln!(dot, "}}")
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DataType, Operand, OperandDescriptor, Operation};

    #[test]
    fn renders_operations_and_edges() {
        let mut graph = GraphInfo::default();
        let desc = OperandDescriptor::new(DataType::Float32, vec![2]);
        let x = graph.add_input("x", desc.clone());
        let y = graph.push_operand(Operand::new(OperandKind::Output, desc).named("y"));
        graph.output_operands.push(y);
        graph.push_operation(Operation {
            op_type: "relu".to_string(),
            input_operands: vec![x],
            output_operand: Some(y),
            attributes: serde_json::json!({}),
            label: Some("act".to_string()),
        });

        let dot = graph_to_dot(&graph);
        assert!(dot.starts_with("digraph G {"));
        assert!(dot.contains(r#"op0 [shape=box, label="relu\nact"];"#));
        assert!(dot.contains("v0 -> op0;"));
        assert!(dot.contains("op0 -> v1;"));
        assert!(dot.trim_end().ends_with('}'));
    }
}
