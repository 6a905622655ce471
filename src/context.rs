use serde_json::Value;

use crate::error::GraphError;
use crate::graph::{GraphInfo, Operand, OperandDescriptor, OperandKind, Operation, QuantizationInfo};

/// Translation context handed to a lowering rule.
///
/// Holds the source operation's ordered inputs and appends the nodes a rule creates to the
/// graph. Nothing already in the graph is modified.
pub struct NodeContext<'g> {
    graph: &'g mut GraphInfo,
    op_type: String,
    label: String,
    inputs: Vec<u32>,
    marked: Vec<usize>,
}

impl<'g> NodeContext<'g> {
    pub fn new(
        graph: &'g mut GraphInfo,
        op_type: impl Into<String>,
        label: impl Into<String>,
        inputs: Vec<u32>,
    ) -> Self {
        Self {
            graph,
            op_type: op_type.into(),
            label: label.into(),
            inputs,
            marked: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn graph(&self) -> &GraphInfo {
        &*self.graph
    }

    pub fn get_input(&self, index: usize) -> Result<u32, GraphError> {
        self.inputs
            .get(index)
            .copied()
            .ok_or_else(|| GraphError::InputCountMismatch {
                op_type: self.op_type.clone(),
                min: index + 1,
                max: index + 1,
                actual: self.inputs.len(),
            })
    }

    pub fn num_inputs_check(&self, min: usize, max: usize) -> Result<(), GraphError> {
        let actual = self.inputs.len();
        if actual < min || actual > max {
            return Err(GraphError::InputCountMismatch {
                op_type: self.op_type.clone(),
                min,
                max,
                actual,
            });
        }
        Ok(())
    }

    pub fn descriptor(&self, operand: u32) -> Result<&OperandDescriptor, GraphError> {
        Ok(&self.graph.try_operand(operand)?.descriptor)
    }

    pub fn shape(&self, operand: u32) -> Result<&[u32], GraphError> {
        Ok(&self.descriptor(operand)?.shape)
    }

    /// Appends a primitive operation writing a fresh intermediate operand and records it as
    /// created on behalf of the source operation. Returns the new operand id.
    pub fn mark_node(
        &mut self,
        op_type: &str,
        inputs: Vec<u32>,
        attributes: Value,
        output: OperandDescriptor,
    ) -> u32 {
        let output_id = self
            .graph
            .push_operand(Operand::new(OperandKind::Intermediate, output));
        let label = format!("{}/{}_{}", self.label, op_type, self.marked.len());
        let index = self.graph.push_operation(Operation {
            op_type: op_type.to_string(),
            input_operands: inputs,
            output_operand: Some(output_id),
            attributes,
            label: Some(label),
        });
        self.marked.push(index);
        output_id
    }

    /// Attaches quantization parameters to an operand created by this context.
    pub fn set_quantization(
        &mut self,
        operand: u32,
        quantization: QuantizationInfo,
    ) -> Result<(), GraphError> {
        let created = self
            .marked
            .iter()
            .any(|&idx| self.graph.operations[idx].output_operand == Some(operand));
        if !created {
            return Err(GraphError::ConversionFailed {
                op_type: self.op_type.clone(),
                reason: format!("operand {} was not created by this translation", operand),
            });
        }
        self.graph.operands[operand as usize].quantization = Some(quantization);
        Ok(())
    }

    /// Indices of the operations created through this context, in creation order.
    pub fn marked_operations(&self) -> &[usize] {
        &self.marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DataType;

    fn graph_with_input() -> (GraphInfo, u32) {
        let mut graph = GraphInfo::default();
        let x = graph.add_input("x", OperandDescriptor::new(DataType::Float32, vec![1, 2]));
        (graph, x)
    }

    #[test]
    fn num_inputs_check_reports_arity() {
        let (mut graph, x) = graph_with_input();
        let ctx = NodeContext::new(&mut graph, "quantized::conv2d", "conv", vec![x, x, x]);
        assert!(ctx.num_inputs_check(3, 3).is_ok());
        let err = ctx.num_inputs_check(4, 4).unwrap_err();
        assert!(matches!(
            err,
            GraphError::InputCountMismatch {
                min: 4,
                actual: 3,
                ..
            }
        ));
        assert!(ctx.get_input(3).is_err());
    }

    #[test]
    fn mark_node_appends_labelled_operation() {
        let (mut graph, x) = graph_with_input();
        let mut ctx = NodeContext::new(&mut graph, "relu_source", "src", vec![x]);
        let out = ctx.mark_node(
            "relu",
            vec![x],
            serde_json::json!({}),
            OperandDescriptor::new(DataType::Float32, vec![1, 2]),
        );
        assert_eq!(ctx.marked_operations(), &[0]);
        assert_eq!(ctx.shape(out).unwrap(), &[1, 2]);

        let op = &graph.operations[0];
        assert_eq!(op.op_type, "relu");
        assert_eq!(op.output_operand, Some(out));
        assert_eq!(op.label.as_deref(), Some("src/relu_0"));
        assert_eq!(graph.operands[out as usize].kind, OperandKind::Intermediate);
    }

    #[test]
    fn quantization_only_on_created_operands() {
        let (mut graph, x) = graph_with_input();
        let scale = graph.add_f32_constant("scale", vec![], &[0.5]);
        let zp = graph.add_i64_constant("zero_point", vec![], &[1]);
        let mut ctx = NodeContext::new(&mut graph, "op", "src", vec![x]);
        let info = QuantizationInfo {
            data_type: DataType::Uint8,
            scale,
            zero_point: zp,
            axis: None,
        };
        assert!(ctx.set_quantization(x, info.clone()).is_err());

        let out = ctx.mark_node(
            "cast",
            vec![x],
            serde_json::json!({"to": "uint8"}),
            OperandDescriptor::new(DataType::Uint8, vec![1, 2]),
        );
        ctx.set_quantization(out, info).unwrap();
        assert!(ctx.graph().operands[out as usize].quantization.is_some());
    }
}
