//! Unpacking of the attribute-getter placeholder that carries a quantized convolution's packed
//! parameters.
//!
//! The placeholder is a `frameworkNode` operation tagged with `opType = "prim::GetAttr"`. Its six
//! inputs are, in order: weight, bias, strides, padding, dilations, groups.

use crate::error::GraphError;
use crate::graph::{GraphInfo, OperandKind, Operation};

pub const FRAMEWORK_NODE: &str = "frameworkNode";
pub const OP_TYPE_KEY: &str = "opType";
pub const ATTRIBUTE_GETTER: &str = "prim::GetAttr";
pub const PACKED_FIELD_COUNT: usize = 6;

const FIELD_NAMES: [&str; PACKED_FIELD_COUNT] =
    ["weight", "bias", "strides", "padding", "dilations", "groups"];

/// Convolution hyperparameters read from a packed-params bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvParams {
    pub strides: Vec<u64>,
    /// Applied to both the leading and trailing edge of each spatial axis.
    pub padding: Vec<i64>,
    pub dilations: Vec<u64>,
    pub groups: i64,
}

impl ConvParams {
    pub fn spatial_rank(&self) -> usize {
        self.strides.len()
    }

    /// Appends a neutral trailing spatial entry (stride 1, no padding, dilation 1).
    pub(crate) fn with_trailing_unit_axis(&self) -> Self {
        let mut params = self.clone();
        params.strides.push(1);
        params.padding.push(0);
        params.dilations.push(1);
        params
    }
}

/// Weight and bias operands plus hyperparameters of one packed bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedParams {
    pub weight: u32,
    pub bias: u32,
    pub conv: ConvParams,
}

/// Returns the operator-identity tag of a framework placeholder, if `op` is one.
pub fn framework_tag(op: &Operation) -> Option<&str> {
    if op.op_type != FRAMEWORK_NODE {
        return None;
    }
    op.str_attr(OP_TYPE_KEY)
}

/// Resolves `packed` to its placeholder and reads the six packed fields.
///
/// Only reads the graph. Weight and bias are returned as operand ids without evaluating them.
pub fn unpack_packed_params(graph: &GraphInfo, packed: u32) -> Result<PackedParams, GraphError> {
    let node = graph.producer(packed).ok_or_else(|| {
        GraphError::malformed(format!(
            "operand {} is not produced by a {} placeholder",
            packed, FRAMEWORK_NODE
        ))
    })?;
    if node.op_type != FRAMEWORK_NODE {
        return Err(GraphError::malformed(format!(
            "packed params come from `{}`, expected {}",
            node.op_type, FRAMEWORK_NODE
        )));
    }
    let tag = framework_tag(node).ok_or_else(|| {
        GraphError::malformed("placeholder does not carry an operator type attribute")
    })?;
    if tag != ATTRIBUTE_GETTER {
        return Err(GraphError::malformed(format!(
            "placeholder operator type is `{}`, expected {}",
            tag, ATTRIBUTE_GETTER
        )));
    }

    let fields = &node.input_operands;
    if fields.len() != PACKED_FIELD_COUNT {
        return Err(GraphError::malformed(format!(
            "expected {} packed fields, found {}",
            PACKED_FIELD_COUNT,
            fields.len()
        )));
    }

    let strides = unsigned_field(graph, fields, 2)?;
    let padding = integer_field(graph, fields, 3)?;
    let dilations = unsigned_field(graph, fields, 4)?;
    let groups = *integer_field(graph, fields, 5)?
        .first()
        .ok_or_else(|| GraphError::malformed("groups field is empty"))?;
    if groups < 1 {
        return Err(GraphError::malformed(format!(
            "groups must be at least 1, got {}",
            groups
        )));
    }
    if strides.len() != padding.len() || strides.len() != dilations.len() {
        return Err(GraphError::malformed(format!(
            "strides {:?}, padding {:?} and dilations {:?} disagree on spatial rank",
            strides, padding, dilations
        )));
    }

    let params = PackedParams {
        weight: fields[0],
        bias: fields[1],
        conv: ConvParams {
            strides,
            padding,
            dilations,
            groups,
        },
    };
    log::debug!(
        "Unpacked {} params: weight={} bias={} {:?}",
        node.display_name(),
        params.weight,
        params.bias,
        params.conv
    );
    Ok(params)
}

fn integer_field(graph: &GraphInfo, fields: &[u32], index: usize) -> Result<Vec<i64>, GraphError> {
    let name = FIELD_NAMES[index];
    let id = fields[index];
    let operand = graph.operand(id).ok_or_else(|| {
        GraphError::malformed(format!("{} field refers to missing operand {}", name, id))
    })?;
    if operand.kind != OperandKind::Constant || graph.constant(id).is_none() {
        return Err(GraphError::malformed(format!(
            "{} field (operand {}) is not a constant",
            name, id
        )));
    }
    if !operand.descriptor.data_type.is_integer() {
        return Err(GraphError::malformed(format!(
            "{} field has element type {:?}, expected an integer type",
            name, operand.descriptor.data_type
        )));
    }
    graph
        .constant_i64s(id)
        .map_err(|err| GraphError::malformed(format!("{} field: {}", name, err)))
}

fn unsigned_field(graph: &GraphInfo, fields: &[u32], index: usize) -> Result<Vec<u64>, GraphError> {
    integer_field(graph, fields, index)?
        .into_iter()
        .map(|v| {
            u64::try_from(v).map_err(|_| {
                GraphError::malformed(format!(
                    "{} field holds negative value {}",
                    FIELD_NAMES[index], v
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DataType, Operand, OperandDescriptor};

    fn placeholder(graph: &mut GraphInfo, tag: Option<&str>, fields: Vec<u32>) -> u32 {
        let out = graph.push_operand(Operand::new(
            OperandKind::Intermediate,
            OperandDescriptor::new(DataType::Float32, vec![]),
        ));
        let attributes = match tag {
            Some(tag) => serde_json::json!({ "opType": tag }),
            None => serde_json::json!({}),
        };
        graph.push_operation(Operation {
            op_type: FRAMEWORK_NODE.to_string(),
            input_operands: fields,
            output_operand: Some(out),
            attributes,
            label: Some("packed".to_string()),
        });
        out
    }

    fn fields(graph: &mut GraphInfo, groups: i64) -> Vec<u32> {
        let weight = graph.add_f32_constant("w", vec![6, 3, 3, 3], &[0.0; 162]);
        let bias = graph.add_f32_constant("b", vec![6], &[0.0; 6]);
        vec![
            weight,
            bias,
            graph.add_i64_constant("strides", vec![2], &[1, 2]),
            graph.add_i64_constant("padding", vec![2], &[1, 0]),
            graph.add_i64_constant("dilations", vec![2], &[1, 1]),
            graph.add_i64_constant("groups", vec![], &[groups]),
        ]
    }

    #[test]
    fn unpacks_all_six_fields() {
        let mut graph = GraphInfo::default();
        let f = fields(&mut graph, 1);
        let packed = placeholder(&mut graph, Some(ATTRIBUTE_GETTER), f.clone());

        let params = unpack_packed_params(&graph, packed).unwrap();
        assert_eq!(params.weight, f[0]);
        assert_eq!(params.bias, f[1]);
        assert_eq!(params.conv.strides, vec![1, 2]);
        assert_eq!(params.conv.padding, vec![1, 0]);
        assert_eq!(params.conv.dilations, vec![1, 1]);
        assert_eq!(params.conv.groups, 1);
        assert_eq!(params.conv.spatial_rank(), 2);
    }

    #[test]
    fn rejects_wrong_tag() {
        let mut graph = GraphInfo::default();
        let f = fields(&mut graph, 1);
        let packed = placeholder(&mut graph, Some("prim::Constant"), f);
        let err = unpack_packed_params(&graph, packed).unwrap_err();
        assert!(matches!(err, GraphError::MalformedPackedParams { .. }));
    }

    #[test]
    fn rejects_missing_tag() {
        let mut graph = GraphInfo::default();
        let f = fields(&mut graph, 1);
        let packed = placeholder(&mut graph, None, f);
        let err = unpack_packed_params(&graph, packed).unwrap_err();
        assert!(matches!(err, GraphError::MalformedPackedParams { .. }));
    }

    #[test]
    fn rejects_five_fields() {
        let mut graph = GraphInfo::default();
        let mut f = fields(&mut graph, 1);
        f.pop();
        let packed = placeholder(&mut graph, Some(ATTRIBUTE_GETTER), f);
        let err = unpack_packed_params(&graph, packed).unwrap_err();
        match err {
            GraphError::MalformedPackedParams { reason } => assert!(reason.contains("found 5")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_operand_without_producer() {
        let mut graph = GraphInfo::default();
        let x = graph.add_input("x", OperandDescriptor::new(DataType::Float32, vec![1]));
        let err = unpack_packed_params(&graph, x).unwrap_err();
        assert!(matches!(err, GraphError::MalformedPackedParams { .. }));
    }

    #[test]
    fn rejects_non_constant_hyperparameter() {
        let mut graph = GraphInfo::default();
        let mut f = fields(&mut graph, 1);
        f[2] = graph.add_input("strides", OperandDescriptor::new(DataType::Int64, vec![2]));
        let packed = placeholder(&mut graph, Some(ATTRIBUTE_GETTER), f);
        let err = unpack_packed_params(&graph, packed).unwrap_err();
        match err {
            GraphError::MalformedPackedParams { reason } => assert!(reason.contains("strides")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_float_hyperparameter_and_bad_groups() {
        let mut graph = GraphInfo::default();
        let mut f = fields(&mut graph, 1);
        f[4] = graph.add_f32_constant("dilations", vec![2], &[1.0, 1.0]);
        let packed = placeholder(&mut graph, Some(ATTRIBUTE_GETTER), f);
        assert!(unpack_packed_params(&graph, packed).is_err());

        let mut graph = GraphInfo::default();
        let f = fields(&mut graph, 0);
        let packed = placeholder(&mut graph, Some(ATTRIBUTE_GETTER), f);
        assert!(matches!(
            unpack_packed_params(&graph, packed),
            Err(GraphError::MalformedPackedParams { .. })
        ));
    }

    #[test]
    fn trailing_unit_axis_extends_every_field() {
        let params = ConvParams {
            strides: vec![2],
            padding: vec![1],
            dilations: vec![3],
            groups: 1,
        };
        let extended = params.with_trailing_unit_axis();
        assert_eq!(extended.strides, vec![2, 1]);
        assert_eq!(extended.padding, vec![1, 0]);
        assert_eq!(extended.dilations, vec![3, 1]);
    }
}
