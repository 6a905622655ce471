//! Emitters for the primitive nodes shared by the lowering rules. Each one runs shape inference
//! first and only then appends the node.

use serde_json::json;

use crate::context::NodeContext;
use crate::error::GraphError;
use crate::graph::{DataType, OperandDescriptor};
use crate::shape_inference::{
    broadcast_shapes, infer_reshape_shape, infer_squeeze_shape, infer_unsqueeze_shape,
};

pub const RESHAPE: &str = "reshape";
pub const UNSQUEEZE: &str = "unsqueeze";
pub const SQUEEZE: &str = "squeeze";
pub const CONVOLUTION: &str = "convolution";
pub const GROUP_CONVOLUTION: &str = "groupConvolution";
pub const ADD: &str = "add";
pub const SUB: &str = "sub";
pub const MUL: &str = "mul";
pub const DIV: &str = "div";
pub const RELU: &str = "relu";
pub const ROUND_EVEN: &str = "roundEven";
pub const CLAMP: &str = "clamp";
pub const CAST: &str = "cast";

/// Create a reshape node. Returns the reshaped operand.
pub fn reshape(ctx: &mut NodeContext, input: u32, new_shape: Vec<u32>) -> Result<u32, GraphError> {
    let descriptor = ctx.descriptor(input)?;
    let data_type = descriptor.data_type;
    let shape = infer_reshape_shape(&descriptor.shape, &new_shape)?;
    Ok(ctx.mark_node(
        RESHAPE,
        vec![input],
        json!({ "newShape": new_shape }),
        OperandDescriptor::new(data_type, shape),
    ))
}

pub fn unsqueeze(ctx: &mut NodeContext, input: u32, axes: &[u32]) -> Result<u32, GraphError> {
    let descriptor = ctx.descriptor(input)?;
    let data_type = descriptor.data_type;
    let shape = infer_unsqueeze_shape(&descriptor.shape, axes)?;
    Ok(ctx.mark_node(
        UNSQUEEZE,
        vec![input],
        json!({ "axes": axes }),
        OperandDescriptor::new(data_type, shape),
    ))
}

pub fn squeeze(ctx: &mut NodeContext, input: u32, axes: &[u32]) -> Result<u32, GraphError> {
    let descriptor = ctx.descriptor(input)?;
    let data_type = descriptor.data_type;
    let shape = infer_squeeze_shape(&descriptor.shape, axes)?;
    Ok(ctx.mark_node(
        SQUEEZE,
        vec![input],
        json!({ "axes": axes }),
        OperandDescriptor::new(data_type, shape),
    ))
}

/// Elementwise binary node with broadcasting. The output takes the left operand's type.
pub fn binary(ctx: &mut NodeContext, op_type: &str, a: u32, b: u32) -> Result<u32, GraphError> {
    let lhs = ctx.descriptor(a)?;
    let data_type = lhs.data_type;
    let shape = broadcast_shapes(&lhs.shape, ctx.shape(b)?)?;
    Ok(ctx.mark_node(
        op_type,
        vec![a, b],
        json!({}),
        OperandDescriptor::new(data_type, shape),
    ))
}

pub fn unary(ctx: &mut NodeContext, op_type: &str, input: u32) -> Result<u32, GraphError> {
    let descriptor = ctx.descriptor(input)?.clone();
    Ok(ctx.mark_node(op_type, vec![input], json!({}), descriptor))
}

pub fn clamp(ctx: &mut NodeContext, input: u32, min: f64, max: f64) -> Result<u32, GraphError> {
    let descriptor = ctx.descriptor(input)?.clone();
    Ok(ctx.mark_node(
        CLAMP,
        vec![input],
        json!({ "minValue": min, "maxValue": max }),
        descriptor,
    ))
}

/// Create a cast node, or return `input` when it already has `to`'s type.
pub fn cast(ctx: &mut NodeContext, input: u32, to: DataType) -> Result<u32, GraphError> {
    let descriptor = ctx.descriptor(input)?;
    if descriptor.data_type == to {
        return Ok(input);
    }
    let shape = descriptor.shape.clone();
    Ok(ctx.mark_node(
        CAST,
        vec![input],
        json!({ "to": to }),
        OperandDescriptor::new(to, shape),
    ))
}
