//! Affine quantization boundaries, emitted as primitive nodes so later passes can fuse or fold
//! them.

use crate::context::NodeContext;
use crate::error::GraphError;
use crate::graph::{DataType, GraphInfo, QuantizationInfo};
use crate::shape_inference::channelwise_shape;
use crate::translators::ops::{self, ADD, DIV, MUL, ROUND_EVEN, SUB};

/// Saturation bounds of a quantized storage type. `None` means no clamp is emitted.
pub fn storage_bounds(data_type: DataType) -> Result<Option<(f64, f64)>, GraphError> {
    match data_type {
        DataType::Int8 => Ok(Some((i8::MIN as f64, i8::MAX as f64))),
        DataType::Uint8 => Ok(Some((u8::MIN as f64, u8::MAX as f64))),
        DataType::Int32 => Ok(None),
        _ => Err(GraphError::UnsupportedQuantizedType { data_type }),
    }
}

/// Storage type used for quantized values that follow `reference`.
pub fn storage_type(graph: &GraphInfo, reference: u32) -> Result<DataType, GraphError> {
    let operand = graph.try_operand(reference)?;
    let data_type = match &operand.quantization {
        Some(info) => info.data_type,
        None => operand.descriptor.data_type,
    };
    storage_bounds(data_type)?;
    Ok(data_type)
}

/// Length of a scale or zero point: `None` for a scalar, `Some(len)` for a vector.
fn param_len(graph: &GraphInfo, param: u32) -> Result<Option<u32>, GraphError> {
    match graph.try_operand(param)?.descriptor.shape.as_slice() {
        [] => Ok(None),
        &[len] => Ok(Some(len)),
        shape => Err(GraphError::shape(
            "quantize",
            format!("quantization parameter {} has shape {:?}", param, shape),
        )),
    }
}

/// Axis along which vector parameters apply to a tensor of `shape`, or `None` when every
/// parameter is a scalar. Vector parameters need an axis whose extent matches their length.
fn parameter_axis(
    graph: &GraphInfo,
    shape: &[u32],
    params: [u32; 2],
    axis: Option<u32>,
) -> Result<Option<u32>, GraphError> {
    let mut lens = Vec::with_capacity(params.len());
    for param in params {
        lens.extend(param_len(graph, param)?);
    }
    if lens.is_empty() {
        return Ok(None);
    }
    let axis = axis.ok_or_else(|| {
        GraphError::shape("quantize", "per-axis parameters need a quantization axis")
    })?;
    let extent = shape.get(axis as usize).copied().ok_or_else(|| {
        GraphError::shape(
            "quantize",
            format!("axis {} is out of range for shape {:?}", axis, shape),
        )
    })?;
    if let Some(len) = lens.into_iter().find(|&len| len != extent) {
        return Err(GraphError::shape(
            "quantize",
            format!(
                "{} per-axis parameters do not match extent {} of axis {}",
                len, extent, axis
            ),
        ));
    }
    Ok(Some(axis))
}

/// Checks a requantization of a `value_shape` tensor without emitting anything. Returns the
/// storage type and, for vector parameters, the axis taken from `reference`.
pub fn requantization(
    graph: &GraphInfo,
    value_shape: &[u32],
    scale: u32,
    zero_point: u32,
    reference: u32,
) -> Result<(DataType, Option<u32>), GraphError> {
    let data_type = storage_type(graph, reference)?;
    let axis = graph
        .try_operand(reference)?
        .quantization
        .as_ref()
        .and_then(|info| info.axis);
    let axis = parameter_axis(graph, value_shape, [scale, zero_point], axis)?;
    Ok((data_type, axis))
}

/// Quantization info of `operand` when it holds raw integers that need a dequantize chain.
pub fn dequantization(
    graph: &GraphInfo,
    operand: u32,
) -> Result<Option<QuantizationInfo>, GraphError> {
    let operand_info = graph.try_operand(operand)?;
    let Some(info) = operand_info.quantization.clone() else {
        return Ok(None);
    };
    if operand_info.descriptor.data_type != info.data_type {
        return Ok(None);
    }
    storage_bounds(info.data_type)?;
    parameter_axis(
        graph,
        &operand_info.descriptor.shape,
        [info.scale, info.zero_point],
        info.axis,
    )?;
    Ok(Some(info))
}

/// Requantizes a floating tensor:
/// `y = cast(clamp(roundEven(value / scale) + zero_point, qmin, qmax))`.
///
/// The storage type and, for per-axis parameters, the quantization axis come from `reference`.
/// Per-axis parameters are laid out along that axis before they are applied.
pub fn quantize(
    ctx: &mut NodeContext,
    value: u32,
    scale: u32,
    zero_point: u32,
    reference: u32,
) -> Result<u32, GraphError> {
    let value_shape = ctx.shape(value)?.to_vec();
    let (data_type, axis) =
        requantization(ctx.graph(), &value_shape, scale, zero_point, reference)?;
    let bounds = storage_bounds(data_type)?;
    let rank = value_shape.len();

    let value = ops::cast(ctx, value, DataType::Float32)?;
    let aligned_scale = align_to_axis(ctx, scale, rank, axis)?;
    let scale_f32 = ops::cast(ctx, aligned_scale, DataType::Float32)?;
    let scaled = ops::binary(ctx, DIV, value, scale_f32)?;
    let rounded = ops::unary(ctx, ROUND_EVEN, scaled)?;
    let aligned_zero_point = align_to_axis(ctx, zero_point, rank, axis)?;
    let zero_point_f32 = ops::cast(ctx, aligned_zero_point, DataType::Float32)?;
    let mut shifted = ops::binary(ctx, ADD, rounded, zero_point_f32)?;
    if let Some((min, max)) = bounds {
        shifted = ops::clamp(ctx, shifted, min, max)?;
    }
    let quantized = ops::cast(ctx, shifted, data_type)?;
    ctx.set_quantization(
        quantized,
        QuantizationInfo {
            data_type,
            scale,
            zero_point,
            axis,
        },
    )?;
    log::debug!(
        "Quantized operand {} into {} ({:?}, scale={}, zero_point={})",
        value,
        quantized,
        data_type,
        scale,
        zero_point
    );
    Ok(quantized)
}

/// Returns a floating view of `operand`.
///
/// Operands stored as quantized integers become `(cast(x) - zero_point) * scale`; anything else
/// is returned unchanged.
pub fn dequantize(ctx: &mut NodeContext, operand: u32) -> Result<u32, GraphError> {
    let Some(info) = dequantization(ctx.graph(), operand)? else {
        return Ok(operand);
    };

    let rank = ctx.shape(operand)?.len();
    let scale = align_to_axis(ctx, info.scale, rank, info.axis)?;
    let zero_point = align_to_axis(ctx, info.zero_point, rank, info.axis)?;

    let value = ops::cast(ctx, operand, DataType::Float32)?;
    let zero_point = ops::cast(ctx, zero_point, DataType::Float32)?;
    let scale = ops::cast(ctx, scale, DataType::Float32)?;
    let centered = ops::binary(ctx, SUB, value, zero_point)?;
    ops::binary(ctx, MUL, centered, scale)
}

/// Reshapes a rank-1 per-axis parameter so it broadcasts along `axis` of a rank-`rank` tensor.
fn align_to_axis(
    ctx: &mut NodeContext,
    param: u32,
    rank: usize,
    axis: Option<u32>,
) -> Result<u32, GraphError> {
    let len = match ctx.shape(param)? {
        &[len] => Some(len),
        _ => None,
    };
    match (axis, len) {
        (Some(axis), Some(len)) if rank > 1 => {
            let target = channelwise_shape(len, rank, axis as usize)?;
            ops::reshape(ctx, param, target)
        }
        _ => Ok(param),
    }
}
