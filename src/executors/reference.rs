//! CPU reference evaluation of lowered graphs.
//!
//! Every tensor is held as `f32`; a cast to an integer type truncates toward zero and saturates to
//! the target range, so integer-typed operands carry exactly representable values.

use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn, Zip};

use crate::error::GraphError;
use crate::graph::{DataType, GraphInfo, OperandDescriptor, Operation};
use crate::runtime_checks::{validate_named_shapes, validate_shape_data_length};
use crate::translators::ops::{
    ADD, CAST, CLAMP, CONVOLUTION, DIV, GROUP_CONVOLUTION, MUL, RELU, RESHAPE, ROUND_EVEN, SQUEEZE,
    SUB, UNSQUEEZE,
};
use crate::translators::packed_params::FRAMEWORK_NODE;

/// Input tensor data for reference execution
#[derive(Debug, Clone)]
pub struct ReferenceInput {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Runs `graph` on named input tensors and returns its outputs by name.
///
/// Operands without a name are keyed `operand_{id}`.
pub fn run_reference(
    graph: &GraphInfo,
    inputs: HashMap<String, ArrayD<f32>>,
) -> Result<HashMap<String, ArrayD<f32>>, GraphError> {
    let descriptors = input_descriptors(graph);
    let shapes: HashMap<String, Vec<usize>> = inputs
        .iter()
        .map(|(name, value)| (name.clone(), value.shape().to_vec()))
        .collect();
    validate_named_shapes(&shapes, &descriptors)?;

    let mut values: HashMap<u32, ArrayD<f32>> = HashMap::new();
    for (&id, data) in &graph.constant_operand_ids_to_handles {
        let descriptor = &graph.try_operand(id)?.descriptor;
        let shape = dims(&descriptor.shape);
        let elements = data.to_f32s(descriptor.data_type)?;
        validate_shape_data_length(&operand_name(graph, id), &shape, elements.len())?;
        values.insert(id, tensor(shape, elements, "constant")?);
    }
    let mut inputs = inputs;
    for &id in &graph.input_operands {
        let name = operand_name(graph, id);
        let value = inputs
            .remove(&name)
            .ok_or(GraphError::RuntimeTensorMissing { name })?;
        values.insert(id, value);
    }

    for op in &graph.operations {
        if op.op_type == FRAMEWORK_NODE {
            log::debug!("Skipping placeholder {}", op.display_name());
            continue;
        }
        let Some(output) = op.output_operand else {
            continue;
        };
        let descriptor = &graph.try_operand(output)?.descriptor;
        let result = evaluate(op, descriptor, &values)?;
        values.insert(output, result);
    }

    let mut outputs = HashMap::new();
    for &id in &graph.output_operands {
        let value = values.remove(&id).ok_or_else(|| GraphError::ConversionFailed {
            op_type: "output".to_string(),
            reason: format!("output operand {} was never computed", id),
        })?;
        outputs.insert(operand_name(graph, id), value);
    }
    Ok(outputs)
}

/// Flat-buffer variant of [`run_reference`].
pub fn run_reference_with_inputs(
    graph: &GraphInfo,
    inputs: Vec<ReferenceInput>,
) -> Result<HashMap<String, ArrayD<f32>>, GraphError> {
    let mut arrays = HashMap::with_capacity(inputs.len());
    for input in inputs {
        validate_shape_data_length(&input.name, &input.shape, input.data.len())?;
        let array = tensor(input.shape, input.data, "input")?;
        arrays.insert(input.name, array);
    }
    run_reference(graph, arrays)
}

/// Runs `graph` with every input filled with zeros. Useful for checking a lowered graph end to
/// end without real data.
pub fn run_reference_zeroed(
    graph: &GraphInfo,
) -> Result<HashMap<String, ArrayD<f32>>, GraphError> {
    let inputs = input_descriptors(graph)
        .into_iter()
        .map(|(name, descriptor)| (name, ArrayD::zeros(IxDyn(&dims(&descriptor.shape)))))
        .collect();
    run_reference(graph, inputs)
}

pub fn input_descriptors(graph: &GraphInfo) -> HashMap<String, OperandDescriptor> {
    graph
        .input_operands
        .iter()
        .filter_map(|&id| {
            let operand = graph.operand(id)?;
            Some((operand_name(graph, id), operand.descriptor.clone()))
        })
        .collect()
}

fn operand_name(graph: &GraphInfo, id: u32) -> String {
    graph
        .operand(id)
        .and_then(|operand| operand.name.clone())
        .unwrap_or_else(|| format!("operand_{}", id))
}

fn dims(shape: &[u32]) -> Vec<usize> {
    shape.iter().map(|&d| d as usize).collect()
}

fn tensor(shape: Vec<usize>, data: Vec<f32>, op_type: &str) -> Result<ArrayD<f32>, GraphError> {
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|err| GraphError::ConversionFailed {
        op_type: op_type.to_string(),
        reason: err.to_string(),
    })
}

fn operand<'v>(
    op: &Operation,
    index: usize,
    values: &'v HashMap<u32, ArrayD<f32>>,
) -> Result<&'v ArrayD<f32>, GraphError> {
    let id = op
        .input_operands
        .get(index)
        .copied()
        .ok_or_else(|| GraphError::InputCountMismatch {
            op_type: op.op_type.clone(),
            min: index + 1,
            max: index + 1,
            actual: op.input_operands.len(),
        })?;
    values
        .get(&id)
        .ok_or(GraphError::InvalidConversionOperand { operand: id })
}

fn evaluate(
    op: &Operation,
    output: &OperandDescriptor,
    values: &HashMap<u32, ArrayD<f32>>,
) -> Result<ArrayD<f32>, GraphError> {
    let out_shape = dims(&output.shape);
    let x = operand(op, 0, values)?;
    match op.op_type.as_str() {
        RESHAPE | UNSQUEEZE | SQUEEZE => tensor(out_shape, x.iter().copied().collect(), &op.op_type),
        ADD => binary(op, values, &out_shape, |a, b| a + b),
        SUB => binary(op, values, &out_shape, |a, b| a - b),
        MUL => binary(op, values, &out_shape, |a, b| a * b),
        DIV => binary(op, values, &out_shape, |a, b| a / b),
        RELU => Ok(x.mapv(|v| v.max(0.0))),
        ROUND_EVEN => Ok(x.mapv(f32::round_ties_even)),
        CLAMP => {
            let min = op.f64_attr("minValue").unwrap_or(f64::NEG_INFINITY) as f32;
            let max = op.f64_attr("maxValue").unwrap_or(f64::INFINITY) as f32;
            Ok(x.mapv(|v| v.max(min).min(max)))
        }
        CAST => Ok(x.mapv(|v| cast_value(v, output.data_type))),
        CONVOLUTION | GROUP_CONVOLUTION => {
            let weight = operand(op, 1, values)?;
            convolution(op, x, weight, &out_shape)
        }
        _ => Err(GraphError::UnsupportedOperation {
            op_type: op.op_type.clone(),
        }),
    }
}

fn binary(
    op: &Operation,
    values: &HashMap<u32, ArrayD<f32>>,
    out_shape: &[usize],
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>, GraphError> {
    let shape = IxDyn(out_shape);
    let broadcast_error = |index: usize, value: &ArrayD<f32>| GraphError::ShapeInferenceFailed {
        op_type: op.op_type.clone(),
        reason: format!(
            "input {} of shape {:?} does not broadcast to {:?}",
            index,
            value.shape(),
            out_shape
        ),
    };
    let a = operand(op, 0, values)?;
    let b = operand(op, 1, values)?;
    let a_view = a
        .broadcast(shape.clone())
        .ok_or_else(|| broadcast_error(0, a))?;
    let b_view = b.broadcast(shape).ok_or_else(|| broadcast_error(1, b))?;
    Ok(Zip::from(&a_view)
        .and(&b_view)
        .map_collect(|&x, &y| f(x, y)))
}

fn cast_value(value: f32, to: DataType) -> f32 {
    match to {
        DataType::Float32 => value,
        DataType::Int8 => value as i8 as f32,
        DataType::Uint8 => value as u8 as f32,
        DataType::Int32 => value as i32 as f32,
        DataType::Uint32 => value as u32 as f32,
        DataType::Int64 => value as i64 as f32,
        DataType::Uint64 => value as u64 as f32,
    }
}

/// Direct NCHW convolution. A grouped kernel `[g, O/g, I/g, kh, kw]` is read as
/// `[O, I/g, kh, kw]`, whose output channel `o` belongs to group `o / (O/g)`.
fn convolution(
    op: &Operation,
    input: &ArrayD<f32>,
    weight: &ArrayD<f32>,
    out_shape: &[usize],
) -> Result<ArrayD<f32>, GraphError> {
    let invalid = |reason: String| GraphError::ShapeInferenceFailed {
        op_type: op.op_type.clone(),
        reason,
    };
    let (groups, kernel) = match weight.shape() {
        &[g, per_group, i, kh, kw] => (g, [g * per_group, i, kh, kw]),
        &[o, i, kh, kw] => (1, [o, i, kh, kw]),
        other => return Err(invalid(format!("unsupported kernel shape {:?}", other))),
    };
    let weight = weight
        .to_shape(IxDyn(&kernel))
        .map_err(|err| invalid(err.to_string()))?;
    if input.ndim() != 4 || out_shape.len() != 4 {
        return Err(invalid(format!(
            "expected rank-4 input and output, got {:?} and {:?}",
            input.shape(),
            out_shape
        )));
    }

    let pair = |key: &str, default: i64| -> Result<[i64; 2], GraphError> {
        match op.i64_array_attr(key).as_deref() {
            None => Ok([default, default]),
            Some(&[a, b]) => Ok([a, b]),
            Some(other) => Err(invalid(format!("`{}` must have two entries, got {:?}", key, other))),
        }
    };
    let strides = pair("strides", 1)?;
    let dilations = pair("dilations", 1)?;
    let pads = pair("padsBegin", 0)?;

    let in_channels = input.shape()[1];
    let (height, width) = (input.shape()[2] as i64, input.shape()[3] as i64);
    let [out_channels, channels_per_group, kernel_h, kernel_w] = kernel;
    if out_shape[1] != out_channels || in_channels != channels_per_group * groups {
        return Err(invalid(format!(
            "input {:?} and kernel {:?} disagree on channels",
            input.shape(),
            kernel
        )));
    }
    let outputs_per_group = out_channels / groups;

    let mut output = ArrayD::<f32>::zeros(IxDyn(out_shape));
    for n in 0..out_shape[0] {
        for oc in 0..out_channels {
            let group = oc / outputs_per_group;
            for oh in 0..out_shape[2] {
                for ow in 0..out_shape[3] {
                    let mut sum = 0.0f32;
                    for ic in 0..channels_per_group {
                        let channel = group * channels_per_group + ic;
                        for kh in 0..kernel_h {
                            let ih = oh as i64 * strides[0] + kh as i64 * dilations[0] - pads[0];
                            if ih < 0 || ih >= height {
                                continue;
                            }
                            for kw in 0..kernel_w {
                                let iw =
                                    ow as i64 * strides[1] + kw as i64 * dilations[1] - pads[1];
                                if iw < 0 || iw >= width {
                                    continue;
                                }
                                sum += input[[n, channel, ih as usize, iw as usize]]
                                    * weight[[oc, ic, kh, kw]];
                            }
                        }
                    }
                    output[[n, oc, oh, ow]] = sum;
                }
            }
        }
    }
    Ok(output)
}
