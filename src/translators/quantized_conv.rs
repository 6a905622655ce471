//! Lowering of packed quantized convolutions (`quantized::conv1d`, `quantized::conv2d` and their
//! `_relu` variants) into convolution, bias add, optional ReLU and affine requantization.
//!
//! Every shape is derived up front in a [`ConvPlan`] so that a rule either emits its whole
//! subgraph or fails without touching the graph.

use serde_json::json;

use crate::context::NodeContext;
use crate::error::GraphError;
use crate::graph::{DataType, GraphInfo, OperandDescriptor};
use crate::shape_inference::{
    broadcast_shapes, channelwise_shape, infer_conv_shape, infer_group_kernel_shape,
    infer_squeeze_shape, infer_unsqueeze_shape,
};
use crate::translators::OpTranslator;
use crate::translators::ops::{self, ADD, CONVOLUTION, GROUP_CONVOLUTION, RELU};
use crate::translators::packed_params::{ConvParams, PackedParams, unpack_packed_params};
use crate::translators::quantize::{dequantization, dequantize, quantize, requantization};

pub const QUANTIZED_CONV2D: &str = "quantized::conv2d";
pub const QUANTIZED_CONV2D_RELU: &str = "quantized::conv2d_relu";
pub const QUANTIZED_CONV1D: &str = "quantized::conv1d";
pub const QUANTIZED_CONV1D_RELU: &str = "quantized::conv1d_relu";

/// Singleton spatial axis added to `[N, C, L]` inputs so they run as `[N, C, L, 1]`.
pub const SPATIAL_UNIT_AXIS: u32 = 3;

const CHANNEL_AXIS: usize = 1;

/// How the bias joins the convolution output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BiasLayout {
    /// Rank-1 bias reshaped to the given channel-broadcast shape.
    Channelwise(Vec<u32>),
    /// Bias added as is.
    Broadcast,
}

/// Shapes and hyperparameters of one convolution lowering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvPlan {
    pub params: ConvParams,
    /// Whether a rank-3 `[O, I, K]` weight is unsqueezed to `[O, I, K, 1]`.
    pub unsqueeze_weight: bool,
    /// Grouped-convolution kernel layout when `groups > 1`.
    pub group_kernel_shape: Option<Vec<u32>>,
    pub output_shape: Vec<u32>,
    /// Shape handed to requantization: `output_shape` without the unit axis for 1-D plans.
    pub result_shape: Vec<u32>,
    pub bias: BiasLayout,
}

impl ConvPlan {
    /// Plan for a native 2-D convolution over an `[N, C, H, W]` input.
    pub fn new(
        graph: &GraphInfo,
        input_shape: &[u32],
        packed: &PackedParams,
    ) -> Result<Self, GraphError> {
        if input_shape.len() != 4 {
            return Err(GraphError::shape(
                CONVOLUTION,
                format!("2-D convolution expects [N, C, H, W], got {:?}", input_shape),
            ));
        }
        let weight_shape = graph.try_operand(packed.weight)?.descriptor.shape.clone();
        Self::plan(graph, input_shape, weight_shape, packed.conv.clone(), packed)
    }

    /// Plan for a 1-D convolution over an `[N, C, L]` input, run as 2-D on `[N, C, L, 1]`.
    ///
    /// 1-D hyperparameters and a rank-3 weight get the same trailing unit axis as the input.
    pub fn new_1d(
        graph: &GraphInfo,
        input_shape: &[u32],
        packed: &PackedParams,
    ) -> Result<Self, GraphError> {
        if input_shape.len() != 3 {
            return Err(GraphError::shape(
                CONVOLUTION,
                format!("1-D convolution expects [N, C, L], got {:?}", input_shape),
            ));
        }
        let adapted_input = infer_unsqueeze_shape(input_shape, &[SPATIAL_UNIT_AXIS])?;

        let params = match packed.conv.spatial_rank() {
            1 => packed.conv.with_trailing_unit_axis(),
            2 => packed.conv.clone(),
            rank => {
                return Err(GraphError::malformed(format!(
                    "1-D convolution params have {} spatial entries",
                    rank
                )));
            }
        };

        let weight_shape = &graph.try_operand(packed.weight)?.descriptor.shape;
        let (weight_shape, unsqueeze_weight) = match weight_shape.len() {
            3 => (infer_unsqueeze_shape(weight_shape, &[SPATIAL_UNIT_AXIS])?, true),
            4 => (weight_shape.clone(), false),
            rank => {
                return Err(GraphError::shape(
                    CONVOLUTION,
                    format!("1-D convolution weight has rank {}", rank),
                ));
            }
        };

        let mut plan = Self::plan(graph, &adapted_input, weight_shape, params, packed)?;
        plan.unsqueeze_weight = unsqueeze_weight;
        plan.result_shape = infer_squeeze_shape(&plan.output_shape, &[SPATIAL_UNIT_AXIS])?;
        Ok(plan)
    }

    fn plan(
        graph: &GraphInfo,
        input_shape: &[u32],
        weight_shape: Vec<u32>,
        params: ConvParams,
        packed: &PackedParams,
    ) -> Result<Self, GraphError> {
        dequantization(graph, packed.weight)?;
        dequantization(graph, packed.bias)?;
        let group_kernel_shape = if params.groups > 1 {
            Some(infer_group_kernel_shape(&weight_shape, params.groups)?)
        } else {
            None
        };
        let output_shape = infer_conv_shape(
            input_shape,
            &weight_shape,
            &params.strides,
            &params.padding,
            &params.dilations,
            params.groups,
        )?;
        let bias = bias_layout(&graph.try_operand(packed.bias)?.descriptor.shape, &output_shape)?;

        Ok(Self {
            params,
            unsqueeze_weight: false,
            group_kernel_shape,
            result_shape: output_shape.clone(),
            output_shape,
            bias,
        })
    }
}

/// Rank-1 biases are laid out along the channel axis of the convolution output; other ranks must
/// already broadcast against it.
pub fn bias_layout(bias_shape: &[u32], output_shape: &[u32]) -> Result<BiasLayout, GraphError> {
    if let &[len] = bias_shape {
        let target = channelwise_shape(len, output_shape.len(), CHANNEL_AXIS)?;
        broadcast_shapes(output_shape, &target)?;
        return Ok(BiasLayout::Channelwise(target));
    }
    let unsupported = || GraphError::UnsupportedBiasRank {
        rank: bias_shape.len(),
        bias_shape: bias_shape.to_vec(),
        output_shape: output_shape.to_vec(),
    };
    let broadcast = broadcast_shapes(output_shape, bias_shape).map_err(|_| unsupported())?;
    if broadcast != output_shape {
        return Err(unsupported());
    }
    Ok(BiasLayout::Broadcast)
}

fn conv_attributes(params: &ConvParams) -> serde_json::Value {
    json!({
        "strides": params.strides,
        "padsBegin": params.padding,
        "padsEnd": params.padding,
        "dilations": params.dilations,
        "autoPad": "explicit",
    })
}

/// Emits the convolution node. With `groups > 1` the flat kernel is first reshaped to the
/// grouped layout and a grouped convolution is emitted instead.
pub fn build_convolution(
    ctx: &mut NodeContext,
    input: u32,
    weight: u32,
    plan: &ConvPlan,
) -> Result<u32, GraphError> {
    let weight = if plan.unsqueeze_weight {
        ops::unsqueeze(ctx, weight, &[SPATIAL_UNIT_AXIS])?
    } else {
        weight
    };
    let descriptor = OperandDescriptor::new(DataType::Float32, plan.output_shape.clone());
    let attributes = conv_attributes(&plan.params);

    let conv = match &plan.group_kernel_shape {
        None => ctx.mark_node(CONVOLUTION, vec![input, weight], attributes, descriptor),
        Some(kernel_shape) => {
            let grouped = ops::reshape(ctx, weight, kernel_shape.clone())?;
            ctx.mark_node(
                GROUP_CONVOLUTION,
                vec![input, grouped],
                attributes,
                descriptor,
            )
        }
    };
    log::debug!(
        "Built {} for {} with output {:?}",
        if plan.group_kernel_shape.is_some() {
            GROUP_CONVOLUTION
        } else {
            CONVOLUTION
        },
        ctx.label(),
        plan.output_shape
    );
    Ok(conv)
}

/// Adds the bias to the convolution output, reshaping a rank-1 bias first.
pub fn compose_bias(
    ctx: &mut NodeContext,
    conv: u32,
    bias: u32,
    plan: &ConvPlan,
) -> Result<u32, GraphError> {
    let bias = dequantize(ctx, bias)?;
    let bias = ops::cast(ctx, bias, DataType::Float32)?;
    let bias = match &plan.bias {
        BiasLayout::Channelwise(shape) => ops::reshape(ctx, bias, shape.clone())?,
        BiasLayout::Broadcast => bias,
    };
    ops::binary(ctx, ADD, conv, bias)
}

/// Shared 2-D body: floating weight, convolution and bias add. `input` must already be a
/// floating `[N, C, H, W]` operand matching `plan`.
pub fn translate_quantized_conv_base(
    ctx: &mut NodeContext,
    input: u32,
    packed: &PackedParams,
    plan: &ConvPlan,
) -> Result<u32, GraphError> {
    let weight = dequantize(ctx, packed.weight)?;
    let weight = ops::cast(ctx, weight, DataType::Float32)?;
    let conv = build_convolution(ctx, input, weight, plan)?;
    compose_bias(ctx, conv, packed.bias, plan)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConvRank {
    Conv1d,
    Conv2d,
}

/// One of the four quantized convolution entry rules.
#[derive(Debug, Clone, Copy)]
pub struct QuantizedConvTranslator {
    op_type: &'static str,
    rank: ConvRank,
    relu: bool,
}

impl QuantizedConvTranslator {
    pub const fn conv2d() -> Self {
        Self {
            op_type: QUANTIZED_CONV2D,
            rank: ConvRank::Conv2d,
            relu: false,
        }
    }

    pub const fn conv2d_relu() -> Self {
        Self {
            op_type: QUANTIZED_CONV2D_RELU,
            rank: ConvRank::Conv2d,
            relu: true,
        }
    }

    pub const fn conv1d() -> Self {
        Self {
            op_type: QUANTIZED_CONV1D,
            rank: ConvRank::Conv1d,
            relu: false,
        }
    }

    pub const fn conv1d_relu() -> Self {
        Self {
            op_type: QUANTIZED_CONV1D_RELU,
            rank: ConvRank::Conv1d,
            relu: true,
        }
    }

    fn activation(&self, ctx: &mut NodeContext, value: u32) -> Result<u32, GraphError> {
        if self.relu {
            ops::unary(ctx, RELU, value)
        } else {
            Ok(value)
        }
    }
}

impl OpTranslator for QuantizedConvTranslator {
    fn op_type(&self) -> &str {
        self.op_type
    }

    // inputs: (quantized input, packed params, output scale, output zero point)
    fn translate(&self, ctx: &mut NodeContext) -> Result<Vec<u32>, GraphError> {
        ctx.num_inputs_check(4, 4)?;
        let input = ctx.get_input(0)?;
        let packed = unpack_packed_params(ctx.graph(), ctx.get_input(1)?)?;
        let scale = ctx.get_input(2)?;
        let zero_point = ctx.get_input(3)?;

        let input_shape = ctx.shape(input)?.to_vec();
        let plan = match self.rank {
            ConvRank::Conv2d => ConvPlan::new(ctx.graph(), &input_shape, &packed)?,
            ConvRank::Conv1d => ConvPlan::new_1d(ctx.graph(), &input_shape, &packed)?,
        };
        dequantization(ctx.graph(), input)?;
        requantization(ctx.graph(), &plan.result_shape, scale, zero_point, input)?;

        let floating = dequantize(ctx, input)?;
        let floating = ops::cast(ctx, floating, DataType::Float32)?;
        let result = match self.rank {
            ConvRank::Conv2d => {
                let conv = translate_quantized_conv_base(ctx, floating, &packed, &plan)?;
                self.activation(ctx, conv)?
            }
            ConvRank::Conv1d => {
                let unsqueezed = ops::unsqueeze(ctx, floating, &[SPATIAL_UNIT_AXIS])?;
                let conv = translate_quantized_conv_base(ctx, unsqueezed, &packed, &plan)?;
                let activated = self.activation(ctx, conv)?;
                ops::squeeze(ctx, activated, &[SPATIAL_UNIT_AXIS])?
            }
        };

        let output = quantize(ctx, result, scale, zero_point, input)?;
        log::debug!(
            "Lowered {} ({}) into {} operations",
            ctx.label(),
            self.op_type,
            ctx.marked_operations().len()
        );
        Ok(vec![output])
    }
}
