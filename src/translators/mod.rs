//! Operator lowering: the dispatch table of translation rules and the whole-graph pass that
//! applies them.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::context::NodeContext;
use crate::error::GraphError;
use crate::graph::{GraphInfo, OperandKind, Operation};

pub mod ops;
pub mod packed_params;
pub mod quantize;
pub mod quantized_conv;

pub use packed_params::{ConvParams, PackedParams, unpack_packed_params};
pub use quantize::{dequantize, quantize};
pub use quantized_conv::QuantizedConvTranslator;

use packed_params::FRAMEWORK_NODE;

/// A lowering rule for one source operator type.
pub trait OpTranslator {
    /// Source operator type handled by this rule (e.g. `quantized::conv2d`).
    fn op_type(&self) -> &str;

    /// Emits the replacement subgraph through `ctx` and returns the operands that stand in for the
    /// source operation's outputs, in order.
    fn translate(&self, ctx: &mut NodeContext) -> Result<Vec<u32>, GraphError>;
}

pub struct TranslatorRegistry {
    translators: HashMap<String, Box<dyn OpTranslator + Send + Sync>>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self {
            translators: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(QuantizedConvTranslator::conv2d()));
        registry.register(Box::new(QuantizedConvTranslator::conv2d_relu()));
        registry.register(Box::new(QuantizedConvTranslator::conv1d()));
        registry.register(Box::new(QuantizedConvTranslator::conv1d_relu()));
        registry
    }

    pub fn register(&mut self, translator: Box<dyn OpTranslator + Send + Sync>) {
        self.translators
            .insert(translator.op_type().to_string(), translator);
    }

    pub fn get(&self, op_type: &str) -> Option<&(dyn OpTranslator + Send + Sync)> {
        self.translators.get(op_type).map(|t| t.as_ref())
    }

    /// Registered operator types, sorted.
    pub fn op_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.translators.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for TranslatorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoweringOptions {
    /// Drop placeholders and operands nothing reads after lowering.
    pub prune_unused: bool,
    /// Keep an operation whose rule fails instead of aborting the pass.
    pub passthrough_failed: bool,
}

impl Default for LoweringOptions {
    fn default() -> Self {
        Self {
            prune_unused: true,
            passthrough_failed: false,
        }
    }
}

#[derive(Debug)]
pub struct LoweringReport {
    pub graph: GraphInfo,
    /// Number of source operations replaced by a lowered subgraph.
    pub translated: usize,
    /// Operator types copied unchanged because no rule handles them.
    pub passthrough: Vec<String>,
    /// Operations whose rule failed, with the error, when `passthrough_failed` is set.
    pub failed: Vec<(String, GraphError)>,
}

/// Lowers every operation with a registered rule, in source order.
///
/// Consumers and graph outputs of a lowered operation are rewired to the operands its rule
/// returns. Operations without a rule are copied unchanged. A failing rule leaves no nodes behind:
/// the graph is cut back to its length before the rule ran.
pub fn lower_graph(
    source: &GraphInfo,
    registry: &TranslatorRegistry,
    options: &LoweringOptions,
) -> Result<LoweringReport, GraphError> {
    let mut graph = GraphInfo {
        operations: Vec::with_capacity(source.operations.len()),
        ..source.clone()
    };
    let mut remap: HashMap<u32, u32> = HashMap::new();
    let mut report = LoweringReport {
        graph: GraphInfo::default(),
        translated: 0,
        passthrough: Vec::new(),
        failed: Vec::new(),
    };

    for (index, op) in source.operations.iter().enumerate() {
        let inputs: Vec<u32> = op
            .input_operands
            .iter()
            .map(|id| *remap.get(id).unwrap_or(id))
            .collect();

        let Some(translator) = registry.get(&op.op_type) else {
            if op.op_type == FRAMEWORK_NODE {
                log::debug!("Keeping placeholder {}", op.display_name());
            } else {
                log::warn!(
                    "No lowering rule for `{}`, copying {} unchanged",
                    op.op_type,
                    op.display_name()
                );
                report.passthrough.push(op.op_type.clone());
            }
            graph.push_operation(Operation {
                input_operands: inputs,
                ..op.clone()
            });
            continue;
        };

        let label = op
            .label
            .clone()
            .unwrap_or_else(|| format!("{}_{}", op.op_type, index));
        let operand_count = graph.operands.len();
        let operation_count = graph.operations.len();
        let mut ctx = NodeContext::new(&mut graph, op.op_type.clone(), label, inputs.clone());

        match translator.translate(&mut ctx) {
            Ok(outputs) => {
                let Some(&lowered) = outputs.first() else {
                    graph.truncate(operand_count, operation_count);
                    return Err(GraphError::ConversionFailed {
                        op_type: op.op_type.clone(),
                        reason: "rule returned no outputs".to_string(),
                    });
                };
                if let Some(original) = op.output_operand {
                    remap.insert(original, lowered);
                }
                report.translated += 1;
            }
            Err(err) => {
                graph.truncate(operand_count, operation_count);
                if !options.passthrough_failed {
                    return Err(err);
                }
                log::warn!("Lowering {} failed: {}", op.display_name(), err);
                graph.push_operation(Operation {
                    input_operands: inputs,
                    ..op.clone()
                });
                report.failed.push((op.display_name(), err));
            }
        }
    }

    rewire_outputs(&mut graph, &remap);
    if options.prune_unused {
        graph = prune_unused(graph);
    }
    log::info!(
        "Lowered {} operations ({} copied unchanged, {} failed); graph has {} operations",
        report.translated,
        report.passthrough.len(),
        report.failed.len(),
        graph.operations.len()
    );
    report.graph = graph;
    Ok(report)
}

/// Points graph outputs at their lowered replacements. The replacement inherits the original
/// operand's name and output role.
fn rewire_outputs(graph: &mut GraphInfo, remap: &HashMap<u32, u32>) {
    for slot in 0..graph.output_operands.len() {
        let original = graph.output_operands[slot];
        let Some(&lowered) = remap.get(&original) else {
            continue;
        };
        let name = graph.operands[original as usize].name.take();
        graph.operands[original as usize].kind = OperandKind::Intermediate;
        let replacement = &mut graph.operands[lowered as usize];
        replacement.kind = OperandKind::Output;
        if name.is_some() {
            replacement.name = name;
        }
        graph.output_operands[slot] = lowered;
    }
}

/// Removes placeholders whose result is no longer read, then every operand nothing refers to.
/// Operand ids are renumbered densely in their original order.
fn prune_unused(mut graph: GraphInfo) -> GraphInfo {
    loop {
        let dead: Vec<usize> = graph
            .operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.op_type == FRAMEWORK_NODE)
            .filter(|(_, op)| op.output_operand.is_none_or(|out| !graph.is_consumed(out)))
            .map(|(idx, _)| idx)
            .collect();
        if dead.is_empty() {
            break;
        }
        for idx in dead.into_iter().rev() {
            let op = graph.operations.remove(idx);
            log::debug!("Pruned placeholder {}", op.display_name());
        }
    }

    let mut live: HashSet<u32> = graph
        .input_operands
        .iter()
        .chain(&graph.output_operands)
        .copied()
        .collect();
    for op in &graph.operations {
        live.extend(op.input_operands.iter().copied());
        live.extend(op.output_operand);
    }
    let quantization_params: Vec<u32> = live
        .iter()
        .filter_map(|&id| graph.operand(id)?.quantization.as_ref())
        .flat_map(|info| [info.scale, info.zero_point])
        .collect();
    live.extend(quantization_params);

    let total = graph.operands.len();
    let mut renumber: HashMap<u32, u32> = HashMap::new();
    let mut operands = Vec::with_capacity(live.len());
    let mut constants = HashMap::new();
    for (old, operand) in graph.operands.into_iter().enumerate() {
        let old = old as u32;
        if !live.contains(&old) {
            continue;
        }
        let new = operands.len() as u32;
        renumber.insert(old, new);
        if let Some(data) = graph.constant_operand_ids_to_handles.remove(&old) {
            constants.insert(new, data);
        }
        operands.push(operand);
    }
    let pruned = total - operands.len();
    if pruned > 0 {
        log::debug!("Pruned {} unused operands", pruned);
    }

    let id = |old: &u32| renumber.get(old).copied().unwrap_or(*old);
    for operand in &mut operands {
        if let Some(info) = operand.quantization.as_mut() {
            info.scale = id(&info.scale);
            info.zero_point = id(&info.zero_point);
        }
    }
    let operations = graph
        .operations
        .into_iter()
        .map(|op| Operation {
            input_operands: op.input_operands.iter().map(id).collect(),
            output_operand: op.output_operand.as_ref().map(id),
            ..op
        })
        .collect();

    GraphInfo {
        input_operands: graph.input_operands.iter().map(id).collect(),
        output_operands: graph.output_operands.iter().map(id).collect(),
        operands,
        operations,
        constant_operand_ids_to_handles: constants,
    }
}
