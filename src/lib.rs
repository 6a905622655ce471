pub mod context;
pub mod error;
pub mod executors;
pub mod graph;
pub mod graphviz;
pub mod loader;
pub mod logger;
pub mod runtime_checks;
pub mod shape_inference;
pub mod translators;

pub use context::NodeContext;
pub use error::GraphError;
pub use executors::reference::{
    ReferenceInput, run_reference, run_reference_with_inputs, run_reference_zeroed,
};
pub use graph::{
    ConstantData, DataType, GraphInfo, Operand, OperandDescriptor, OperandKind, Operation,
    QuantizationInfo,
};
pub use graphviz::graph_to_dot;
pub use loader::load_graph_from_path;
pub use translators::{
    LoweringOptions, LoweringReport, OpTranslator, QuantizedConvTranslator, TranslatorRegistry,
    lower_graph,
};
