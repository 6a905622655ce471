use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::error::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float32,
    Int32,
    Uint32,
    Int8,
    Uint8,
    Int64,
    Uint64,
}

impl DataType {
    pub fn bytes_per_element(self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Int32 => 4,
            DataType::Uint32 => 4,
            DataType::Int8 => 1,
            DataType::Uint8 => 1,
            DataType::Int64 => 8,
            DataType::Uint64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, DataType::Float32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandDescriptor {
    pub data_type: DataType,
    #[serde(default)]
    pub shape: Vec<u32>,
}

impl OperandDescriptor {
    pub fn new(data_type: DataType, shape: Vec<u32>) -> Self {
        Self { data_type, shape }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperandKind {
    Input,
    Constant,
    Output,
    Intermediate,
}

/// Affine quantization parameters attached to a quantized operand.
///
/// `scale` and `zero_point` refer to operands in the same graph. `axis` is set only for
/// per-axis parameters, where `scale` is rank 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub data_type: DataType,
    pub scale: u32,
    pub zero_point: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operand {
    pub kind: OperandKind,
    pub descriptor: OperandDescriptor,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<QuantizationInfo>,
}

impl Operand {
    pub fn new(kind: OperandKind, descriptor: OperandDescriptor) -> Self {
        Self {
            kind,
            descriptor,
            name: None,
            quantization: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn quantized(mut self, quantization: QuantizationInfo) -> Self {
        self.quantization = Some(quantization);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub input_operands: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_operand: Option<u32>,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub label: Option<String>,
}

impl Operation {
    pub fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.op_type.clone())
    }

    /// Reads an integer array attribute such as `strides` or `axes`.
    pub fn i64_array_attr(&self, key: &str) -> Option<Vec<i64>> {
        self.attributes
            .get(key)?
            .as_array()?
            .iter()
            .map(|v| v.as_i64())
            .collect()
    }

    pub fn f64_attr(&self, key: &str) -> Option<f64> {
        self.attributes.get(key)?.as_f64()
    }

    pub fn str_attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)?.as_str()
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantData {
    #[serde_as(as = "Base64")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub label: Option<String>,
}

impl ConstantData {
    pub fn from_i64s(values: &[i64]) -> Self {
        Self {
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            label: None,
        }
    }

    pub fn from_i32s(values: &[i32]) -> Self {
        Self {
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            label: None,
        }
    }

    pub fn from_f32s(values: &[f32]) -> Self {
        Self {
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            label: None,
        }
    }

    pub fn from_i8s(values: &[i8]) -> Self {
        Self {
            data: values.iter().map(|&v| v as u8).collect(),
            label: None,
        }
    }

    /// Decodes the bytes as integers. Fails for floating types.
    pub fn to_i64s(&self, data_type: DataType) -> Result<Vec<i64>, GraphError> {
        let width = data_type.bytes_per_element();
        self.check_length(data_type)?;
        let chunks = self.data.chunks_exact(width);
        let values = match data_type {
            DataType::Int64 => chunks
                .map(|c| i64::from_le_bytes(le_array(c)))
                .collect(),
            DataType::Uint64 => chunks
                .map(|c| u64::from_le_bytes(le_array(c)) as i64)
                .collect(),
            DataType::Int32 => chunks
                .map(|c| i32::from_le_bytes(le_array(c)) as i64)
                .collect(),
            DataType::Uint32 => chunks
                .map(|c| u32::from_le_bytes(le_array(c)) as i64)
                .collect(),
            DataType::Int8 => self.data.iter().map(|&b| b as i8 as i64).collect(),
            DataType::Uint8 => self.data.iter().map(|&b| b as i64).collect(),
            DataType::Float32 => {
                return Err(GraphError::ConversionFailed {
                    op_type: "constant".to_string(),
                    reason: "float32 constant cannot be read as integers".to_string(),
                });
            }
        };
        Ok(values)
    }

    /// Decodes the bytes of any supported type into `f32` values.
    pub fn to_f32s(&self, data_type: DataType) -> Result<Vec<f32>, GraphError> {
        if data_type == DataType::Float32 {
            self.check_length(data_type)?;
            return Ok(self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(le_array(c)))
                .collect());
        }
        Ok(self
            .to_i64s(data_type)?
            .into_iter()
            .map(|v| v as f32)
            .collect())
    }

    fn check_length(&self, data_type: DataType) -> Result<(), GraphError> {
        if self.data.len() % data_type.bytes_per_element() != 0 {
            return Err(GraphError::ConversionFailed {
                op_type: "constant".to_string(),
                reason: format!(
                    "{} bytes is not a whole number of {:?} elements",
                    self.data.len(),
                    data_type
                ),
            });
        }
        Ok(())
    }
}

fn le_array<const N: usize>(chunk: &[u8]) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(chunk);
    bytes
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphInfo {
    pub operands: Vec<Operand>,
    #[serde(default)]
    pub input_operands: Vec<u32>,
    #[serde(default)]
    pub output_operands: Vec<u32>,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub constant_operand_ids_to_handles: HashMap<u32, ConstantData>,
}

impl GraphInfo {
    pub fn operand(&self, id: u32) -> Option<&Operand> {
        self.operands.get(id as usize)
    }

    pub fn try_operand(&self, id: u32) -> Result<&Operand, GraphError> {
        self.operand(id)
            .ok_or(GraphError::InvalidConversionOperand { operand: id })
    }

    /// Returns the operation that writes `operand`, if any.
    pub fn producer(&self, operand: u32) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|op| op.output_operand == Some(operand))
    }

    pub fn constant(&self, id: u32) -> Option<&ConstantData> {
        self.constant_operand_ids_to_handles.get(&id)
    }

    pub fn push_operand(&mut self, operand: Operand) -> u32 {
        self.operands.push(operand);
        (self.operands.len() - 1) as u32
    }

    pub fn push_operation(&mut self, operation: Operation) -> usize {
        self.operations.push(operation);
        self.operations.len() - 1
    }

    pub fn add_input(&mut self, name: &str, descriptor: OperandDescriptor) -> u32 {
        let id = self.push_operand(Operand::new(OperandKind::Input, descriptor).named(name));
        self.input_operands.push(id);
        id
    }

    pub fn add_constant(
        &mut self,
        name: Option<String>,
        descriptor: OperandDescriptor,
        data: ConstantData,
    ) -> u32 {
        let mut operand = Operand::new(OperandKind::Constant, descriptor);
        operand.name = name;
        let id = self.push_operand(operand);
        self.constant_operand_ids_to_handles.insert(id, data);
        id
    }

    pub fn add_i64_constant(&mut self, name: &str, shape: Vec<u32>, values: &[i64]) -> u32 {
        self.add_constant(
            Some(name.to_string()),
            OperandDescriptor::new(DataType::Int64, shape),
            ConstantData::from_i64s(values),
        )
    }

    pub fn add_f32_constant(&mut self, name: &str, shape: Vec<u32>, values: &[f32]) -> u32 {
        self.add_constant(
            Some(name.to_string()),
            OperandDescriptor::new(DataType::Float32, shape),
            ConstantData::from_f32s(values),
        )
    }

    /// Integer values of a constant operand.
    pub fn constant_i64s(&self, id: u32) -> Result<Vec<i64>, GraphError> {
        let operand = self.try_operand(id)?;
        let data = self
            .constant(id)
            .ok_or_else(|| GraphError::ConversionFailed {
                op_type: "constant".to_string(),
                reason: format!("operand {} has no constant data", id),
            })?;
        data.to_i64s(operand.descriptor.data_type)
    }

    pub fn constant_f32s(&self, id: u32) -> Result<Vec<f32>, GraphError> {
        let operand = self.try_operand(id)?;
        let data = self
            .constant(id)
            .ok_or_else(|| GraphError::ConversionFailed {
                op_type: "constant".to_string(),
                reason: format!("operand {} has no constant data", id),
            })?;
        data.to_f32s(operand.descriptor.data_type)
    }

    /// Drops every operand and operation appended after the given lengths.
    pub fn truncate(&mut self, operand_count: usize, operation_count: usize) {
        self.operations.truncate(operation_count);
        self.operands.truncate(operand_count);
        self.constant_operand_ids_to_handles
            .retain(|&id, _| (id as usize) < operand_count);
    }

    pub fn is_consumed(&self, operand: u32) -> bool {
        self.output_operands.contains(&operand)
            || self
                .operations
                .iter()
                .any(|op| op.input_operands.contains(&operand))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_bytes_per_element() {
        assert_eq!(DataType::Float32.bytes_per_element(), 4);
        assert_eq!(DataType::Int32.bytes_per_element(), 4);
        assert_eq!(DataType::Uint32.bytes_per_element(), 4);
        assert_eq!(DataType::Int8.bytes_per_element(), 1);
        assert_eq!(DataType::Uint8.bytes_per_element(), 1);
        assert_eq!(DataType::Int64.bytes_per_element(), 8);
        assert_eq!(DataType::Uint64.bytes_per_element(), 8);
    }

    #[test]
    fn test_data_type_serialization() {
        assert_eq!(
            serde_json::to_string(&DataType::Uint8).unwrap(),
            "\"uint8\""
        );
        assert_eq!(
            serde_json::from_str::<DataType>("\"float32\"").unwrap(),
            DataType::Float32
        );
    }

    #[test]
    fn test_constant_integer_decoding() {
        let data = ConstantData::from_i64s(&[1, -2, 3]);
        assert_eq!(data.to_i64s(DataType::Int64).unwrap(), vec![1, -2, 3]);

        let data = ConstantData::from_i32s(&[7, -1]);
        assert_eq!(data.to_i64s(DataType::Int32).unwrap(), vec![7, -1]);

        let data = ConstantData::from_i8s(&[-128, 5]);
        assert_eq!(data.to_i64s(DataType::Int8).unwrap(), vec![-128, 5]);
        assert_eq!(data.to_i64s(DataType::Uint8).unwrap(), vec![128, 5]);
    }

    #[test]
    fn test_float_constant_rejected_as_integers() {
        let data = ConstantData::from_f32s(&[1.0]);
        assert!(matches!(
            data.to_i64s(DataType::Float32),
            Err(GraphError::ConversionFailed { .. })
        ));
        assert_eq!(data.to_f32s(DataType::Float32).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_constant_truncated_bytes_rejected() {
        let data = ConstantData {
            data: vec![0, 1, 2],
            label: None,
        };
        assert!(data.to_i64s(DataType::Int32).is_err());
    }

    #[test]
    fn test_producer_lookup_and_truncate() {
        let mut graph = GraphInfo::default();
        let x = graph.add_input("x", OperandDescriptor::new(DataType::Float32, vec![2]));
        let y = graph.push_operand(Operand::new(
            OperandKind::Intermediate,
            OperandDescriptor::new(DataType::Float32, vec![2]),
        ));
        graph.push_operation(Operation {
            op_type: "relu".to_string(),
            input_operands: vec![x],
            output_operand: Some(y),
            attributes: serde_json::json!({}),
            label: None,
        });

        assert_eq!(graph.producer(y).map(|op| op.op_type.as_str()), Some("relu"));
        assert!(graph.producer(x).is_none());
        assert!(graph.is_consumed(x));

        let c = graph.add_i64_constant("c", vec![1], &[3]);
        assert_eq!(graph.constant_i64s(c).unwrap(), vec![3]);

        graph.truncate(2, 0);
        assert_eq!(graph.operands.len(), 2);
        assert!(graph.operations.is_empty());
        assert!(graph.constant(c).is_none());
    }

    #[test]
    fn test_graph_json_roundtrip_keeps_quantization() {
        let mut graph = GraphInfo::default();
        let scale = graph.add_f32_constant("scale", vec![], &[0.5]);
        let zero_point = graph.add_i64_constant("zp", vec![], &[3]);
        graph.push_operand(
            Operand::new(
                OperandKind::Input,
                OperandDescriptor::new(DataType::Uint8, vec![1, 4]),
            )
            .named("q")
            .quantized(QuantizationInfo {
                data_type: DataType::Uint8,
                scale,
                zero_point,
                axis: None,
            }),
        );

        let json = serde_json::to_string(&graph).unwrap();
        assert!(json.contains("\"quantization\""));
        let decoded: GraphInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(
            decoded.operands[2].quantization.as_ref().map(|q| q.zero_point),
            Some(zero_point)
        );
        assert_eq!(decoded.constant_f32s(scale).unwrap(), vec![0.5]);
    }
}
