use std::collections::HashMap;

use crate::error::GraphError;
use crate::graph::OperandDescriptor;

/// Checks that the supplied tensors cover exactly the named graph inputs and that each one has
/// the declared static shape.
pub fn validate_named_shapes(
    actual_shapes: &HashMap<String, Vec<usize>>,
    descriptors: &HashMap<String, OperandDescriptor>,
) -> Result<(), GraphError> {
    for name in descriptors.keys() {
        if !actual_shapes.contains_key(name) {
            return Err(GraphError::RuntimeTensorMissing { name: name.clone() });
        }
    }

    for (name, actual_shape) in actual_shapes {
        let descriptor = descriptors
            .get(name)
            .ok_or_else(|| GraphError::RuntimeTensorUnexpected { name: name.clone() })?;
        validate_shape(name, actual_shape, descriptor)?;
    }

    Ok(())
}

pub fn validate_shape(
    name: &str,
    actual_shape: &[usize],
    descriptor: &OperandDescriptor,
) -> Result<(), GraphError> {
    let matches = actual_shape.len() == descriptor.shape.len()
        && actual_shape
            .iter()
            .zip(&descriptor.shape)
            .all(|(&actual, &expected)| actual == expected as usize);
    if !matches {
        return Err(GraphError::RuntimeTensorShapeMismatch {
            name: name.to_string(),
            expected: descriptor.shape.clone(),
            actual: actual_shape.to_vec(),
        });
    }
    Ok(())
}

pub fn validate_shape_data_length(
    name: &str,
    shape: &[usize],
    data_len: usize,
) -> Result<(), GraphError> {
    let expected = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| GraphError::RuntimeTensorShapeMismatch {
            name: name.to_string(),
            expected: Vec::new(),
            actual: shape.to_vec(),
        })?;

    if data_len != expected {
        return Err(GraphError::RuntimeTensorDataLengthMismatch {
            name: name.to_string(),
            expected,
            actual: data_len,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DataType;

    fn input_desc(shape: Vec<u32>) -> OperandDescriptor {
        OperandDescriptor::new(DataType::Float32, shape)
    }

    #[test]
    fn validates_static_shape() {
        let desc = input_desc(vec![2, 3]);
        assert!(validate_shape("x", &[2, 3], &desc).is_ok());
    }

    #[test]
    fn rejects_shape_mismatch() {
        let desc = input_desc(vec![2, 3]);
        let err = validate_shape("x", &[2, 4], &desc).unwrap_err();
        assert!(matches!(
            err,
            GraphError::RuntimeTensorShapeMismatch { ref expected, .. } if expected == &vec![2, 3]
        ));
        assert!(validate_shape("x", &[2, 3, 1], &desc).is_err());
    }

    #[test]
    fn validates_named_shape_sets() {
        let mut descs = HashMap::new();
        descs.insert("x".to_string(), input_desc(vec![2, 3]));
        let mut actual = HashMap::new();
        actual.insert("x".to_string(), vec![2, 3]);

        assert!(validate_named_shapes(&actual, &descs).is_ok());
    }

    #[test]
    fn rejects_missing_named_tensor() {
        let mut descs = HashMap::new();
        descs.insert("x".to_string(), input_desc(vec![1]));
        let actual = HashMap::new();

        let err = validate_named_shapes(&actual, &descs).unwrap_err();
        assert!(matches!(err, GraphError::RuntimeTensorMissing { .. }));
    }

    #[test]
    fn rejects_unexpected_named_tensor() {
        let descs = HashMap::new();
        let mut actual = HashMap::new();
        actual.insert("x".to_string(), vec![1]);

        let err = validate_named_shapes(&actual, &descs).unwrap_err();
        assert!(matches!(err, GraphError::RuntimeTensorUnexpected { .. }));
    }

    #[test]
    fn rejects_shape_data_length_mismatch() {
        assert!(validate_shape_data_length("x", &[2, 3], 6).is_ok());
        assert!(validate_shape_data_length("x", &[], 1).is_ok());
        let err = validate_shape_data_length("x", &[2, 3], 7).unwrap_err();
        assert!(matches!(
            err,
            GraphError::RuntimeTensorDataLengthMismatch {
                expected: 6,
                actual: 7,
                ..
            }
        ));
    }
}
