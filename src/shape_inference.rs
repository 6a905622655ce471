//! Static shape rules for the primitives emitted by the lowering rules.

use crate::error::GraphError;

/// Numpy-style broadcast of two shapes, aligned from the trailing dimension.
pub fn broadcast_shapes(a: &[u32], b: &[u32]) -> Result<Vec<u32>, GraphError> {
    let rank = a.len().max(b.len());
    let mut out = vec![0u32; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(GraphError::shape(
                    "broadcast",
                    format!("shapes {:?} and {:?} are not broadcastable", a, b),
                ));
            }
        };
    }
    Ok(out)
}

/// Layout of a flat `[O, I/g, *K]` kernel as expected by grouped convolution:
/// `[g, O/g, I/g, *K]`.
pub fn infer_group_kernel_shape(weight: &[u32], groups: i64) -> Result<Vec<u32>, GraphError> {
    if weight.len() < 3 {
        return Err(GraphError::shape(
            "groupConvolution",
            format!("kernel {:?} needs at least one spatial dimension", weight),
        ));
    }
    let out_channels = weight[0];
    if groups < 1 || out_channels as i64 % groups != 0 {
        return Err(GraphError::InvalidGroupCount {
            groups,
            channels: out_channels,
        });
    }
    let groups = groups as u32;
    let mut shape = Vec::with_capacity(weight.len() + 1);
    shape.push(groups);
    shape.push(out_channels / groups);
    shape.extend_from_slice(&weight[1..]);
    Ok(shape)
}

/// Shape of a `len`-element vector laid out along `axis` of a rank-`rank` tensor, every other
/// dimension singleton.
pub fn channelwise_shape(len: u32, rank: usize, axis: usize) -> Result<Vec<u32>, GraphError> {
    if axis >= rank {
        return Err(GraphError::shape(
            "reshape",
            format!("axis {} is out of range for rank {}", axis, rank),
        ));
    }
    let mut shape = vec![1u32; rank];
    shape[axis] = len;
    Ok(shape)
}

/// Output shape of an explicitly padded convolution. `weight` is the flat `[O, I/g, *K]` kernel;
/// `pads` is applied to both edges of every spatial axis.
pub fn infer_conv_shape(
    input: &[u32],
    weight: &[u32],
    strides: &[u64],
    pads: &[i64],
    dilations: &[u64],
    groups: i64,
) -> Result<Vec<u32>, GraphError> {
    let op = "convolution";
    if input.len() < 3 || input.len() != weight.len() {
        return Err(GraphError::shape(
            op,
            format!("input {:?} and kernel {:?} ranks differ", input, weight),
        ));
    }
    let spatial = input.len() - 2;
    if strides.len() != spatial || pads.len() != spatial || dilations.len() != spatial {
        return Err(GraphError::shape(
            op,
            format!(
                "expected {} spatial entries, got strides {:?} pads {:?} dilations {:?}",
                spatial, strides, pads, dilations
            ),
        ));
    }
    if groups < 1 || weight[0] as i64 % groups != 0 {
        return Err(GraphError::InvalidGroupCount {
            groups,
            channels: weight[0],
        });
    }
    if input[1] as i64 != weight[1] as i64 * groups {
        return Err(GraphError::shape(
            op,
            format!(
                "input has {} channels, kernel expects {} x {} groups",
                input[1], weight[1], groups
            ),
        ));
    }

    let mut out = vec![input[0], weight[0]];
    for axis in 0..spatial {
        if strides[axis] == 0 || dilations[axis] == 0 {
            return Err(GraphError::shape(op, "strides and dilations must be positive"));
        }
        let overflow = || {
            GraphError::shape(
                op,
                format!("spatial axis {} overflows the output size arithmetic", axis),
            )
        };
        let padded = pads[axis]
            .checked_mul(2)
            .and_then(|pad| pad.checked_add(input[axis + 2] as i64))
            .ok_or_else(overflow)?;
        let dilation = i64::try_from(dilations[axis]).map_err(|_| overflow())?;
        let stride = i64::try_from(strides[axis]).map_err(|_| overflow())?;
        let effective_kernel = dilation
            .checked_mul(weight[axis + 2] as i64 - 1)
            .and_then(|extent| extent.checked_add(1))
            .ok_or_else(overflow)?;
        let span = padded.checked_sub(effective_kernel).ok_or_else(overflow)?;
        if span < 0 {
            return Err(GraphError::shape(
                op,
                format!(
                    "kernel extent {} exceeds padded input {} on spatial axis {}",
                    effective_kernel, padded, axis
                ),
            ));
        }
        out.push(u32::try_from(span / stride + 1).map_err(|_| overflow())?);
    }
    Ok(out)
}

pub fn infer_unsqueeze_shape(shape: &[u32], axes: &[u32]) -> Result<Vec<u32>, GraphError> {
    let out_rank = shape.len() + axes.len();
    let mut out = Vec::with_capacity(out_rank);
    let mut source = shape.iter();
    for i in 0..out_rank as u32 {
        if axes.contains(&i) {
            out.push(1);
        } else {
            match source.next() {
                Some(&dim) => out.push(dim),
                None => {
                    return Err(GraphError::shape(
                        "unsqueeze",
                        format!("axes {:?} out of range for shape {:?}", axes, shape),
                    ));
                }
            }
        }
    }
    Ok(out)
}

pub fn infer_squeeze_shape(shape: &[u32], axes: &[u32]) -> Result<Vec<u32>, GraphError> {
    for &axis in axes {
        match shape.get(axis as usize) {
            Some(1) => {}
            Some(dim) => {
                return Err(GraphError::shape(
                    "squeeze",
                    format!("axis {} has size {}, expected 1", axis, dim),
                ));
            }
            None => {
                return Err(GraphError::shape(
                    "squeeze",
                    format!("axis {} out of range for shape {:?}", axis, shape),
                ));
            }
        }
    }
    Ok(shape
        .iter()
        .enumerate()
        .filter(|(i, _)| !axes.contains(&(*i as u32)))
        .map(|(_, &d)| d)
        .collect())
}

/// Checks that a reshape preserves the element count.
pub fn infer_reshape_shape(shape: &[u32], new_shape: &[u32]) -> Result<Vec<u32>, GraphError> {
    let count = |s: &[u32]| s.iter().map(|&d| d as u64).product::<u64>();
    if count(shape) != count(new_shape) {
        return Err(GraphError::shape(
            "reshape",
            format!("cannot reshape {:?} into {:?}", shape, new_shape),
        ));
    }
    Ok(new_shape.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasts_trailing_dimensions() {
        assert_eq!(
            broadcast_shapes(&[1, 6, 8, 8], &[1, 6, 1, 1]).unwrap(),
            vec![1, 6, 8, 8]
        );
        assert_eq!(broadcast_shapes(&[2, 3, 4], &[]).unwrap(), vec![2, 3, 4]);
        assert_eq!(broadcast_shapes(&[4], &[2, 3, 1]).unwrap(), vec![2, 3, 4]);
        assert!(broadcast_shapes(&[1, 6, 8, 8], &[6]).is_err());
    }

    #[test]
    fn group_kernel_splits_output_channels() {
        assert_eq!(
            infer_group_kernel_shape(&[6, 1, 3, 3], 3).unwrap(),
            vec![3, 2, 1, 3, 3]
        );
        assert_eq!(
            infer_group_kernel_shape(&[8, 2, 5], 4).unwrap(),
            vec![4, 2, 2, 5]
        );
    }

    #[test]
    fn group_kernel_rejects_uneven_groups() {
        let err = infer_group_kernel_shape(&[6, 1, 3, 3], 4).unwrap_err();
        assert!(matches!(
            err,
            GraphError::InvalidGroupCount {
                groups: 4,
                channels: 6
            }
        ));
    }

    #[test]
    fn channelwise_shape_follows_rank() {
        assert_eq!(channelwise_shape(6, 4, 1).unwrap(), vec![1, 6, 1, 1]);
        assert_eq!(channelwise_shape(6, 3, 1).unwrap(), vec![1, 6, 1]);
        assert_eq!(channelwise_shape(5, 4, 0).unwrap(), vec![5, 1, 1, 1]);
        assert!(channelwise_shape(6, 1, 1).is_err());
    }

    fn conv(
        input: &[u32],
        weight: &[u32],
        strides: &[u64],
        pads: &[i64],
        dilations: &[u64],
    ) -> Vec<u32> {
        infer_conv_shape(input, weight, strides, pads, dilations, 1).unwrap()
    }

    #[test]
    fn conv_shape_with_padding_and_stride() {
        let same = conv(&[1, 3, 8, 8], &[6, 3, 3, 3], &[1, 1], &[1, 1], &[1, 1]);
        assert_eq!(same, vec![1, 6, 8, 8]);

        let strided = conv(&[2, 3, 25, 25], &[2, 3, 3, 3], &[2, 2], &[0, 0], &[1, 1]);
        assert_eq!(strided, vec![2, 2, 12, 12]);

        let dilated = conv(&[2, 3, 25, 25], &[2, 3, 3, 3], &[1, 1], &[0, 0], &[2, 2]);
        assert_eq!(dilated, vec![2, 2, 21, 21]);

        let asymmetric = conv(&[2, 3, 25, 25], &[2, 3, 3, 3], &[1, 1], &[0, 1], &[1, 1]);
        assert_eq!(asymmetric, vec![2, 2, 23, 25]);
    }

    #[test]
    fn conv_shape_grouped_channels() {
        let input = [2, 3, 25, 25];
        let kernel = [3, 1, 3, 3];
        let grouped = infer_conv_shape(&input, &kernel, &[1, 1], &[0, 0], &[1, 1], 3);
        assert_eq!(grouped.unwrap(), vec![2, 3, 23, 23]);

        let mismatched = infer_conv_shape(&[2, 4, 25, 25], &kernel, &[1, 1], &[0, 0], &[1, 1], 3);
        assert!(matches!(
            mismatched,
            Err(GraphError::ShapeInferenceFailed { .. })
        ));
    }

    #[test]
    fn conv_shape_rejects_overflowing_hyperparameters() {
        let input = [1, 1, 8, 8];
        let kernel = [1, 1, 3, 3];
        let huge_pad = infer_conv_shape(&input, &kernel, &[1, 1], &[i64::MAX, 0], &[1, 1], 1);
        assert!(matches!(huge_pad, Err(GraphError::ShapeInferenceFailed { .. })));

        let huge_dilation = infer_conv_shape(&input, &kernel, &[1, 1], &[0, 0], &[u64::MAX, 1], 1);
        assert!(matches!(huge_dilation, Err(GraphError::ShapeInferenceFailed { .. })));

        let huge_stride = infer_conv_shape(&input, &kernel, &[u64::MAX, 1], &[0, 0], &[1, 1], 1);
        assert!(matches!(huge_stride, Err(GraphError::ShapeInferenceFailed { .. })));

        let wide = infer_conv_shape(&input, &[1, 1, 1, 1], &[1, 1], &[i64::MAX / 4, 0], &[1, 1], 1);
        assert!(matches!(wide, Err(GraphError::ShapeInferenceFailed { .. })));
    }

    #[test]
    fn conv_shape_rejects_oversized_kernel() {
        let err = infer_conv_shape(&[1, 1, 2, 2], &[1, 1, 3, 3], &[1, 1], &[0, 0], &[1, 1], 1);
        assert!(err.is_err());
    }

    #[test]
    fn unsqueeze_and_squeeze_trailing_axis() {
        let unsqueezed = infer_unsqueeze_shape(&[2, 3, 50], &[3]).unwrap();
        assert_eq!(unsqueezed, vec![2, 3, 50, 1]);
        assert_eq!(infer_squeeze_shape(&unsqueezed, &[3]).unwrap(), vec![2, 3, 50]);
        assert!(infer_squeeze_shape(&[2, 3, 50], &[2]).is_err());
        assert!(infer_unsqueeze_shape(&[2, 3], &[5]).is_err());
    }

    #[test]
    fn reshape_preserves_element_count() {
        assert_eq!(infer_reshape_shape(&[6], &[1, 6, 1, 1]).unwrap(), vec![1, 6, 1, 1]);
        assert!(infer_reshape_shape(&[6], &[1, 5, 1, 1]).is_err());
    }
}
