//! Shape arithmetic shared by the compiler and device backends.

use crate::backend::ir::{DimSymbol, Dimension, Shape};

/// Returns static dimensions or maps the first dynamic dimension to caller-defined error type.
pub fn static_dims_or_error<E, F>(shape: &Shape, mut on_dynamic: F) -> Result<Vec<usize>, E>
where
    F: FnMut(&DimSymbol) -> E,
{
    let mut dims = Vec::with_capacity(shape.rank());
    for dim in shape.dims() {
        match dim {
            Dimension::Static(value) => dims.push(*value),
            Dimension::Dynamic(symbol) => return Err(on_dynamic(symbol)),
        }
    }
    Ok(dims)
}

/// Computes `product(dims)` with overflow checking.
pub fn checked_element_count_or_error<E, F>(dims: &[usize], mut on_overflow: F) -> Result<usize, E>
where
    F: FnMut() -> E,
{
    let mut count = 1usize;
    for dim in dims {
        count = count.checked_mul(*dim).ok_or_else(&mut on_overflow)?;
    }
    Ok(count)
}

/// Row-major contiguous strides.
pub fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; dims.len()];
    let mut stride = 1usize;
    for axis in (0..dims.len()).rev() {
        strides[axis] = stride;
        stride = stride.saturating_mul(dims[axis]);
    }
    strides
}

/// Converts a flat row-major index into per-axis coordinates.
pub fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        if *dim == 0 {
            return coords;
        }
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

/// Multidirectional (numpy-style) broadcast of two static shapes.
///
/// Returns `None` when a pair of aligned dims differs and neither is 1.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0usize; rank];
    for (axis, slot) in out.iter_mut().enumerate() {
        let l = aligned_dim(lhs, rank, axis);
        let r = aligned_dim(rhs, rank, axis);
        *slot = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
    }
    Some(out)
}

/// Whether `from` can be broadcast to `to` without changing `to`.
pub fn is_broadcastable_to(from: &[usize], to: &[usize]) -> bool {
    if from.len() > to.len() {
        return false;
    }
    let offset = to.len() - from.len();
    from.iter()
        .enumerate()
        .all(|(axis, &dim)| dim == 1 || dim == to[offset + axis])
}

fn aligned_dim(dims: &[usize], rank: usize, axis: usize) -> usize {
    let offset = rank - dims.len();
    if axis < offset {
        1
    } else {
        dims[axis - offset]
    }
}

/// Normalizes a possibly negative axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let adjusted = if axis < 0 { axis + rank } else { axis };
    if (0..rank).contains(&adjusted) {
        Some(adjusted as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_aligns_trailing_dims() {
        assert_eq!(broadcast_shapes(&[2, 3, 4], &[4]), Some(vec![2, 3, 4]));
        assert_eq!(broadcast_shapes(&[2, 1, 4], &[3, 1]), Some(vec![2, 3, 4]));
        assert_eq!(broadcast_shapes(&[], &[5]), Some(vec![5]));
        assert_eq!(broadcast_shapes(&[2, 3], &[4, 3]), None);
    }

    #[test]
    fn unidirectional_broadcast_check() {
        assert!(is_broadcastable_to(&[3, 1], &[2, 3, 4]));
        assert!(is_broadcastable_to(&[], &[2, 3]));
        assert!(!is_broadcastable_to(&[2, 3, 4], &[3, 4]));
        assert!(!is_broadcastable_to(&[5], &[2, 3]));
    }

    #[test]
    fn negative_axes_wrap_once() {
        assert_eq!(normalize_axis(-1, 4), Some(3));
        assert_eq!(normalize_axis(3, 4), Some(3));
        assert_eq!(normalize_axis(4, 4), None);
        assert_eq!(normalize_axis(-5, 4), None);
    }

    #[test]
    fn strides_and_unravel_agree() {
        let dims = [2, 3, 4];
        let strides = contiguous_strides(&dims);
        assert_eq!(strides, vec![12, 4, 1]);
        let coords = unravel_index(23, &dims);
        assert_eq!(coords, vec![1, 2, 3]);
    }
}
