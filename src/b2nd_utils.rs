//! N-dimensional buffer helpers: C-order index arithmetic and the strided
//! rectangle copy the slice machinery is built on.

use crate::constants::B2ND_MAX_DIM;

/// Collapse a multidimensional index into a linear one using `strides`.
#[inline]
pub fn multidim_to_unidim(index: &[i64], strides: &[i64]) -> i64 {
    index.iter().zip(strides).map(|(i, s)| i * s).sum()
}

/// Expand linear index `i` over a C-order `shape` into `index`.
pub fn unidim_to_multidim(shape: &[i64], i: i64, index: &mut [i64]) {
    let ndim = shape.len();
    if ndim == 0 {
        return;
    }
    let mut strides = [0i64; B2ND_MAX_DIM];
    strides[ndim - 1] = 1;
    for j in (0..ndim - 1).rev() {
        strides[j] = shape[j + 1] * strides[j + 1];
    }
    index[0] = i / strides[0];
    for j in 1..ndim {
        index[j] = (i % strides[j - 1]) / strides[j];
    }
}

/// C-order strides (in items) for a shape.
pub fn strides_of(shape: &[i64]) -> [i64; B2ND_MAX_DIM] {
    let ndim = shape.len();
    let mut strides = [0i64; B2ND_MAX_DIM];
    if ndim == 0 {
        return strides;
    }
    strides[ndim - 1] = 1;
    for i in (0..ndim - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Copy the rectangle `[src_start, src_stop)` of a C-order padded buffer into
/// another padded buffer at `dst_start`. Shapes are in items; `itemsize`
/// scales to bytes. Inner rows are copied as single runs.
#[allow(clippy::too_many_arguments)]
pub fn copy_buffer(
    ndim: usize,
    itemsize: usize,
    src: &[u8],
    src_pad_shape: &[i64],
    src_start: &[i64],
    src_stop: &[i64],
    dst: &mut [u8],
    dst_pad_shape: &[i64],
    dst_start: &[i64],
) {
    if ndim == 0 {
        dst[..itemsize].copy_from_slice(&src[..itemsize]);
        return;
    }

    let mut copy_shape = [0i64; B2ND_MAX_DIM];
    for i in 0..ndim {
        copy_shape[i] = src_stop[i] - src_start[i];
        if copy_shape[i] == 0 {
            return;
        }
    }

    let src_strides = strides_of(&src_pad_shape[..ndim]);
    let dst_strides = strides_of(&dst_pad_shape[..ndim]);

    let src_base = multidim_to_unidim(&src_start[..ndim], &src_strides[..ndim]) as usize * itemsize;
    let dst_base = multidim_to_unidim(&dst_start[..ndim], &dst_strides[..ndim]) as usize * itemsize;

    let row_nbytes = copy_shape[ndim - 1] as usize * itemsize;
    if ndim == 1 {
        dst[dst_base..dst_base + row_nbytes].copy_from_slice(&src[src_base..src_base + row_nbytes]);
        return;
    }

    let nrows: i64 = copy_shape[..ndim - 1].iter().product();
    let mut row_index = [0i64; B2ND_MAX_DIM];
    for nrow in 0..nrows {
        unidim_to_multidim(&copy_shape[..ndim - 1], nrow, &mut row_index);
        let src_off =
            src_base + multidim_to_unidim(&row_index[..ndim - 1], &src_strides[..ndim - 1]) as usize * itemsize;
        let dst_off =
            dst_base + multidim_to_unidim(&row_index[..ndim - 1], &dst_strides[..ndim - 1]) as usize * itemsize;
        dst[dst_off..dst_off + row_nbytes].copy_from_slice(&src[src_off..src_off + row_nbytes]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_roundtrip() {
        let shape = [3i64, 4, 5];
        let strides = strides_of(&shape);
        assert_eq!(&strides[..3], &[20, 5, 1]);
        let mut idx = [0i64; B2ND_MAX_DIM];
        for i in 0..60 {
            unidim_to_multidim(&shape, i, &mut idx);
            assert_eq!(multidim_to_unidim(&idx[..3], &strides[..3]), i);
        }
    }

    #[test]
    fn rectangle_copy_2d() {
        // 4x4 source, copy the center 2x2 into the corner of a 3x3 buffer.
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0u8; 9];
        copy_buffer(2, 1, &src, &[4, 4], &[1, 1], &[3, 3], &mut dst, &[3, 3], &[0, 0]);
        assert_eq!(dst, vec![5, 6, 0, 9, 10, 0, 0, 0, 0]);
    }

    #[test]
    fn wide_items() {
        let src: Vec<u8> = (0..32).collect();
        let mut dst = vec![0u8; 32];
        copy_buffer(2, 4, &src, &[2, 4], &[0, 1], &[2, 3], &mut dst, &[2, 4], &[0, 1]);
        // Items (0,1), (0,2), (1,1), (1,2) copied in place.
        assert_eq!(&dst[4..12], &src[4..12]);
        assert_eq!(&dst[20..28], &src[20..28]);
        assert_eq!(&dst[..4], &[0u8; 4]);
    }

    #[test]
    fn scalar_copy() {
        let src = [7u8, 8, 9, 10];
        let mut dst = [0u8; 4];
        copy_buffer(0, 4, &src, &[], &[], &[], &mut dst, &[], &[]);
        assert_eq!(dst, src);
    }
}
