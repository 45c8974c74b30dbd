//! Orthogonal (per-axis index list) selection.

use bloscr::b2nd::{B2ndArray, B2ndParams};
use bloscr::{CParams, Storage};

fn params(typesize: usize, shape: &[i64], chunkshape: &[i32], blockshape: &[i32]) -> B2ndParams {
    let storage = Storage { cparams: CParams { typesize, ..Default::default() }, ..Default::default() };
    B2ndParams::new(storage, shape, chunkshape, blockshape)
}

#[test]
fn unsorted_duplicated_selection_1d() {
    let p = params(1, &[6], &[4], &[2]);
    let mut array = B2ndArray::from_cbuffer(&p, &[10, 20, 30, 40, 50, 60]).unwrap();

    let selection = vec![vec![4i64, 0, 4, 2]];
    let mut out = [0u8; 4];
    array.get_orthogonal_selection(&selection, &mut out, &[4]).unwrap();
    assert_eq!(out, [50, 10, 50, 30]);
}

#[test]
fn selection_2d_get() {
    // 8x8, values row*10+col, split across 4 chunks.
    let p = params(1, &[8, 8], &[4, 4], &[2, 2]);
    let src: Vec<u8> = (0..64).map(|i| (i / 8 * 10 + i % 8) as u8).collect();
    let mut array = B2ndArray::from_cbuffer(&p, &src).unwrap();

    let rows = vec![6i64, 1, 1];
    let cols = vec![7i64, 0, 5];
    let mut out = [0u8; 9];
    array.get_orthogonal_selection(&[rows.clone(), cols.clone()], &mut out, &[3, 3]).unwrap();
    // Row-major Cartesian product in the caller's order.
    let expect: Vec<u8> =
        rows.iter().flat_map(|&r| cols.iter().map(move |&c| (r * 10 + c) as u8)).collect();
    assert_eq!(&out[..], &expect[..]);
}

#[test]
fn selection_set_then_get() {
    let p = params(2, &[10], &[4], &[2]);
    let mut array = B2ndArray::zeros(&p).unwrap();

    let selection = vec![vec![9i64, 0, 5]];
    let values: Vec<u8> = [111u16, 222, 333].iter().flat_map(|v| v.to_le_bytes()).collect();
    array.set_orthogonal_selection(&selection, &values, &[3]).unwrap();

    let mut full = vec![0u8; 20];
    array.to_cbuffer(&mut full).unwrap();
    let items: Vec<u16> = full.chunks_exact(2).map(|c| u16::from_le_bytes(c.try_into().unwrap())).collect();
    assert_eq!(items[9], 111);
    assert_eq!(items[0], 222);
    assert_eq!(items[5], 333);
    assert!(items.iter().enumerate().all(|(i, &v)| v != 0 || ![9usize, 0, 5].contains(&i)));

    // Reading back through the same selection preserves order.
    let mut out = vec![0u8; 6];
    array.get_orthogonal_selection(&selection, &mut out, &[3]).unwrap();
    assert_eq!(out, values);
}

#[test]
fn each_chunk_decompressed_once_semantics() {
    // A selection spread over every chunk of a 2-D array still returns the
    // caller's order.
    let p = params(4, &[12, 12], &[4, 4], &[2, 2]);
    let src: Vec<u8> = (0..144u32).flat_map(|i| i.to_le_bytes()).collect();
    let mut array = B2ndArray::from_cbuffer(&p, &src).unwrap();

    let rows = vec![11i64, 0, 7, 3, 7];
    let cols = vec![2i64, 9, 4];
    let mut out = vec![0u8; rows.len() * cols.len() * 4];
    array.get_orthogonal_selection(&[rows.clone(), cols.clone()], &mut out, &[5, 3]).unwrap();
    let got: Vec<u32> = out.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect();
    let expect: Vec<u32> =
        rows.iter().flat_map(|&r| cols.iter().map(move |&c| (r * 12 + c) as u32)).collect();
    assert_eq!(got, expect);
}

#[test]
fn out_of_range_indices_rejected() {
    let p = params(1, &[6], &[4], &[2]);
    let mut array = B2ndArray::zeros(&p).unwrap();
    let mut out = [0u8; 1];
    assert!(array.get_orthogonal_selection(&[vec![6]], &mut out, &[1]).is_err());
    assert!(array.get_orthogonal_selection(&[vec![-1]], &mut out, &[1]).is_err());
}
