//! Boundary behavior of the chunk engine and its argument validation.

use bloscr::{
    cbuffer_metainfo, cbuffer_sizes, cbuffer_validate, compress, compress_ctx, decompress, getitem, CCtx,
    CParams, ChunkInfo, Pipeline, BLOSC2_MAX_OVERHEAD, BLOSC_EXTENDED_HEADER_LENGTH, BLOSC_SHUFFLE,
    BLOSC_TRUNC_PREC, NOSHUFFLE, SHUFFLE,
};

#[test]
fn empty_input_minimal_chunk() {
    let mut chunk = vec![0u8; BLOSC2_MAX_OVERHEAD];
    let cbytes = compress(5, SHUFFLE, 4, &[], &mut chunk).unwrap();
    assert_eq!(cbytes, BLOSC_EXTENDED_HEADER_LENGTH);
    let (nbytes, c, _) = cbuffer_sizes(&chunk[..cbytes]).unwrap();
    assert_eq!(nbytes, 0);
    assert_eq!(c, cbytes);
    let mut out = [0u8; 1];
    assert_eq!(decompress(&chunk[..cbytes], &mut out).unwrap(), 0);
}

#[test]
fn input_smaller_than_typesize() {
    let src = [1u8, 2, 3];
    let mut chunk = vec![0u8; 64];
    let cbytes = compress(9, SHUFFLE, 8, &src, &mut chunk).unwrap();
    let info = ChunkInfo::parse(&chunk[..cbytes]).unwrap();
    assert!(info.memcpyed());
    let mut out = [0u8; 3];
    decompress(&chunk[..cbytes], &mut out).unwrap();
    assert_eq!(out, src);
}

#[test]
fn single_block_and_many_blocks() {
    // Below L1 the whole input is one block.
    let small: Vec<u8> = (0..1024).map(|i| (i % 7) as u8).collect();
    let mut chunk = vec![0u8; small.len() + BLOSC2_MAX_OVERHEAD];
    let cbytes = compress(5, NOSHUFFLE, 4, &small, &mut chunk).unwrap();
    assert_eq!(ChunkInfo::parse(&chunk[..cbytes]).unwrap().nblocks(), 1);

    // Large inputs get several blocks with a short trailer block.
    let big: Vec<u8> = (0..1_000_003).map(|i| (i % 7) as u8).collect();
    let mut chunk = vec![0u8; big.len() + BLOSC2_MAX_OVERHEAD];
    let cbytes = compress(5, NOSHUFFLE, 1, &big, &mut chunk).unwrap();
    let info = ChunkInfo::parse(&chunk[..cbytes]).unwrap();
    assert!(info.nblocks() > 1);
    assert_ne!(info.nbytes % info.blocksize, 0);
    let mut out = vec![0u8; big.len()];
    decompress(&chunk[..cbytes], &mut out).unwrap();
    assert_eq!(out, big);
}

#[test]
fn metainfo_reports_typesize_and_flags() {
    let src = vec![0u8; 64 * 1024];
    let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let cbytes = compress(5, SHUFFLE, 8, &src, &mut chunk).unwrap();
    let (typesize, flags) = cbuffer_metainfo(&chunk[..cbytes]).unwrap();
    assert_eq!(typesize, 8);
    assert_ne!(flags & 0x40, 0, "extended header flag must be set");
    assert!(cbuffer_validate(&chunk[..cbytes]).is_ok());
}

#[test]
fn truncated_precision_is_lossy_but_bounded() {
    let values: Vec<f32> = (0..4096).map(|i| (i as f32).sin() * 1000.0).collect();
    let src: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let prec = 8u8;
    let mut pipeline = Pipeline::empty();
    pipeline.filters[0] = BLOSC_TRUNC_PREC;
    pipeline.filters_meta[0] = prec;
    pipeline.filters[5] = BLOSC_SHUFFLE;
    let params = CParams { typesize: 4, clevel: 7, pipeline, ..Default::default() };
    let ctx = CCtx::new(params).unwrap();
    let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
    chunk.truncate(cbytes);

    let mut out = vec![0u8; src.len()];
    decompress(&chunk, &mut out).unwrap();
    for (got, want) in out.chunks_exact(4).zip(values.iter()) {
        let g = f32::from_le_bytes(got.try_into().unwrap());
        // Only low mantissa bits may differ.
        assert!(want.to_bits() - g.to_bits() < (1 << prec));
    }
}

#[test]
fn invalid_arguments() {
    let src = [0u8; 128];
    let mut chunk = vec![0u8; 256];
    // Bad shuffle selector.
    assert!(compress(5, 9, 4, &src, &mut chunk).is_err());
    // Zero typesize.
    let params = CParams { typesize: 0, ..Default::default() };
    assert!(CCtx::new(params).is_err());
    // clevel out of range.
    let params = CParams { clevel: 11, ..Default::default() };
    assert!(CCtx::new(params).is_err());

    // Decompressing garbage.
    let mut out = [0u8; 16];
    assert!(decompress(&[0u8; 8], &mut out).is_err());
    assert!(decompress(&[0u8; 64], &mut out).is_err());

    // getitem beyond the chunk.
    let cbytes = compress(5, NOSHUFFLE, 4, &src, &mut chunk).unwrap();
    let mut item = [0u8; 4];
    assert!(getitem(&chunk[..cbytes], 32, 1, &mut item).is_err());
}

#[test]
fn delta_requires_first_slot() {
    let mut pipeline = Pipeline::empty();
    pipeline.filters[0] = BLOSC_SHUFFLE;
    pipeline.filters[1] = bloscr::BLOSC_DELTA;
    let params = CParams { typesize: 4, pipeline, ..Default::default() };
    let ctx = CCtx::new(params).unwrap();
    let src = vec![0u8; 4096];
    let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    assert!(compress_ctx(&ctx, &src, &mut chunk).is_err());
}

#[test]
fn getitem_across_block_boundaries() {
    let src: Vec<u8> = (0..1_048_576u32).flat_map(|i| ((i % 65536) as u16).to_le_bytes()).collect();
    let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let cbytes = compress(5, SHUFFLE, 2, &src, &mut chunk).unwrap();
    chunk.truncate(cbytes);
    let info = ChunkInfo::parse(&chunk).unwrap();
    assert!(info.nblocks() > 1);

    let items_per_block = info.blocksize / 2;
    // A run straddling the first block boundary.
    let start = items_per_block - 3;
    let mut out = vec![0u8; 6 * 2];
    getitem(&chunk, start, 6, &mut out).unwrap();
    assert_eq!(out, &src[start * 2..start * 2 + 12]);
}
