//! Super-chunk behavior: chunk operations, counters, special fills, random
//! access and metadata layers.

use bloscr::{
    compress_ctx, CCtx, CParams, SChunk, SpecialValue, Storage, BLOSC2_MAX_OVERHEAD,
    BLOSC_EXTENDED_HEADER_LENGTH,
};

fn storage(typesize: usize) -> Storage {
    Storage { cparams: CParams { typesize, ..Default::default() }, ..Default::default() }
}

fn compressed(data: &[u8], typesize: usize) -> Vec<u8> {
    let ctx = CCtx::new(CParams { typesize, ..Default::default() }).unwrap();
    let mut chunk = vec![0u8; data.len() + BLOSC2_MAX_OVERHEAD];
    let cbytes = compress_ctx(&ctx, data, &mut chunk).unwrap();
    chunk.truncate(cbytes);
    chunk
}

#[test]
fn sequential_appends_roundtrip() {
    let mut schunk = SChunk::new(storage(4)).unwrap();
    let bufs: Vec<Vec<u8>> =
        (0..10u8).map(|k| (0..8192).map(|i| (i as u8).wrapping_mul(k + 1)).collect()).collect();
    for (i, b) in bufs.iter().enumerate() {
        assert_eq!(schunk.append_buffer(b).unwrap(), i + 1);
    }
    assert_eq!(schunk.nchunks(), 10);
    assert_eq!(schunk.nbytes(), 8192 * 10);
    for (i, b) in bufs.iter().enumerate() {
        let mut out = vec![0u8; 8192];
        assert_eq!(schunk.decompress_chunk(i, &mut out).unwrap(), 8192);
        assert_eq!(&out, b, "chunk {i}");
    }
}

#[test]
fn insert_commutes_at_non_overlapping_positions() {
    let base: Vec<Vec<u8>> = (0..6u8).map(|k| vec![k; 512]).collect();
    let c = compressed(&[100u8; 512], 1);
    let c2 = compressed(&[200u8; 512], 1);

    // insert(1, c); insert(4, c2) vs insert(3, c2); insert(1, c).
    let mut a = SChunk::new(storage(1)).unwrap();
    let mut b = SChunk::new(storage(1)).unwrap();
    for buf in &base {
        a.append_buffer(buf).unwrap();
        b.append_buffer(buf).unwrap();
    }
    a.insert_chunk(1, c.clone()).unwrap();
    a.insert_chunk(4, c2.clone()).unwrap();
    b.insert_chunk(3, c2).unwrap();
    b.insert_chunk(1, c).unwrap();

    assert_eq!(a.nchunks(), b.nchunks());
    let mut out_a = vec![0u8; 512];
    let mut out_b = vec![0u8; 512];
    for i in 0..a.nchunks() {
        a.decompress_chunk(i, &mut out_a).unwrap();
        b.decompress_chunk(i, &mut out_b).unwrap();
        assert_eq!(out_a, out_b, "chunk {i}");
    }
}

#[test]
fn fill_special_zero_counts() {
    let mut schunk = SChunk::new(storage(1)).unwrap();
    let nchunks = schunk.fill_special(1_000_000, SpecialValue::Zero, 65536).unwrap();
    assert_eq!(nchunks, 16);
    for i in 0..nchunks {
        let lazy = schunk.get_lazychunk(i).unwrap();
        assert!(lazy.len() <= BLOSC_EXTENDED_HEADER_LENGTH);
    }
    let mut out = vec![0xAAu8; 65536];
    assert_eq!(schunk.decompress_chunk(0, &mut out).unwrap(), 65536);
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn fill_special_value_and_nan() {
    let mut schunk = SChunk::new(storage(4)).unwrap();
    let value = 0xDEADBEEFu32.to_le_bytes().to_vec();
    schunk.fill_special(10_000, SpecialValue::Value(value.clone()), 4096).unwrap();
    let mut out = vec![0u8; 4096];
    schunk.decompress_chunk(0, &mut out).unwrap();
    for item in out.chunks_exact(4) {
        assert_eq!(item, value.as_slice());
    }

    let mut nans = SChunk::new(storage(8)).unwrap();
    nans.fill_special(1024, SpecialValue::Nan, 8192).unwrap();
    let mut out = vec![0u8; 8192];
    nans.decompress_chunk(0, &mut out).unwrap();
    for item in out.chunks_exact(8) {
        assert!(f64::from_le_bytes(item.try_into().unwrap()).is_nan());
    }

    // NaN fills need a float-sized type.
    let mut bad = SChunk::new(storage(3)).unwrap();
    assert!(bad.fill_special(10, SpecialValue::Nan, 30).is_err());
}

#[test]
fn special_chunk_matches_regular_zeros() {
    let mut special = SChunk::new(storage(4)).unwrap();
    special.fill_special(16384, SpecialValue::Zero, 65536).unwrap();
    let mut regular = SChunk::new(storage(4)).unwrap();
    regular.append_buffer(&vec![0u8; 65536]).unwrap();

    let mut a = vec![0u8; 65536];
    let mut b = vec![0u8; 65536];
    special.decompress_chunk(0, &mut a).unwrap();
    regular.decompress_chunk(0, &mut b).unwrap();
    assert_eq!(a, b);

    let mut ia = vec![0u8; 64];
    let mut ib = vec![0u8; 64];
    special.getitem(0, 777, 16, &mut ia).unwrap();
    regular.getitem(0, 777, 16, &mut ib).unwrap();
    assert_eq!(ia, ib);
}

#[test]
fn getitem_random_access() {
    let mut schunk = SChunk::new(storage(8)).unwrap();
    let buf: Vec<u8> = (0..65536u64).flat_map(|i| i.to_le_bytes()).collect();
    schunk.append_buffer(&buf).unwrap();

    let mut out = vec![0u8; 8 * 3];
    schunk.getitem(0, 1000, 3, &mut out).unwrap();
    let values: Vec<u64> = out.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect();
    assert_eq!(values, vec![1000, 1001, 1002]);

    // Out of range is an error, not a short read.
    assert!(schunk.getitem(0, 65536, 1, &mut out).is_err());
}

#[test]
fn lazy_chunks_borrow_from_frames() {
    let mut schunk = SChunk::new(storage(2)).unwrap();
    for k in 0..4u8 {
        schunk.append_buffer(&vec![k; 4096]).unwrap();
    }
    let frame = schunk.to_buffer().unwrap();

    let aliased = SChunk::from_buffer_owned(frame).unwrap();
    // Frame-backed chunks come straight out of the image.
    assert!(matches!(aliased.get_lazychunk(2).unwrap(), std::borrow::Cow::Borrowed(_)));

    // Special chunks always materialize.
    let mut special = SChunk::new(storage(1)).unwrap();
    special.fill_special(100, SpecialValue::Zero, 100).unwrap();
    assert!(matches!(special.get_lazychunk(0).unwrap(), std::borrow::Cow::Owned(_)));
}

#[test]
fn update_and_delete_rewrite_history() {
    let mut schunk = SChunk::new(storage(1)).unwrap();
    for k in 0..5u8 {
        schunk.append_buffer(&vec![k; 2048]).unwrap();
    }
    schunk.update_chunk(2, compressed(&[0xEEu8; 2048], 1)).unwrap();
    schunk.delete_chunk(0).unwrap();
    assert_eq!(schunk.nchunks(), 4);

    let expect = [vec![1u8; 2048], vec![0xEE; 2048], vec![3u8; 2048], vec![4u8; 2048]];
    let mut out = vec![0u8; 2048];
    for (i, e) in expect.iter().enumerate() {
        schunk.decompress_chunk(i, &mut out).unwrap();
        assert_eq!(&out, e, "chunk {i}");
    }
    assert_eq!(schunk.nbytes(), 4 * 2048);
}

#[test]
fn schunk_copy_roundtrip() {
    let mut schunk = SChunk::new(storage(4)).unwrap();
    schunk.meta_add("origin", b"unit-test").unwrap();
    for k in 0..3u8 {
        schunk.append_buffer(&vec![k; 16384]).unwrap();
    }
    // Same params: chunks move verbatim.
    let mut twin = schunk.copy(storage(4)).unwrap();
    assert_eq!(twin.nchunks(), 3);
    assert_eq!(twin.meta_get("origin").unwrap(), b"unit-test");

    // Different level: recompressed, same payload.
    let mut hc_storage = storage(4);
    hc_storage.cparams.clevel = 9;
    let mut recompressed = schunk.copy(hc_storage).unwrap();
    let mut a = vec![0u8; 16384];
    let mut b = vec![0u8; 16384];
    for i in 0..3 {
        twin.decompress_chunk(i, &mut a).unwrap();
        recompressed.decompress_chunk(i, &mut b).unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn append_after_short_chunk_is_rejected_upward() {
    let mut schunk = SChunk::new(storage(1)).unwrap();
    schunk.append_buffer(&[1u8; 1000]).unwrap();
    // Larger than the established chunksize: refused.
    assert!(schunk.append_buffer(&[2u8; 2000]).is_err());
}
