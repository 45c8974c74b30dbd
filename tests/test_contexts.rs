//! Context lifecycle: ctx vs one-shot calls, pool resizing, maskout
//! consumption, hooks and zstd dictionaries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bloscr::{
    blosc2, compress_ctx, decompress_ctx, getitem_ctx, CCtx, CParams, ChunkInfo, DCtx, DParams, Pipeline,
    PostfilterParams, PrefilterParams, BLOSC2_MAX_OVERHEAD, BLOSC_SHUFFLE, BLOSC_ZSTD,
};

fn ramp(nbytes: usize) -> Vec<u8> {
    (0..nbytes).map(|i| (i / 4 % 256) as u8).collect()
}

#[test]
fn ctx_and_oneshot_agree() {
    let src = ramp(100_000);
    let params = CParams { typesize: 4, nthreads: 1, ..Default::default() };
    let ctx = CCtx::new(params).unwrap();
    let mut a = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let na = compress_ctx(&ctx, &src, &mut a).unwrap();
    a.truncate(na);

    // The one-shot layer spins an ephemeral context with the same defaults
    // (shuffle selector 1 = byte shuffle, typesize via argument).
    let mut b = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let nb = blosc2::compress(5, bloscr::SHUFFLE, 4, &src, &mut b).unwrap();
    b.truncate(nb);
    assert_eq!(a, b);
}

#[test]
fn set_nthreads_between_calls() {
    let src = ramp(1 << 20);
    let mut ctx = CCtx::new(CParams { typesize: 4, nthreads: 1, ..Default::default() }).unwrap();
    let mut serial = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let n1 = compress_ctx(&ctx, &src, &mut serial).unwrap();

    ctx.set_nthreads(4).unwrap();
    let mut parallel = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let n2 = compress_ctx(&ctx, &src, &mut parallel).unwrap();
    assert_eq!(&serial[..n1], &parallel[..n2]);

    let mut dctx = DCtx::new(DParams { nthreads: 1, ..Default::default() }).unwrap();
    dctx.set_nthreads(4).unwrap();
    let mut out = vec![0u8; src.len()];
    assert_eq!(decompress_ctx(&mut dctx, &serial[..n1], &mut out).unwrap(), src.len());
    assert_eq!(out, src);
}

#[test]
fn maskout_is_single_use_and_validated() {
    let src = ramp(1 << 19);
    let ctx = CCtx::new(CParams { typesize: 4, ..Default::default() }).unwrap();
    let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
    chunk.truncate(cbytes);
    let nblocks = ChunkInfo::parse(&chunk).unwrap().nblocks();
    assert!(nblocks > 1);

    let mut dctx = DCtx::new(DParams::new()).unwrap();
    // Wrong length: rejected, and consumed nonetheless.
    dctx.set_maskout(vec![false; nblocks + 1]);
    let mut out = vec![0u8; src.len()];
    assert!(decompress_ctx(&mut dctx, &chunk, &mut out).is_err());
    assert_eq!(decompress_ctx(&mut dctx, &chunk, &mut out).unwrap(), src.len());
    assert_eq!(out, src);
}

#[test]
fn prefilter_feeds_the_pipeline() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    let params = CParams {
        typesize: 4,
        pipeline: Pipeline::single(BLOSC_SHUFFLE, 0),
        prefilter: Some(Arc::new(|p: &mut PrefilterParams| {
            CALLS.fetch_add(1, Ordering::Relaxed);
            // Double every input byte.
            for (o, &i) in p.output.iter_mut().zip(p.input.iter()) {
                *o = i.wrapping_mul(2);
            }
            Ok(())
        })),
        ..Default::default()
    };
    let src = ramp(200_000);
    let ctx = CCtx::new(params).unwrap();
    let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
    chunk.truncate(cbytes);
    assert!(CALLS.load(Ordering::Relaxed) > 0);

    let mut out = vec![0u8; src.len()];
    bloscr::decompress(&chunk, &mut out).unwrap();
    for (o, i) in out.iter().zip(src.iter()) {
        assert_eq!(*o, i.wrapping_mul(2));
    }
}

#[test]
fn failing_prefilter_aborts_the_chunk() {
    let params = CParams {
        typesize: 1,
        prefilter: Some(Arc::new(|_: &mut PrefilterParams| {
            Err(bloscr::Error::Data("synthesizer ran dry"))
        })),
        ..Default::default()
    };
    let ctx = CCtx::new(params).unwrap();
    let mut chunk = vec![0u8; 1024 + BLOSC2_MAX_OVERHEAD];
    assert!(compress_ctx(&ctx, &ramp(1024), &mut chunk).is_err());
}

#[test]
fn postfilter_sees_every_block() {
    let src = ramp(1 << 18);
    let ctx = CCtx::new(CParams { typesize: 4, ..Default::default() }).unwrap();
    let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
    chunk.truncate(cbytes);

    let mut dctx = DCtx::new(DParams::new()).unwrap();
    dctx.set_postfilter(Some(Arc::new(|p: &mut PostfilterParams| {
        for (o, &i) in p.output.iter_mut().zip(p.input.iter()) {
            *o = !i;
        }
        Ok(())
    })));
    let mut out = vec![0u8; src.len()];
    decompress_ctx(&mut dctx, &chunk, &mut out).unwrap();
    for (o, i) in out.iter().zip(src.iter()) {
        assert_eq!(*o, !i);
    }
}

#[test]
fn getitem_with_ctx() {
    let src = ramp(400_000);
    let ctx = CCtx::new(CParams { typesize: 8, ..Default::default() }).unwrap();
    let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
    chunk.truncate(cbytes);

    let mut dctx = DCtx::new(DParams::new()).unwrap();
    let mut out = vec![0u8; 800];
    let n = getitem_ctx(&mut dctx, &chunk, 12_345, 100, &mut out).unwrap();
    assert_eq!(n, 800);
    assert_eq!(out, &src[12_345 * 8..12_345 * 8 + 800]);
}

#[test]
fn zstd_dictionary_through_params() {
    let dict: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
    let src: Vec<u8> = dict.iter().cycle().take(1 << 18).copied().collect();
    let dict = Arc::new(dict);
    let params = CParams {
        compcode: BLOSC_ZSTD,
        typesize: 1,
        pipeline: Pipeline::empty(),
        use_dict: true,
        dict: Some(dict.clone()),
        ..Default::default()
    };
    let ctx = CCtx::new(params).unwrap();
    let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
    let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
    chunk.truncate(cbytes);

    let mut dctx = DCtx::new(DParams { dict: Some(dict), ..DParams::new() }).unwrap();
    let mut out = vec![0u8; src.len()];
    assert_eq!(decompress_ctx(&mut dctx, &chunk, &mut out).unwrap(), src.len());
    assert_eq!(out, src);
}
