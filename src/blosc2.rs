//! Block and chunk engine.
//!
//! A chunk is a 32-byte header, an optional block-starts table and the
//! concatenated compressed blocks. Each block runs prefilter → filter
//! pipeline → codec on compression and the reverse on decompression; blocks
//! are dispatched to the context's worker pool and assembled in index order,
//! so the output bytes do not depend on the thread count.

use std::borrow::Cow;

use rayon::prelude::*;

use crate::codecs::{Codec, CodecRuntime};
use crate::constants::*;
use crate::context::{CCtx, DCtx, DParams};
use crate::error::{Error, Result};
use crate::filters::{self, FilterRuntime, Pipeline, PostfilterFn, PostfilterParams, PrefilterParams};
use crate::registry::Registry;
use crate::stune;
use crate::util::{st32, sw32};

// Extended-header field offsets.
const CHUNK_VERSION: usize = 0x0;
const CHUNK_VERSIONLZ: usize = 0x1;
const CHUNK_FLAGS: usize = 0x2;
const CHUNK_TYPESIZE: usize = 0x3;
const CHUNK_NBYTES: usize = 0x4;
const CHUNK_BLOCKSIZE: usize = 0x8;
const CHUNK_CBYTES: usize = 0xc;
const CHUNK_FILTER_CODES: usize = 0x10;
const CHUNK_COMPCODE: usize = 0x16;
const CHUNK_COMPCODE_META: usize = 0x17;
const CHUNK_FILTER_META: usize = 0x18;
const CHUNK_BLOSC2_FLAGS: usize = 0x1f;

/// Parsed view of a chunk header.
#[derive(Clone, Debug)]
pub struct ChunkInfo {
    pub version: u8,
    pub versionlz: u8,
    pub flags: u8,
    pub typesize: usize,
    pub nbytes: usize,
    pub blocksize: usize,
    pub cbytes: usize,
    pub pipeline: Pipeline,
    pub compcode: u8,
    pub compcode_meta: u8,
    pub blosc2_flags: u8,
}

impl ChunkInfo {
    pub fn parse(chunk: &[u8]) -> Result<ChunkInfo> {
        if chunk.len() < BLOSC_EXTENDED_HEADER_LENGTH {
            return Err(Error::ReadBuffer);
        }
        let version = chunk[CHUNK_VERSION];
        if version > BLOSC2_VERSION_FORMAT {
            return Err(Error::FrameVersion(version));
        }
        let flags = chunk[CHUNK_FLAGS];
        if flags & BLOSC_EXTENDED_HEADER == 0 {
            return Err(Error::Corruption("chunk has no extended header"));
        }
        let nbytes = sw32(chunk, CHUNK_NBYTES)?;
        let blocksize = sw32(chunk, CHUNK_BLOCKSIZE)?;
        let cbytes = sw32(chunk, CHUNK_CBYTES)?;
        if nbytes < 0 || blocksize < 0 || cbytes < BLOSC_EXTENDED_HEADER_LENGTH as i32 {
            return Err(Error::Corruption("impossible size field in chunk header"));
        }
        let typesize = chunk[CHUNK_TYPESIZE] as usize;
        if typesize == 0 {
            return Err(Error::Corruption("chunk typesize is zero"));
        }
        let mut pipeline = Pipeline::empty();
        pipeline.filters.copy_from_slice(&chunk[CHUNK_FILTER_CODES..CHUNK_FILTER_CODES + BLOSC2_MAX_FILTERS]);
        pipeline
            .filters_meta
            .copy_from_slice(&chunk[CHUNK_FILTER_META..CHUNK_FILTER_META + BLOSC2_MAX_FILTERS]);
        Ok(ChunkInfo {
            version,
            versionlz: chunk[CHUNK_VERSIONLZ],
            flags,
            typesize,
            nbytes: nbytes as usize,
            blocksize: blocksize as usize,
            cbytes: cbytes as usize,
            pipeline,
            compcode: chunk[CHUNK_COMPCODE],
            compcode_meta: chunk[CHUNK_COMPCODE_META],
            blosc2_flags: chunk[CHUNK_BLOSC2_FLAGS],
        })
    }

    /// Special-chunk kind, [`BLOSC2_NO_SPECIAL`] for regular chunks.
    pub fn special(&self) -> u8 {
        (self.blosc2_flags >> BLOSC2_SPECIAL_SHIFT) & BLOSC2_SPECIAL_MASK
    }

    pub fn memcpyed(&self) -> bool {
        self.flags & BLOSC_MEMCPYED != 0
    }

    pub fn dont_split(&self) -> bool {
        self.flags & BLOSC_DONT_SPLIT != 0
    }

    pub fn nblocks(&self) -> usize {
        if self.nbytes == 0 || self.blocksize == 0 {
            0
        } else {
            self.nbytes.div_ceil(self.blocksize)
        }
    }

    fn block_nbytes(&self, nblock: usize) -> usize {
        if nblock + 1 == self.nblocks() && self.nbytes % self.blocksize != 0 {
            self.nbytes % self.blocksize
        } else {
            self.blocksize
        }
    }

    fn nstreams(&self, nblock: usize) -> usize {
        let leftover = nblock + 1 == self.nblocks() && self.nbytes % self.blocksize != 0;
        if self.dont_split() || leftover {
            1
        } else {
            self.typesize
        }
    }
}

fn host_endian_flag() -> u8 {
    if cfg!(target_endian = "little") {
        BLOSC_LITTLE_ENDIAN
    } else {
        0
    }
}

#[allow(clippy::too_many_arguments)]
fn write_header(
    dest: &mut [u8],
    flags: u8,
    typesize: usize,
    nbytes: usize,
    blocksize: usize,
    cbytes: usize,
    pipeline: &Pipeline,
    compcode: u8,
    compcode_meta: u8,
    blosc2_flags: u8,
) {
    dest[CHUNK_VERSION] = BLOSC2_VERSION_FORMAT;
    dest[CHUNK_VERSIONLZ] = 1;
    dest[CHUNK_FLAGS] = flags | BLOSC_EXTENDED_HEADER | host_endian_flag();
    dest[CHUNK_TYPESIZE] = typesize as u8;
    st32(dest, CHUNK_NBYTES, nbytes as i32);
    st32(dest, CHUNK_BLOCKSIZE, blocksize as i32);
    st32(dest, CHUNK_CBYTES, cbytes as i32);
    dest[CHUNK_FILTER_CODES..CHUNK_FILTER_CODES + BLOSC2_MAX_FILTERS].copy_from_slice(&pipeline.filters);
    dest[CHUNK_COMPCODE] = compcode;
    dest[CHUNK_COMPCODE_META] = compcode_meta;
    dest[CHUNK_FILTER_META..CHUNK_FILTER_META + BLOSC2_MAX_FILTERS].copy_from_slice(&pipeline.filters_meta);
    dest[0x1e] = 0;
    dest[CHUNK_BLOSC2_FLAGS] = blosc2_flags;
}

/// The delta filter references the chunk's first block, so it must sit in the
/// first active slot and cannot follow a prefilter (whose block-0 output is
/// not available to the workers handling the other blocks).
fn check_delta_position(pipeline: &Pipeline, has_prefilter: bool) -> Result<()> {
    if !pipeline.contains(BLOSC_DELTA) {
        return Ok(());
    }
    if has_prefilter {
        return Err(Error::FilterFailure { filter: BLOSC_DELTA, reason: "delta cannot be combined with a prefilter" });
    }
    match pipeline.active().next() {
        Some((BLOSC_DELTA, _)) => Ok(()),
        _ => Err(Error::FilterFailure { filter: BLOSC_DELTA, reason: "delta must be the first filter in the pipeline" }),
    }
}

/// Everything one block-compression task needs, shared across workers.
struct CompressShared<'a> {
    src: &'a [u8],
    blocksize: usize,
    typesize: usize,
    clevel: i32,
    compcode_meta: u8,
    split: bool,
    pipeline: &'a Pipeline,
    codec: &'a dyn Codec,
    registry: &'a Registry,
    prefilter: Option<&'a filters::PrefilterFn>,
    dict: Option<&'a [u8]>,
    codec_params: Option<&'a [u8]>,
    nchunk: i64,
}

/// Compress one block into its own body buffer (stream length prefixes
/// included); the caller concatenates bodies in index order.
fn compress_block(shared: &CompressShared, nblock: usize) -> Result<Vec<u8>> {
    let offset = nblock * shared.blocksize;
    let bsize = shared.blocksize.min(shared.src.len() - offset);
    let block_src = &shared.src[offset..offset + bsize];
    // The delta reference is the first block of the chunk source.
    let dref = &shared.src[..shared.blocksize.min(shared.src.len())];

    let mut cur: Cow<[u8]> = Cow::Borrowed(block_src);
    if let Some(callback) = shared.prefilter {
        let mut out = vec![0u8; bsize];
        let mut params = PrefilterParams {
            input: block_src,
            output: &mut out,
            nblock,
            offset,
            typesize: shared.typesize,
            nchunk: shared.nchunk,
        };
        callback(&mut params)?;
        cur = Cow::Owned(out);
    }

    let rt = FilterRuntime { typesize: shared.typesize, dref, offset };
    for (id, meta) in shared.pipeline.active() {
        let mut out = vec![0u8; bsize];
        filters::forward(id, meta, &rt, &cur, &mut out, shared.registry)?;
        cur = Cow::Owned(out);
    }

    // Leftover blocks are never split.
    let nstreams = if shared.split && bsize == shared.blocksize { shared.typesize } else { 1 };
    let neblock = bsize / nstreams;
    let codec_rt = CodecRuntime {
        typesize: shared.typesize,
        dict: shared.dict,
        params: shared.codec_params,
        nchunk: shared.nchunk,
    };

    let mut body = Vec::with_capacity(bsize + 4 * nstreams);
    // Codecs may demand worst-case room up front (snappy does); anything at
    // or above neblock is stored raw afterwards anyway.
    let scratch_len = neblock + neblock / 6 + 64;
    let mut scratch = vec![0u8; scratch_len];
    for j in 0..nstreams {
        let stream_src = &cur[j * neblock..(j + 1) * neblock];
        let csize = if neblock > 0 {
            shared
                .codec
                .compress(stream_src, &mut scratch, shared.clevel, shared.compcode_meta, &codec_rt)?
        } else {
            0
        };
        if csize == 0 || csize >= neblock {
            // Incompressible stream: store it verbatim, length as the marker.
            body.extend_from_slice(&(neblock as i32).to_le_bytes());
            body.extend_from_slice(stream_src);
        } else {
            body.extend_from_slice(&(csize as i32).to_le_bytes());
            body.extend_from_slice(&scratch[..csize]);
        }
    }
    Ok(body)
}

/// Compress `src` into a chunk written at the start of `dest`, returning the
/// chunk's `cbytes`. `dest` should hold `src.len() + BLOSC2_MAX_OVERHEAD`.
pub fn compress_ctx(ctx: &CCtx, src: &[u8], dest: &mut [u8]) -> Result<usize> {
    let params = ctx.params();
    params.validate()?;
    let nbytes = src.len();
    if nbytes > BLOSC2_MAX_BUFFERSIZE {
        return Err(Error::MaxBufsizeExceeded);
    }
    if dest.len() < BLOSC_EXTENDED_HEADER_LENGTH {
        return Err(Error::WriteBuffer);
    }

    let registry = ctx.registry.read().unwrap_or_else(|e| e.into_inner());
    params.pipeline.validate(&registry)?;
    check_delta_position(&params.pipeline, params.prefilter.is_some())?;

    let filter_flags = params.pipeline.header_flags();
    let blocksize = stune::compute_blocksize(
        params.clevel,
        params.typesize,
        nbytes,
        params.compcode,
        params.blocksize,
        params.splitmode,
        filter_flags,
    );
    let split = stune::split_block(
        params.splitmode,
        params.compcode,
        params.clevel,
        params.typesize,
        blocksize,
        filter_flags,
    ) && blocksize % params.typesize == 0;

    let mut flags = filter_flags;
    if !split {
        flags |= BLOSC_DONT_SPLIT;
    }
    if params.compcode > BLOSC2_DEFINED_CODECS_STOP {
        flags |= BLOSC_HIGH_CODEC;
    }
    let blosc2_flags = if params.use_dict { BLOSC2_USEDICT } else { 0 };

    // Verbatim chunks still carry the prefilter's output, not the source.
    let prefiltered_source = || -> Result<Option<Vec<u8>>> {
        let Some(callback) = &params.prefilter else { return Ok(None) };
        let mut out = vec![0u8; nbytes];
        let mut offset = 0usize;
        let mut nblock = 0usize;
        while offset < nbytes {
            let bsize = blocksize.min(nbytes - offset);
            let mut pf = PrefilterParams {
                input: &src[offset..offset + bsize],
                output: &mut out[offset..offset + bsize],
                nblock,
                offset,
                typesize: params.typesize,
                nchunk: ctx.nchunk,
            };
            callback(&mut pf)?;
            offset += bsize;
            nblock += 1;
        }
        Ok(Some(out))
    };

    let memcpy_chunk = |dest: &mut [u8], flags: u8, data: &[u8]| -> Result<usize> {
        let cbytes = BLOSC_EXTENDED_HEADER_LENGTH + nbytes;
        if dest.len() < cbytes {
            return Err(Error::WriteBuffer);
        }
        write_header(
            dest,
            flags | BLOSC_MEMCPYED,
            params.typesize,
            nbytes,
            blocksize,
            cbytes,
            &params.pipeline,
            params.compcode,
            params.compcode_meta,
            blosc2_flags,
        );
        dest[BLOSC_EXTENDED_HEADER_LENGTH..cbytes].copy_from_slice(data);
        Ok(cbytes)
    };

    // Plain copies: explicit request or inputs too small to bother with.
    if params.clevel == 0 || nbytes < BLOSC_MIN_BUFFERSIZE {
        return match prefiltered_source()? {
            Some(data) => memcpy_chunk(dest, flags, &data),
            None => memcpy_chunk(dest, flags, src),
        };
    }

    let nblocks = if nbytes == 0 { 0 } else { nbytes.div_ceil(blocksize) };
    let codec = registry.codec(params.compcode)?;

    let shared = CompressShared {
        src,
        blocksize,
        typesize: params.typesize,
        clevel: params.clevel,
        compcode_meta: params.compcode_meta,
        split,
        pipeline: &params.pipeline,
        codec: &*codec,
        registry: &registry,
        prefilter: params.prefilter.as_ref(),
        dict: params.dict.as_deref().filter(|_| params.use_dict).map(|d| d.as_slice()),
        codec_params: params.codec_params.as_deref().map(|p| p.as_slice()),
        nchunk: ctx.nchunk,
    };

    let bodies: Vec<Vec<u8>> = match (&ctx.pool, nblocks > 1) {
        (Some(pool), true) => pool.install(|| {
            (0..nblocks)
                .into_par_iter()
                .map(|nblock| compress_block(&shared, nblock))
                .collect::<Result<_>>()
        })?,
        _ => (0..nblocks).map(|nblock| compress_block(&shared, nblock)).collect::<Result<_>>()?,
    };

    let table_len = nblocks * 4;
    let body_len: usize = bodies.iter().map(|b| b.len()).sum();
    let cbytes = BLOSC_EXTENDED_HEADER_LENGTH + table_len + body_len;

    // Expansion (or no gain): fall back to a verbatim chunk.
    if table_len + body_len >= nbytes {
        return match prefiltered_source()? {
            Some(data) => memcpy_chunk(dest, flags, &data),
            None => memcpy_chunk(dest, flags, src),
        };
    }
    if dest.len() < cbytes {
        return Err(Error::WriteBuffer);
    }

    write_header(
        dest,
        flags,
        params.typesize,
        nbytes,
        blocksize,
        cbytes,
        &params.pipeline,
        params.compcode,
        params.compcode_meta,
        blosc2_flags,
    );
    let mut cursor = BLOSC_EXTENDED_HEADER_LENGTH + table_len;
    for (i, body) in bodies.iter().enumerate() {
        st32(dest, BLOSC_EXTENDED_HEADER_LENGTH + i * 4, cursor as i32);
        dest[cursor..cursor + body.len()].copy_from_slice(body);
        cursor += body.len();
    }
    Ok(cbytes)
}

/// Everything one block-decompression task needs, shared across workers.
struct DecompressShared<'a> {
    info: &'a ChunkInfo,
    chunk: &'a [u8],
    bstarts: &'a [u32],
    dref: &'a [u8],
    codec: &'a dyn Codec,
    registry: &'a Registry,
    postfilter: Option<&'a PostfilterFn>,
    dict: Option<&'a [u8]>,
    nchunk: i64,
}

/// Decode the raw (filtered) bytes of one block into `out`.
fn decode_block_streams(shared: &DecompressShared, nblock: usize, out: &mut [u8]) -> Result<()> {
    let info = shared.info;
    let block_nbytes = info.block_nbytes(nblock);
    debug_assert_eq!(out.len(), block_nbytes);
    let nstreams = info.nstreams(nblock);
    if block_nbytes % nstreams != 0 {
        return Err(Error::Corruption("block length is not divisible into streams"));
    }
    let neblock = block_nbytes / nstreams;

    let bstart = shared.bstarts[nblock] as usize;
    if bstart < BLOSC_EXTENDED_HEADER_LENGTH || bstart > info.cbytes {
        return Err(Error::Corruption("block start outside chunk"));
    }
    let content = &shared.chunk[bstart..info.cbytes.min(shared.chunk.len())];
    let codec_rt = CodecRuntime { typesize: info.typesize, dict: shared.dict, params: None, nchunk: shared.nchunk };

    let mut coff = 0usize;
    for j in 0..nstreams {
        if coff + 4 > content.len() {
            return Err(Error::Corruption("truncated stream header"));
        }
        let len = i32::from_le_bytes(content[coff..coff + 4].try_into().unwrap());
        coff += 4;
        let slot = &mut out[j * neblock..(j + 1) * neblock];
        if len == 0 {
            // A run of zeros.
            slot.fill(0);
        } else if len < 0 {
            return Err(Error::Corruption("negative stream length"));
        } else if len as usize == neblock {
            // Verbatim stream.
            if coff + neblock > content.len() {
                return Err(Error::Corruption("verbatim stream overruns chunk"));
            }
            slot.copy_from_slice(&content[coff..coff + neblock]);
            coff += neblock;
        } else {
            let len = len as usize;
            if coff + len > content.len() {
                return Err(Error::Corruption("compressed stream overruns chunk"));
            }
            let n = shared.codec.decompress(&content[coff..coff + len], slot, info.compcode_meta, &codec_rt)?;
            if n != neblock {
                return Err(Error::Corruption("stream decoded to the wrong length"));
            }
            coff += len;
        }
    }
    Ok(())
}

/// Decompress one block into `dest_block` (its slice of the destination),
/// reversing the filter pipeline and running the postfilter.
fn decompress_block(shared: &DecompressShared, nblock: usize, dest_block: &mut [u8]) -> Result<()> {
    let info = shared.info;
    let block_nbytes = info.block_nbytes(nblock);
    let offset = nblock * info.blocksize;

    let mut cur = vec![0u8; block_nbytes];
    decode_block_streams(shared, nblock, &mut cur)?;

    let rt = FilterRuntime { typesize: info.typesize, dref: shared.dref, offset };
    let stages: Vec<(u8, u8)> = info.pipeline.active().collect();
    for (id, meta) in stages.into_iter().rev() {
        let mut out = vec![0u8; block_nbytes];
        filters::backward(id, meta, &rt, &cur, &mut out, shared.registry)?;
        cur = out;
    }
    dest_block[..block_nbytes].copy_from_slice(&cur);

    if let Some(callback) = shared.postfilter {
        let mut params = PostfilterParams {
            input: &cur,
            output: dest_block,
            nblock,
            offset,
            typesize: info.typesize,
            nchunk: shared.nchunk,
        };
        callback(&mut params)?;
    }
    Ok(())
}

fn fill_special(info: &ChunkInfo, chunk: &[u8], dest: &mut [u8]) -> Result<usize> {
    let nbytes = info.nbytes;
    match info.special() {
        BLOSC2_SPECIAL_ZERO => dest[..nbytes].fill(0),
        BLOSC2_SPECIAL_NAN => match info.typesize {
            4 => {
                for slot in dest[..nbytes].chunks_exact_mut(4) {
                    slot.copy_from_slice(&f32::NAN.to_le_bytes());
                }
            }
            8 => {
                for slot in dest[..nbytes].chunks_exact_mut(8) {
                    slot.copy_from_slice(&f64::NAN.to_le_bytes());
                }
            }
            _ => return Err(Error::Data("NaN special chunk needs typesize 4 or 8")),
        },
        BLOSC2_SPECIAL_VALUE => {
            let ts = info.typesize;
            let value = chunk
                .get(BLOSC_EXTENDED_HEADER_LENGTH..BLOSC_EXTENDED_HEADER_LENGTH + ts)
                .ok_or(Error::Corruption("value chunk is missing its payload"))?;
            for slot in dest[..nbytes].chunks_mut(ts) {
                slot.copy_from_slice(&value[..slot.len()]);
            }
        }
        BLOSC2_SPECIAL_UNINIT => {
            // Uninitialized: the destination contents are left as they are.
        }
        _ => return Err(Error::Corruption("unknown special chunk kind")),
    }
    Ok(nbytes)
}

fn read_bstarts(info: &ChunkInfo, chunk: &[u8]) -> Result<Vec<u32>> {
    let nblocks = info.nblocks();
    let table_end = BLOSC_EXTENDED_HEADER_LENGTH + nblocks * 4;
    if chunk.len() < table_end || info.cbytes < table_end {
        return Err(Error::Corruption("chunk too short for its block table"));
    }
    let mut bstarts = Vec::with_capacity(nblocks);
    let mut prev = 0u32;
    for i in 0..nblocks {
        let off = sw32(chunk, BLOSC_EXTENDED_HEADER_LENGTH + i * 4)? as u32;
        if off < prev {
            return Err(Error::Corruption("block starts are not increasing"));
        }
        prev = off;
        bstarts.push(off);
    }
    Ok(bstarts)
}

/// Decompress a whole chunk into `dest`, returning the payload size.
pub fn decompress_ctx(ctx: &mut DCtx, chunk: &[u8], dest: &mut [u8]) -> Result<usize> {
    let info = ChunkInfo::parse(chunk)?;
    let maskout = ctx.maskout.take();

    if dest.len() < info.nbytes {
        return Err(Error::WriteBuffer);
    }
    if info.special() != BLOSC2_NO_SPECIAL {
        return fill_special(&info, chunk, dest);
    }
    if chunk.len() < info.cbytes {
        return Err(Error::ReadBuffer);
    }
    if info.memcpyed() {
        if info.cbytes != BLOSC_EXTENDED_HEADER_LENGTH + info.nbytes {
            return Err(Error::Corruption("bad cbytes for verbatim chunk"));
        }
        dest[..info.nbytes]
            .copy_from_slice(&chunk[BLOSC_EXTENDED_HEADER_LENGTH..BLOSC_EXTENDED_HEADER_LENGTH + info.nbytes]);
        if let Some(callback) = &ctx.params.postfilter {
            let blocksize = if info.blocksize > 0 { info.blocksize } else { info.nbytes.max(1) };
            let mut offset = 0usize;
            let mut nblock = 0usize;
            while offset < info.nbytes {
                let bsize = blocksize.min(info.nbytes - offset);
                let input = dest[offset..offset + bsize].to_vec();
                let mut pf = PostfilterParams {
                    input: &input,
                    output: &mut dest[offset..offset + bsize],
                    nblock,
                    offset,
                    typesize: info.typesize,
                    nchunk: ctx.nchunk,
                };
                callback(&mut pf)?;
                offset += bsize;
                nblock += 1;
            }
        }
        return Ok(info.nbytes);
    }
    if info.nbytes == 0 {
        return Ok(0);
    }

    let nblocks = info.nblocks();
    if let Some(mask) = &maskout {
        if mask.len() != nblocks {
            return Err(Error::InvalidParam("maskout length does not match the block count"));
        }
    }
    let bstarts = read_bstarts(&info, chunk)?;

    let registry = ctx.registry.read().unwrap_or_else(|e| e.into_inner());
    let codec = registry.codec(info.compcode)?;
    let dict = ctx.params.dict.clone();

    // The delta reference is block 0's decoded output; produce it up front.
    let mut dref: Vec<u8> = Vec::new();
    if info.pipeline.contains(BLOSC_DELTA) {
        let shared = DecompressShared {
            info: &info,
            chunk,
            bstarts: &bstarts,
            dref: &[],
            codec: &*codec,
            registry: &registry,
            postfilter: None,
            dict: dict.as_deref().map(|d| d.as_slice()),
            nchunk: ctx.nchunk,
        };
        let mut block0 = vec![0u8; info.block_nbytes(0)];
        decompress_block(&shared, 0, &mut block0)?;
        dref = block0;
    }

    let shared = DecompressShared {
        info: &info,
        chunk,
        bstarts: &bstarts,
        dref: &dref,
        codec: &*codec,
        registry: &registry,
        postfilter: ctx.params.postfilter.as_ref(),
        dict: dict.as_deref().map(|d| d.as_slice()),
        nchunk: ctx.nchunk,
    };

    fn run_block(
        shared: &DecompressShared,
        maskout: &Option<Vec<bool>>,
        nblock: usize,
        dest_block: &mut [u8],
    ) -> Result<()> {
        if maskout.as_ref().is_some_and(|m| m[nblock]) {
            return Ok(());
        }
        decompress_block(shared, nblock, dest_block)
    }

    match (&ctx.pool, nblocks > 1) {
        (Some(pool), true) => pool.install(|| {
            dest[..info.nbytes]
                .par_chunks_mut(info.blocksize)
                .enumerate()
                .map(|(nblock, dest_block)| run_block(&shared, &maskout, nblock, dest_block))
                .collect::<Result<()>>()
        })?,
        _ => {
            for (nblock, dest_block) in dest[..info.nbytes].chunks_mut(info.blocksize).enumerate() {
                run_block(&shared, &maskout, nblock, dest_block)?;
            }
        }
    }
    Ok(info.nbytes)
}

/// Random access: copy `nitems` elements starting at item `start` out of a
/// chunk, decompressing only the covering blocks.
pub fn getitem_ctx(ctx: &mut DCtx, chunk: &[u8], start: usize, nitems: usize, dest: &mut [u8]) -> Result<usize> {
    let info = ChunkInfo::parse(chunk)?;
    // getitem ignores any armed maskout; drop it as a used-up call would.
    ctx.maskout.take();

    let typesize = info.typesize;
    let start_byte = start * typesize;
    let end_byte = (start + nitems) * typesize;
    let out_len = end_byte - start_byte;
    if end_byte > info.nbytes {
        return Err(Error::InvalidParam("item range outside chunk"));
    }
    if dest.len() < out_len {
        return Err(Error::WriteBuffer);
    }
    if nitems == 0 {
        return Ok(0);
    }

    if info.special() != BLOSC2_NO_SPECIAL {
        // Materialize only the requested item range of the pattern.
        let mut scratch = vec![0u8; out_len];
        let patched = ChunkInfo { nbytes: out_len, ..info.clone() };
        fill_special(&patched, chunk, &mut scratch)?;
        dest[..out_len].copy_from_slice(&scratch);
        return Ok(out_len);
    }
    if chunk.len() < info.cbytes {
        return Err(Error::ReadBuffer);
    }
    if info.memcpyed() {
        dest[..out_len].copy_from_slice(
            &chunk[BLOSC_EXTENDED_HEADER_LENGTH + start_byte..BLOSC_EXTENDED_HEADER_LENGTH + end_byte],
        );
        if let Some(callback) = &ctx.params.postfilter {
            let input = dest[..out_len].to_vec();
            let blocksize = if info.blocksize > 0 { info.blocksize } else { info.nbytes.max(1) };
            let mut pf = PostfilterParams {
                input: &input,
                output: &mut dest[..out_len],
                nblock: start_byte / blocksize,
                offset: start_byte,
                typesize: info.typesize,
                nchunk: ctx.nchunk,
            };
            callback(&mut pf)?;
        }
        return Ok(out_len);
    }

    let bstarts = read_bstarts(&info, chunk)?;
    let registry = ctx.registry.read().unwrap_or_else(|e| e.into_inner());
    let codec = registry.codec(info.compcode)?;
    let dict = ctx.params.dict.clone();

    let mut dref: Vec<u8> = Vec::new();
    let needs_ref = info.pipeline.contains(BLOSC_DELTA);

    let mut shared = DecompressShared {
        info: &info,
        chunk,
        bstarts: &bstarts,
        dref: &[],
        codec: &*codec,
        registry: &registry,
        postfilter: ctx.params.postfilter.as_ref(),
        dict: dict.as_deref().map(|d| d.as_slice()),
        nchunk: ctx.nchunk,
    };
    if needs_ref {
        let mut block0 = vec![0u8; info.block_nbytes(0)];
        decompress_block(&shared, 0, &mut block0)?;
        dref = block0;
        shared.dref = &dref;
    }

    let start_block = start_byte / info.blocksize;
    let end_block = (end_byte - 1) / info.blocksize;
    let mut written = 0usize;
    for nblock in start_block..=end_block {
        let block_nbytes = info.block_nbytes(nblock);
        let block_start = nblock * info.blocksize;
        let copy_start = start_byte.max(block_start);
        let copy_stop = end_byte.min(block_start + block_nbytes);

        // Cell-addressable codecs can skip the full block decode when the
        // request stays inside one cell and no filters are in the way.
        let mut copied = false;
        if shared.codec.supports_cells() && info.pipeline.is_empty() && info.nstreams(nblock) == 1 {
            if let Some(cell_nitems) =
                shared.codec.cell_nitems(info.compcode_meta, typesize).filter(|&c| c > 0)
            {
                let cell_bytes = cell_nitems * typesize;
                let rel_start = copy_start - block_start;
                let rel_stop = copy_stop - block_start;
                if rel_start / cell_bytes == (rel_stop - 1) / cell_bytes {
                    let ncells = block_nbytes.div_ceil(cell_bytes);
                    let cell = rel_start / cell_bytes;
                    let bstart = bstarts[nblock] as usize;
                    let body = &chunk[bstart..info.cbytes];
                    let mut cellbuf = vec![0u8; cell_bytes];
                    if shared.codec.get_cell(body, ncells, cell, &mut cellbuf).is_ok() {
                        let in_cell = rel_start - cell * cell_bytes;
                        dest[written..written + (copy_stop - copy_start)]
                            .copy_from_slice(&cellbuf[in_cell..in_cell + (copy_stop - copy_start)]);
                        copied = true;
                    }
                }
            }
        }

        if !copied {
            let mut block = vec![0u8; block_nbytes];
            decompress_block(&shared, nblock, &mut block)?;
            dest[written..written + (copy_stop - copy_start)]
                .copy_from_slice(&block[copy_start - block_start..copy_stop - block_start]);
        }
        written += copy_stop - copy_start;
    }
    Ok(written)
}

/// `(nbytes, cbytes, blocksize)` of a compressed chunk.
pub fn cbuffer_sizes(chunk: &[u8]) -> Result<(usize, usize, usize)> {
    let info = ChunkInfo::parse(chunk)?;
    Ok((info.nbytes, info.cbytes, info.blocksize))
}

/// `(typesize, flags)` of a compressed chunk.
pub fn cbuffer_metainfo(chunk: &[u8]) -> Result<(usize, u8)> {
    let info = ChunkInfo::parse(chunk)?;
    Ok((info.typesize, info.flags))
}

/// Quick structural validation without decompressing.
pub fn cbuffer_validate(chunk: &[u8]) -> Result<usize> {
    let info = ChunkInfo::parse(chunk)?;
    if chunk.len() < info.cbytes {
        return Err(Error::Corruption("chunk is truncated"));
    }
    if info.special() == BLOSC2_NO_SPECIAL && !info.memcpyed() && info.nbytes > 0 {
        read_bstarts(&info, chunk)?;
    }
    Ok(info.nbytes)
}

fn special_chunk(
    kind: u8,
    typesize: usize,
    nbytes: usize,
    pipeline: &Pipeline,
    compcode: u8,
    value: Option<&[u8]>,
) -> Result<Vec<u8>> {
    if typesize == 0 || typesize > BLOSC_MAX_TYPESIZE {
        return Err(Error::InvalidParam("typesize must be in 1..=255"));
    }
    if nbytes > BLOSC2_MAX_BUFFERSIZE {
        return Err(Error::MaxBufsizeExceeded);
    }
    if nbytes % typesize != 0 {
        return Err(Error::InvalidParam("special chunk length must be a multiple of typesize"));
    }
    let extra = value.map_or(0, <[u8]>::len);
    let cbytes = BLOSC_EXTENDED_HEADER_LENGTH + extra;
    let mut chunk = vec![0u8; cbytes];
    write_header(
        &mut chunk,
        0,
        typesize,
        nbytes,
        0,
        cbytes,
        pipeline,
        compcode,
        0,
        kind << BLOSC2_SPECIAL_SHIFT,
    );
    if let Some(value) = value {
        chunk[BLOSC_EXTENDED_HEADER_LENGTH..].copy_from_slice(value);
    }
    Ok(chunk)
}

/// Header-only chunk decompressing to `nbytes` zero bytes.
pub fn chunk_zeros(typesize: usize, nbytes: usize, pipeline: &Pipeline, compcode: u8) -> Result<Vec<u8>> {
    special_chunk(BLOSC2_SPECIAL_ZERO, typesize, nbytes, pipeline, compcode, None)
}

/// Header-only chunk decompressing to NaN floats (typesize 4 or 8 only).
pub fn chunk_nans(typesize: usize, nbytes: usize, pipeline: &Pipeline, compcode: u8) -> Result<Vec<u8>> {
    if typesize != 4 && typesize != 8 {
        return Err(Error::Data("NaN special chunk needs typesize 4 or 8"));
    }
    special_chunk(BLOSC2_SPECIAL_NAN, typesize, nbytes, pipeline, compcode, None)
}

/// Header-only chunk whose contents are left uninitialized on decompression.
pub fn chunk_uninit(typesize: usize, nbytes: usize, pipeline: &Pipeline, compcode: u8) -> Result<Vec<u8>> {
    special_chunk(BLOSC2_SPECIAL_UNINIT, typesize, nbytes, pipeline, compcode, None)
}

/// Chunk repeating a single element; `value` must be `typesize` bytes.
pub fn chunk_repeatval(
    typesize: usize,
    nbytes: usize,
    pipeline: &Pipeline,
    compcode: u8,
    value: &[u8],
) -> Result<Vec<u8>> {
    if value.len() != typesize {
        return Err(Error::InvalidParam("repeated value must be exactly typesize bytes"));
    }
    special_chunk(BLOSC2_SPECIAL_VALUE, typesize, nbytes, pipeline, compcode, Some(value))
}

// One-shot layer: ephemeral contexts around the ctx entry points.

/// Shuffle selector for the one-shot API.
pub const NOSHUFFLE: u8 = 0;
pub const SHUFFLE: u8 = 1;
pub const BITSHUFFLE: u8 = 2;

/// One-shot compression with the default codec.
pub fn compress(clevel: i32, doshuffle: u8, typesize: usize, src: &[u8], dest: &mut [u8]) -> Result<usize> {
    let pipeline = match doshuffle {
        NOSHUFFLE => Pipeline::empty(),
        SHUFFLE => Pipeline::single(BLOSC_SHUFFLE, 0),
        BITSHUFFLE => Pipeline::single(BLOSC_BITSHUFFLE, 0),
        _ => return Err(Error::InvalidParam("unknown shuffle selector")),
    };
    let params = crate::context::CParams { clevel, typesize, pipeline, ..Default::default() };
    let ctx = CCtx::new(params)?;
    compress_ctx(&ctx, src, dest)
}

/// One-shot decompression.
pub fn decompress(chunk: &[u8], dest: &mut [u8]) -> Result<usize> {
    let mut ctx = DCtx::new(DParams::new())?;
    decompress_ctx(&mut ctx, chunk, dest)
}

/// One-shot random access.
pub fn getitem(chunk: &[u8], start: usize, nitems: usize, dest: &mut [u8]) -> Result<usize> {
    let mut ctx = DCtx::new(DParams::new())?;
    getitem_ctx(&mut ctx, chunk, start, nitems, dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CParams;

    fn sample(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i & 0xff) as u8).collect()
    }

    fn roundtrip_with(params: CParams, src: &[u8]) -> Vec<u8> {
        let ctx = CCtx::new(params).unwrap();
        let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
        let cbytes = compress_ctx(&ctx, src, &mut chunk).unwrap();
        assert!(cbytes <= src.len() + BLOSC2_MAX_OVERHEAD);
        chunk.truncate(cbytes);
        let mut out = vec![0u8; src.len()];
        let n = decompress(&chunk, &mut out).unwrap();
        assert_eq!(n, src.len());
        out
    }

    #[test]
    fn shuffle_zstd_roundtrip() {
        let src = sample(1024);
        let params = CParams {
            compcode: BLOSC_ZSTD,
            clevel: 5,
            typesize: 4,
            pipeline: Pipeline::single(BLOSC_SHUFFLE, 0),
            ..Default::default()
        };
        assert_eq!(roundtrip_with(params, &src), src);
    }

    #[test]
    fn blocksize_for_1k_input_is_1k() {
        let src = sample(1024);
        let params = CParams {
            compcode: BLOSC_ZSTD,
            clevel: 5,
            typesize: 4,
            pipeline: Pipeline::single(BLOSC_SHUFFLE, 0),
            ..Default::default()
        };
        let ctx = CCtx::new(params).unwrap();
        let mut chunk = vec![0u8; 2048];
        let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
        let info = ChunkInfo::parse(&chunk[..cbytes]).unwrap();
        assert_eq!(info.blocksize, 1024);
        assert_eq!(info.nblocks(), 1);
    }

    #[test]
    fn all_codecs_all_filters() {
        let src = sample(100_000);
        for compcode in [BLOSC_LZ4, BLOSC_LZ4HC, BLOSC_SNAPPY, BLOSC_ZLIB, BLOSC_ZSTD] {
            for filter in [BLOSC_NOFILTER, BLOSC_SHUFFLE, BLOSC_BITSHUFFLE, BLOSC_DELTA] {
                let pipeline = if filter == BLOSC_NOFILTER {
                    Pipeline::empty()
                } else if filter == BLOSC_DELTA {
                    // Delta must come first; chain shuffle after it.
                    let mut p = Pipeline::empty();
                    p.filters[0] = BLOSC_DELTA;
                    p.filters[BLOSC2_MAX_FILTERS - 1] = BLOSC_SHUFFLE;
                    p
                } else {
                    Pipeline::single(filter, 0)
                };
                let params =
                    CParams { compcode, clevel: 5, typesize: 4, pipeline, ..Default::default() };
                assert_eq!(roundtrip_with(params, &src), src, "codec {compcode} filter {filter}");
            }
        }
    }

    #[test]
    fn parallel_output_matches_serial() {
        let src = sample(1 << 20);
        for nthreads in [1usize, 4] {
            let params = CParams { typesize: 8, nthreads, ..Default::default() };
            let ctx = CCtx::new(params).unwrap();
            let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
            let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
            chunk.truncate(cbytes);
            let serial_params = CParams { typesize: 8, nthreads: 1, ..Default::default() };
            let serial_ctx = CCtx::new(serial_params).unwrap();
            let mut serial = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
            let scb = compress_ctx(&serial_ctx, &src, &mut serial).unwrap();
            serial.truncate(scb);
            assert_eq!(chunk, serial, "nthreads={nthreads}");
        }
    }

    #[test]
    fn empty_input() {
        let params = CParams { typesize: 1, ..Default::default() };
        let ctx = CCtx::new(params).unwrap();
        let mut chunk = vec![0u8; BLOSC2_MAX_OVERHEAD];
        let cbytes = compress_ctx(&ctx, &[], &mut chunk).unwrap();
        assert_eq!(cbytes, BLOSC_EXTENDED_HEADER_LENGTH);
        let mut out = [0u8; 4];
        assert_eq!(decompress(&chunk[..cbytes], &mut out).unwrap(), 0);
    }

    #[test]
    fn incompressible_data_is_stored_with_bounded_overhead() {
        // A xorshift stream does not compress.
        let mut x = 0x12345678u32;
        let src: Vec<u8> = (0..65536)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                (x & 0xff) as u8
            })
            .collect();
        let ctx = CCtx::new(CParams { typesize: 1, ..Default::default() }).unwrap();
        let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
        let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
        assert!(cbytes <= src.len() + BLOSC2_MAX_OVERHEAD);
        let mut out = vec![0u8; src.len()];
        decompress(&chunk[..cbytes], &mut out).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn getitem_matches_slice() {
        let src = sample(300_000);
        let ctx = CCtx::new(CParams { typesize: 4, ..Default::default() }).unwrap();
        let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
        let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
        chunk.truncate(cbytes);
        for (start, nitems) in [(0usize, 1usize), (17, 100), (74_000, 1000), (74_999, 1)] {
            let mut out = vec![0u8; nitems * 4];
            let n = getitem(&chunk, start, nitems, &mut out).unwrap();
            assert_eq!(n, nitems * 4);
            assert_eq!(out, &src[start * 4..(start + nitems) * 4]);
        }
    }

    #[test]
    fn maskout_skips_blocks() {
        let src = sample(1 << 20);
        let ctx = CCtx::new(CParams { typesize: 4, ..Default::default() }).unwrap();
        let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
        let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
        chunk.truncate(cbytes);

        let info = ChunkInfo::parse(&chunk).unwrap();
        let nblocks = info.nblocks();
        assert!(nblocks >= 2, "need several blocks for this test");
        let mut mask = vec![false; nblocks];
        mask[0] = true;

        let mut out = vec![0xAAu8; src.len()];
        let mut dctx = DCtx::new(DParams::new()).unwrap();
        dctx.set_maskout(mask);
        decompress_ctx(&mut dctx, &chunk, &mut out).unwrap();
        // Masked block untouched, the rest decoded.
        assert!(out[..info.blocksize].iter().all(|&b| b == 0xAA));
        assert_eq!(&out[info.blocksize..], &src[info.blocksize..]);

        // The maskout is consumed: a second call decodes everything.
        let mut out2 = vec![0u8; src.len()];
        decompress_ctx(&mut dctx, &chunk, &mut out2).unwrap();
        assert_eq!(out2, src);
    }

    #[test]
    fn special_chunks_roundtrip() {
        let zeros = chunk_zeros(4, 65536, &Pipeline::default(), BLOSC_LZ4).unwrap();
        assert_eq!(zeros.len(), BLOSC_EXTENDED_HEADER_LENGTH);
        let mut out = vec![0xFFu8; 65536];
        assert_eq!(decompress(&zeros, &mut out).unwrap(), 65536);
        assert!(out.iter().all(|&b| b == 0));

        let value = 0x11223344u32.to_le_bytes();
        let repeated = chunk_repeatval(4, 1024, &Pipeline::default(), BLOSC_LZ4, &value).unwrap();
        let mut out = vec![0u8; 1024];
        decompress(&repeated, &mut out).unwrap();
        for item in out.chunks_exact(4) {
            assert_eq!(item, value);
        }
        // Random access into the pattern.
        let mut item = [0u8; 8];
        getitem(&repeated, 100, 2, &mut item).unwrap();
        assert_eq!(&item[..4], value);

        let nans = chunk_nans(8, 256, &Pipeline::default(), BLOSC_LZ4).unwrap();
        let mut out = vec![0u8; 256];
        decompress(&nans, &mut out).unwrap();
        for item in out.chunks_exact(8) {
            assert!(f64::from_le_bytes(item.try_into().unwrap()).is_nan());
        }
        assert!(chunk_nans(3, 9, &Pipeline::default(), BLOSC_LZ4).is_err());
    }

    #[test]
    fn corrupted_chunks_are_rejected() {
        let src = sample(4096);
        let ctx = CCtx::new(CParams { typesize: 4, ..Default::default() }).unwrap();
        let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
        let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
        chunk.truncate(cbytes);

        let mut out = vec![0u8; src.len()];
        // Unsupported future version.
        let mut bad = chunk.clone();
        bad[0] = 99;
        assert!(decompress(&bad, &mut out).is_err());
        // Truncation below cbytes.
        assert!(decompress(&chunk[..cbytes - 1], &mut out).is_err());
        // Destination too small.
        let mut tiny = vec![0u8; 16];
        assert!(decompress(&chunk, &mut tiny).is_err());
    }

    #[test]
    fn prefilter_synthesizes_postfilter_observes() {
        use std::sync::Arc;
        // The prefilter replaces the source with a ramp; the source buffer
        // itself is all zeros.
        let params = CParams {
            typesize: 1,
            prefilter: Some(Arc::new(|p: &mut PrefilterParams| {
                for (i, b) in p.output.iter_mut().enumerate() {
                    *b = ((p.offset + i) % 251) as u8;
                }
                Ok(())
            })),
            ..Default::default()
        };
        let src = vec![0u8; 10_000];
        let ctx = CCtx::new(params).unwrap();
        let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
        let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
        chunk.truncate(cbytes);

        let mut out = vec![0u8; src.len()];
        decompress(&chunk, &mut out).unwrap();
        for (i, &b) in out.iter().enumerate() {
            assert_eq!(b, (i % 251) as u8);
        }

        // A postfilter that adds one on the way out.
        let mut dctx = DCtx::new(DParams::new()).unwrap();
        dctx.set_postfilter(Some(Arc::new(|p: &mut PostfilterParams| {
            for (o, &i) in p.output.iter_mut().zip(p.input.iter()) {
                *o = i.wrapping_add(1);
            }
            Ok(())
        })));
        let mut shifted = vec![0u8; src.len()];
        decompress_ctx(&mut dctx, &chunk, &mut shifted).unwrap();
        for (i, &b) in shifted.iter().enumerate() {
            assert_eq!(b, ((i % 251) + 1) as u8);
        }
    }

    #[test]
    fn sub_typesize_input_single_block() {
        let src = [1u8, 2, 3];
        let ctx = CCtx::new(CParams { typesize: 8, ..Default::default() }).unwrap();
        let mut chunk = vec![0u8; 64];
        let cbytes = compress_ctx(&ctx, &src, &mut chunk).unwrap();
        let info = ChunkInfo::parse(&chunk[..cbytes]).unwrap();
        assert!(info.memcpyed());
        let mut out = [0u8; 3];
        decompress(&chunk[..cbytes], &mut out).unwrap();
        assert_eq!(out, src);
    }
}
