//! Contiguous frame: the serialized form of a super-chunk.
//!
//! Layout (all integers little-endian):
//! header · metalayers · vlmetalayers (contents compressed) · chunk bodies ·
//! trailer. The trailer is the chunk-offsets table — `nchunks × i64` offsets
//! from frame start — itself compressed as a typesize-8 chunk, followed by
//! `u32 trailer_len` and an echo of the frame magic. Special chunks are
//! sentinel-encoded in the offsets table as `-(kind)`; repeated-value chunks
//! are stored as real (header+value) chunks.

use xxhash_rust::xxh32::Xxh32;

use crate::blosc2::{self, ChunkInfo};
use crate::constants::*;
use crate::context::{CCtx, CParams, DCtx, DParams};
use crate::error::{Error, Result};
use crate::filters::Pipeline;
use crate::schunk::{slot_from_bytes, ChunkSlot, MetaLayer, SChunk, Storage};
use crate::stdio::{self, FrameLock, OpenMode};
use crate::stune::SplitMode;
use crate::util::{st32, st64, sw32, sw64, trace_error};

pub(crate) const FRAME_MAGIC: &[u8; 8] = b"b2frame\0";

// Header field offsets.
const FRAME_VERSION_OFF: usize = 8;
const FRAME_FLAGS_OFF: usize = 9;
const FRAME_TYPESIZE: usize = 10;
const FRAME_CHUNKSIZE: usize = 14;
const FRAME_BLOCKSIZE: usize = 18;
const FRAME_NCHUNKS: usize = 22;
const FRAME_NBYTES: usize = 30;
const FRAME_CBYTES: usize = 38;
const FRAME_LEN: usize = 46;
const FRAME_NTHREADS_C: usize = 54;
const FRAME_NTHREADS_D: usize = 56;
const FRAME_COMPCODE: usize = 58;
const FRAME_COMPCODE_META: usize = 59;
const FRAME_CLEVEL: usize = 60;
const FRAME_SPLITMODE: usize = 61;
const FRAME_FILTERS: usize = 62;
const FRAME_FILTERS_META: usize = 68;
const FRAME_COMMENT_OFFSET: usize = 74;
const FRAME_COMMENT_LEN: usize = 78;
const FRAME_CHECKSUM: usize = 80;
pub(crate) const FRAME_HEADER_LEN: usize = 92;

// Frame flags.
pub(crate) const FRAME_SPARSE: u8 = 0x1;
pub(crate) const FRAME_HAS_VLMETA: u8 = 0x2;
pub(crate) const FRAME_HAS_CHECKSUM: u8 = 0x4;
const FRAME_BIG_ENDIAN_HOST: u8 = 0x8;

pub(crate) const TRAILER_FIXED_LEN: usize = 4 + FRAME_MAGIC.len();

/// Parameters for the trailer's offsets chunk. LZ4 keeps the trailer
/// readable by every build regardless of the payload codec.
fn offsets_cparams() -> CParams {
    CParams {
        compcode: BLOSC_LZ4,
        clevel: 5,
        typesize: 8,
        nthreads: 1,
        pipeline: Pipeline::single(BLOSC_SHUFFLE, 0),
        ..Default::default()
    }
}

pub(crate) fn compress_offsets(offsets: &[i64]) -> Result<Vec<u8>> {
    let raw: Vec<u8> = offsets.iter().flat_map(|o| o.to_le_bytes()).collect();
    let mut chunk = vec![0u8; raw.len() + BLOSC2_MAX_OVERHEAD];
    let ctx = CCtx::new(offsets_cparams())?;
    let cbytes = blosc2::compress_ctx(&ctx, &raw, &mut chunk)?;
    chunk.truncate(cbytes);
    Ok(chunk)
}

pub(crate) fn decompress_offsets(chunk: &[u8]) -> Result<Vec<i64>> {
    let info = ChunkInfo::parse(chunk)?;
    if info.nbytes % 8 != 0 {
        return Err(Error::Corruption("offsets table length is not a multiple of 8"));
    }
    let mut raw = vec![0u8; info.nbytes];
    let mut ctx = DCtx::new(DParams { nthreads: 1, ..Default::default() })?;
    blosc2::decompress_ctx(&mut ctx, chunk, &mut raw)?;
    Ok(raw.chunks_exact(8).map(|c| i64::from_le_bytes(c.try_into().unwrap())).collect())
}

fn write_meta_section(out: &mut Vec<u8>, layers: &[MetaLayer]) {
    out.extend_from_slice(&(layers.len() as i16).to_le_bytes());
    for layer in layers {
        out.push(layer.name.len() as u8);
        out.extend_from_slice(layer.name.as_bytes());
        out.extend_from_slice(&(layer.content.len() as u32).to_le_bytes());
        out.extend_from_slice(&layer.content);
    }
}

/// Compress vlmetalayer contents with the frame's parameters; the fixed
/// metalayers stay uncompressed for in-place updates.
fn write_vlmeta_section(out: &mut Vec<u8>, layers: &[MetaLayer], compcode: u8, clevel: i32) -> Result<()> {
    out.extend_from_slice(&(layers.len() as i16).to_le_bytes());
    let params =
        CParams { compcode, clevel, typesize: 1, nthreads: 1, pipeline: Pipeline::empty(), ..Default::default() };
    let ctx = CCtx::new(params)?;
    for layer in layers {
        out.push(layer.name.len() as u8);
        out.extend_from_slice(layer.name.as_bytes());
        let mut chunk = vec![0u8; layer.content.len() + BLOSC2_MAX_OVERHEAD];
        let cbytes = blosc2::compress_ctx(&ctx, &layer.content, &mut chunk)?;
        chunk.truncate(cbytes);
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(&chunk);
    }
    Ok(())
}

struct SectionReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SectionReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self.buf.get(self.pos..self.pos + n).ok_or(Error::Corruption("truncated frame section"))?;
        self.pos += n;
        Ok(bytes)
    }

    fn read_layers(&mut self, compressed: bool) -> Result<Vec<MetaLayer>> {
        let count = i16::from_le_bytes(self.take(2)?.try_into().unwrap());
        if count < 0 {
            return Err(Error::Corruption("negative metalayer count"));
        }
        let mut layers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_len = self.take(1)?[0] as usize;
            let name = std::str::from_utf8(self.take(name_len)?)
                .map_err(|_| Error::Corruption("metalayer name is not utf-8"))?
                .to_string();
            let content_len = u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as usize;
            let stored = self.take(content_len)?;
            let content = if compressed {
                let info = ChunkInfo::parse(stored)?;
                let mut out = vec![0u8; info.nbytes];
                let mut ctx = DCtx::new(DParams { nthreads: 1, ..Default::default() })?;
                blosc2::decompress_ctx(&mut ctx, stored, &mut out)?;
                out
            } else {
                stored.to_vec()
            };
            if layers.iter().any(|l: &MetaLayer| l.name == name) {
                return Err(Error::Corruption("duplicate metalayer name in frame"));
            }
            layers.push(MetaLayer { name, content });
        }
        Ok(layers)
    }
}

/// Content checksum: xxh32 over the decompressed payload of every chunk, in
/// order.
fn content_checksum(schunk: &SChunk) -> Result<u32> {
    let mut hasher = Xxh32::new(0);
    let mut dctx = DCtx::new(DParams { nthreads: 1, ..Default::default() })?;
    let mut buf = Vec::new();
    for nchunk in 0..schunk.nchunks() {
        let chunk = schunk.get_lazychunk(nchunk)?;
        let info = ChunkInfo::parse(&chunk)?;
        buf.resize(info.nbytes, 0);
        buf.fill(0);
        blosc2::decompress_ctx(&mut dctx, &chunk, &mut buf)?;
        hasher.update(&buf[..info.nbytes]);
    }
    Ok(hasher.digest())
}

pub(crate) fn build_header(schunk: &SChunk, frame_len: usize, sparse: bool, checksum: u32) -> Vec<u8> {
    let cparams = &schunk.storage.cparams;
    let mut header = vec![0u8; FRAME_HEADER_LEN];
    header[..8].copy_from_slice(FRAME_MAGIC);
    header[FRAME_VERSION_OFF] = FRAME_FORMAT_VERSION;
    let mut flags = 0u8;
    if sparse {
        flags |= FRAME_SPARSE;
    }
    if !schunk.vlmeta.is_empty() {
        flags |= FRAME_HAS_VLMETA;
    }
    if schunk.storage.checksum {
        flags |= FRAME_HAS_CHECKSUM;
    }
    if cfg!(target_endian = "big") {
        flags |= FRAME_BIG_ENDIAN_HOST;
    }
    header[FRAME_FLAGS_OFF] = flags;
    st32(&mut header, FRAME_TYPESIZE, schunk.typesize as i32);
    st32(&mut header, FRAME_CHUNKSIZE, schunk.chunksize as i32);
    st32(&mut header, FRAME_BLOCKSIZE, cparams.blocksize as i32);
    st64(&mut header, FRAME_NCHUNKS, schunk.nchunks() as i64);
    st64(&mut header, FRAME_NBYTES, schunk.nbytes);
    st64(&mut header, FRAME_CBYTES, schunk.cbytes);
    st64(&mut header, FRAME_LEN, frame_len as i64);
    header[FRAME_NTHREADS_C..FRAME_NTHREADS_C + 2].copy_from_slice(&(cparams.nthreads as i16).to_le_bytes());
    header[FRAME_NTHREADS_D..FRAME_NTHREADS_D + 2]
        .copy_from_slice(&(schunk.storage.dparams.nthreads as i16).to_le_bytes());
    header[FRAME_COMPCODE] = cparams.compcode;
    header[FRAME_COMPCODE_META] = cparams.compcode_meta;
    header[FRAME_CLEVEL] = cparams.clevel as u8;
    header[FRAME_SPLITMODE] = cparams.splitmode as u8;
    header[FRAME_FILTERS..FRAME_FILTERS + BLOSC2_MAX_FILTERS].copy_from_slice(&cparams.pipeline.filters);
    header[FRAME_FILTERS_META..FRAME_FILTERS_META + BLOSC2_MAX_FILTERS]
        .copy_from_slice(&cparams.pipeline.filters_meta);
    st32(&mut header, FRAME_COMMENT_OFFSET, 0);
    header[FRAME_COMMENT_LEN..FRAME_COMMENT_LEN + 2].copy_from_slice(&0u16.to_le_bytes());
    header[FRAME_CHECKSUM..FRAME_CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());
    header
}

pub(crate) struct FrameHeader {
    pub flags: u8,
    pub typesize: usize,
    pub chunksize: i64,
    pub nchunks: i64,
    pub nbytes: i64,
    pub cbytes: i64,
    pub frame_len: i64,
    pub checksum: u32,
    pub cparams: CParams,
    pub dparams: DParams,
}

pub(crate) fn parse_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(Error::Corruption("frame shorter than its header"));
    }
    if &buf[..8] != FRAME_MAGIC {
        return Err(Error::Corruption("bad frame magic"));
    }
    let version = buf[FRAME_VERSION_OFF];
    if version > FRAME_FORMAT_VERSION {
        return Err(Error::FrameVersion(version));
    }
    let typesize = sw32(buf, FRAME_TYPESIZE)?;
    if typesize <= 0 || typesize > BLOSC_MAX_TYPESIZE as i32 {
        return Err(Error::Corruption("impossible typesize in frame header"));
    }
    let mut pipeline = Pipeline::empty();
    pipeline.filters.copy_from_slice(&buf[FRAME_FILTERS..FRAME_FILTERS + BLOSC2_MAX_FILTERS]);
    pipeline.filters_meta.copy_from_slice(&buf[FRAME_FILTERS_META..FRAME_FILTERS_META + BLOSC2_MAX_FILTERS]);
    let nthreads_c = i16::from_le_bytes(buf[FRAME_NTHREADS_C..FRAME_NTHREADS_C + 2].try_into().unwrap()).max(1);
    let nthreads_d = i16::from_le_bytes(buf[FRAME_NTHREADS_D..FRAME_NTHREADS_D + 2].try_into().unwrap()).max(1);
    let cparams = CParams {
        compcode: buf[FRAME_COMPCODE],
        compcode_meta: buf[FRAME_COMPCODE_META],
        clevel: buf[FRAME_CLEVEL] as i32,
        typesize: typesize as usize,
        nthreads: nthreads_c as usize,
        blocksize: sw32(buf, FRAME_BLOCKSIZE)?.max(0) as usize,
        splitmode: SplitMode::from_u8(buf[FRAME_SPLITMODE]),
        pipeline,
        ..Default::default()
    };
    let dparams = DParams { nthreads: nthreads_d as usize, ..Default::default() };
    Ok(FrameHeader {
        flags: buf[FRAME_FLAGS_OFF],
        typesize: typesize as usize,
        chunksize: sw32(buf, FRAME_CHUNKSIZE)? as i64,
        nchunks: sw64(buf, FRAME_NCHUNKS)?,
        nbytes: sw64(buf, FRAME_NBYTES)?,
        cbytes: sw64(buf, FRAME_CBYTES)?,
        frame_len: sw64(buf, FRAME_LEN)?,
        checksum: u32::from_le_bytes(buf[FRAME_CHECKSUM..FRAME_CHECKSUM + 4].try_into().unwrap()),
        cparams,
        dparams,
    })
}

/// Serialize the metadata image (header + metalayers + vlmetalayers) shared
/// by contiguous and sparse frames. The header is patched in afterwards once
/// the full length is known.
pub(crate) fn meta_image(schunk: &SChunk) -> Result<Vec<u8>> {
    let mut out = vec![0u8; FRAME_HEADER_LEN];
    write_meta_section(&mut out, &schunk.meta);
    write_vlmeta_section(&mut out, &schunk.vlmeta, schunk.storage.cparams.compcode, schunk.storage.cparams.clevel)?;
    Ok(out)
}

/// Offsets table entries for the current chunks, given the position where
/// each stored chunk's bytes will land. `body_base` is the bodies section
/// start; sentinel specials consume no body bytes.
pub(crate) fn build_offsets(schunk: &SChunk, body_base: usize) -> Result<(Vec<i64>, Vec<usize>)> {
    let mut offsets = Vec::with_capacity(schunk.nchunks());
    let mut stored = Vec::new();
    let mut cursor = body_base;
    for (i, slot) in schunk.chunks.iter().enumerate() {
        match slot {
            ChunkSlot::Special { kind, repeat: None, .. } => {
                offsets.push(-(*kind as i64));
            }
            _ => {
                offsets.push(cursor as i64);
                let cbytes = slot.cbytes();
                stored.push(i);
                cursor += cbytes;
            }
        }
    }
    Ok((offsets, stored))
}

/// Serialize a super-chunk into one contiguous buffer.
pub(crate) fn to_cframe(schunk: &SChunk) -> Result<Vec<u8>> {
    let mut out = meta_image(schunk)?;
    let body_base = out.len();
    let (offsets, stored) = build_offsets(schunk, body_base)?;
    for &i in &stored {
        let chunk = schunk.get_lazychunk(i)?;
        out.extend_from_slice(&chunk);
    }
    let offsets_chunk = compress_offsets(&offsets)?;
    let trailer_len = offsets_chunk.len() + TRAILER_FIXED_LEN;
    out.extend_from_slice(&offsets_chunk);
    out.extend_from_slice(&(trailer_len as u32).to_le_bytes());
    out.extend_from_slice(FRAME_MAGIC);

    let checksum = if schunk.storage.checksum { content_checksum(schunk)? } else { 0 };
    let header = build_header(schunk, out.len(), false, checksum);
    out[..FRAME_HEADER_LEN].copy_from_slice(&header);
    Ok(out)
}

/// Split a contiguous frame buffer into `(header, offsets)`.
fn parse_cframe(buf: &[u8]) -> Result<(FrameHeader, Vec<i64>)> {
    let header = parse_header(buf)?;
    if header.frame_len as usize != buf.len() {
        return Err(Error::Corruption("frame length field does not match the buffer"));
    }
    if buf.len() < FRAME_HEADER_LEN + TRAILER_FIXED_LEN {
        return Err(Error::Corruption("frame too short for a trailer"));
    }
    if &buf[buf.len() - 8..] != FRAME_MAGIC {
        return Err(Error::Corruption("bad trailer magic"));
    }
    let trailer_len = u32::from_le_bytes(buf[buf.len() - 12..buf.len() - 8].try_into().unwrap()) as usize;
    if trailer_len < TRAILER_FIXED_LEN || trailer_len > buf.len() - FRAME_HEADER_LEN {
        return Err(Error::Corruption("impossible trailer length"));
    }
    let offsets_chunk = &buf[buf.len() - trailer_len..buf.len() - TRAILER_FIXED_LEN];
    let offsets = decompress_offsets(offsets_chunk)?;
    if offsets.len() as i64 != header.nchunks {
        return Err(Error::Corruption("offsets table disagrees with nchunks"));
    }
    Ok((header, offsets))
}

pub(crate) fn storage_from_header(header: &FrameHeader) -> Storage {
    Storage {
        contiguous: true,
        urlpath: None,
        cparams: header.cparams.clone(),
        dparams: header.dparams.clone(),
        checksum: header.flags & FRAME_HAS_CHECKSUM != 0,
    }
}

/// Logical length of sentinel special chunk `i`, inferred from the uniform
/// chunksize (every chunk but the last is full).
pub(crate) fn sentinel_nbytes(header: &FrameHeader, i: usize) -> Result<usize> {
    if header.chunksize <= 0 {
        return Err(Error::Corruption("special chunk in a frame without chunksize"));
    }
    let full = header.chunksize;
    let remaining = header.nbytes - i as i64 * full;
    if remaining <= 0 {
        return Err(Error::Corruption("special chunk beyond the frame's nbytes"));
    }
    Ok(remaining.min(full) as usize)
}

fn slots_from_offsets<F>(header: &FrameHeader, offsets: &[i64], mut read_info: F) -> Result<Vec<ChunkSlot>>
where
    F: FnMut(u64) -> Result<(ChunkInfo, Option<Vec<u8>>)>,
{
    let mut slots = Vec::with_capacity(offsets.len());
    for (i, &offset) in offsets.iter().enumerate() {
        if offset > 0 {
            let (info, value) = read_info(offset as u64)?;
            if info.typesize != header.typesize {
                return Err(Error::Corruption("chunk typesize disagrees with the frame"));
            }
            let slot = match info.special() {
                BLOSC2_NO_SPECIAL => ChunkSlot::OnDisk { offset: offset as u64, cbytes: info.cbytes },
                BLOSC2_SPECIAL_VALUE => ChunkSlot::Special {
                    kind: BLOSC2_SPECIAL_VALUE,
                    nbytes: info.nbytes,
                    repeat: Some(value.ok_or(Error::Corruption("value chunk is missing its payload"))?),
                },
                kind => ChunkSlot::Special { kind, nbytes: info.nbytes, repeat: None },
            };
            slots.push(slot);
        } else {
            let kind = (-offset) as u8;
            if kind == 0 || kind > BLOSC2_SPECIAL_LASTID || kind == BLOSC2_SPECIAL_VALUE {
                return Err(Error::Corruption("bad special sentinel in offsets table"));
            }
            slots.push(ChunkSlot::Special { kind, nbytes: sentinel_nbytes(header, i)?, repeat: None });
        }
    }
    Ok(slots)
}

pub(crate) fn assemble_schunk(
    header: FrameHeader,
    meta: Vec<MetaLayer>,
    vlmeta: Vec<MetaLayer>,
    chunks: Vec<ChunkSlot>,
    storage: Storage,
    frame_buf: Option<Vec<u8>>,
) -> Result<SChunk> {
    let cctx = CCtx::new(storage.cparams.clone())?;
    let dctx = DCtx::new(storage.dparams.clone())?;
    let schunk = SChunk {
        typesize: header.typesize,
        chunksize: header.chunksize,
        nbytes: header.nbytes,
        cbytes: header.cbytes,
        chunks,
        meta,
        vlmeta,
        frame_buf,
        cctx,
        dctx,
        storage,
    };
    Ok(schunk)
}

pub(crate) fn read_sections(buf: &[u8], has_vlmeta: bool) -> Result<(Vec<MetaLayer>, Vec<MetaLayer>, usize)> {
    let mut reader = SectionReader { buf, pos: FRAME_HEADER_LEN };
    let meta = reader.read_layers(false)?;
    let vlmeta = reader.read_layers(true)?;
    if !has_vlmeta && !vlmeta.is_empty() {
        return Err(Error::Corruption("frame flags deny the vlmeta section present"));
    }
    Ok((meta, vlmeta, reader.pos))
}

fn from_cframe_common(buf: &[u8]) -> Result<(FrameHeader, Vec<MetaLayer>, Vec<MetaLayer>, Vec<ChunkSlot>)> {
    let (header, offsets) = parse_cframe(buf)?;
    let (meta, vlmeta, _) = read_sections(buf, header.flags & FRAME_HAS_VLMETA != 0)?;
    let slots = slots_from_offsets(&header, &offsets, |offset| {
        let start = offset as usize;
        let head = buf.get(start..).ok_or(Error::Corruption("chunk offset outside frame"))?;
        let info = ChunkInfo::parse(head)?;
        if start + info.cbytes > buf.len() {
            return Err(Error::Corruption("chunk overruns frame"));
        }
        let value = (info.special() == BLOSC2_SPECIAL_VALUE).then(|| {
            buf[start + BLOSC_EXTENDED_HEADER_LENGTH..start + BLOSC_EXTENDED_HEADER_LENGTH + info.typesize].to_vec()
        });
        Ok((info, value))
    })?;
    Ok((header, meta, vlmeta, slots))
}

fn verify_checksum(schunk: &SChunk, expected: u32) -> Result<()> {
    let got = content_checksum(schunk)?;
    if got != expected {
        trace_error!("frame checksum mismatch: got {got:#010x}, expected {expected:#010x}");
        return Err(Error::Corruption("frame content checksum mismatch"));
    }
    Ok(())
}

pub(crate) fn content_checksum_of(schunk: &SChunk) -> Result<u32> {
    content_checksum(schunk)
}

pub(crate) fn verify_checksum_of(schunk: &SChunk, expected: u32) -> Result<()> {
    verify_checksum(schunk, expected)
}

/// Deserialize a frame, copying every chunk into owned storage.
pub(crate) fn from_cframe_copy(buf: &[u8]) -> Result<SChunk> {
    let (header, meta, vlmeta, slots) = from_cframe_common(buf)?;
    // Materialize the lazy slots out of the transient buffer.
    let chunks = slots
        .into_iter()
        .map(|slot| match slot {
            ChunkSlot::OnDisk { offset, cbytes } => {
                let start = offset as usize;
                let (slot, _) = slot_from_bytes(buf[start..start + cbytes].to_vec())?;
                Ok(slot)
            }
            other => Ok(other),
        })
        .collect::<Result<Vec<_>>>()?;
    let has_checksum = header.flags & FRAME_HAS_CHECKSUM != 0;
    let expected = header.checksum;
    let storage = storage_from_header(&header);
    let schunk = assemble_schunk(header, meta, vlmeta, chunks, storage, None)?;
    if has_checksum {
        verify_checksum(&schunk, expected)?;
    }
    Ok(schunk)
}

/// Deserialize a frame, keeping `buf` as the backing image; chunk slots alias
/// into it.
pub(crate) fn from_cframe_owned(buf: Vec<u8>) -> Result<SChunk> {
    let (header, meta, vlmeta, slots) = from_cframe_common(&buf)?;
    let chunks = slots
        .into_iter()
        .map(|slot| match slot {
            ChunkSlot::OnDisk { offset, cbytes } => ChunkSlot::InFrame { offset: offset as usize, cbytes },
            other => other,
        })
        .collect();
    let has_checksum = header.flags & FRAME_HAS_CHECKSUM != 0;
    let expected = header.checksum;
    let storage = storage_from_header(&header);
    let schunk = assemble_schunk(header, meta, vlmeta, chunks, storage, Some(buf))?;
    if has_checksum {
        verify_checksum(&schunk, expected)?;
    }
    Ok(schunk)
}

/// Write the whole frame to a file.
pub(crate) fn save_file(schunk: &SChunk, urlpath: &str) -> Result<()> {
    let _lock = FrameLock::acquire(urlpath)?;
    let frame = to_cframe(schunk)?;
    let (backend, path) = stdio::resolve(urlpath)?;
    let mut handle = backend.open(&path, OpenMode::Write)?;
    handle.write_at(0, &frame)?;
    handle.truncate(frame.len() as u64)?;
    Ok(())
}

/// Open a contiguous frame file; chunks stay on disk until asked for.
pub(crate) fn open_file(urlpath: &str) -> Result<SChunk> {
    let (backend, path) = stdio::resolve(urlpath)?;
    let mut handle = backend.open(&path, OpenMode::Read)?;
    let file_len = handle.size()?;
    if (file_len as usize) < FRAME_HEADER_LEN + TRAILER_FIXED_LEN {
        return Err(Error::Corruption("frame file too short"));
    }
    let head = handle.read_at(0, FRAME_HEADER_LEN)?;
    let header = parse_header(&head)?;
    if header.frame_len != file_len as i64 {
        return Err(Error::Corruption("frame length field does not match the file"));
    }

    let tail = handle.read_at(file_len - TRAILER_FIXED_LEN as u64, TRAILER_FIXED_LEN)?;
    if &tail[4..] != FRAME_MAGIC {
        return Err(Error::Corruption("bad trailer magic"));
    }
    let trailer_len = u32::from_le_bytes(tail[..4].try_into().unwrap()) as usize;
    if trailer_len < TRAILER_FIXED_LEN || trailer_len as u64 > file_len {
        return Err(Error::Corruption("impossible trailer length"));
    }
    let offsets_chunk =
        handle.read_at(file_len - trailer_len as u64, trailer_len - TRAILER_FIXED_LEN)?;
    let offsets = decompress_offsets(&offsets_chunk)?;
    if offsets.len() as i64 != header.nchunks {
        return Err(Error::Corruption("offsets table disagrees with nchunks"));
    }

    // Sections sit between the header and the first stored chunk (or the
    // trailer when every chunk is a sentinel).
    let sections_end = offsets
        .iter()
        .filter(|&&o| o > 0)
        .map(|&o| o as u64)
        .min()
        .unwrap_or(file_len - trailer_len as u64);
    let sections =
        handle.read_at(0, sections_end as usize)?;
    let (meta, vlmeta, _) = read_sections(&sections, header.flags & FRAME_HAS_VLMETA != 0)?;

    let slots = slots_from_offsets(&header, &offsets, |offset| {
        let head = handle.read_at(offset, BLOSC_EXTENDED_HEADER_LENGTH)?;
        let info = ChunkInfo::parse(&head)?;
        let value = if info.special() == BLOSC2_SPECIAL_VALUE {
            Some(handle.read_at(offset + BLOSC_EXTENDED_HEADER_LENGTH as u64, info.typesize)?)
        } else {
            None
        };
        Ok((info, value))
    })?;

    let mut storage = storage_from_header(&header);
    storage.urlpath = Some(urlpath.to_string());
    storage.contiguous = true;
    let has_checksum = header.flags & FRAME_HAS_CHECKSUM != 0;
    let expected = header.checksum;
    let schunk = assemble_schunk(header, meta, vlmeta, slots, storage, None)?;
    if has_checksum {
        verify_checksum(&schunk, expected)?;
    }
    Ok(schunk)
}

/// Incremental append of the last chunk to an existing frame file: the new
/// chunk bytes are written over the old trailer, then a fresh trailer and
/// header go in. With checksums enabled the whole frame is rewritten instead.
pub(crate) fn append_last_chunk_file(schunk: &mut SChunk, urlpath: &str) -> Result<()> {
    if schunk.storage.checksum {
        return save_file(schunk, urlpath);
    }
    let _lock = FrameLock::acquire(urlpath)?;
    let (backend, path) = stdio::resolve(urlpath)?;
    let mut handle = backend.open(&path, OpenMode::ReadWrite)?;
    let file_len = handle.size()?;
    let head = handle.read_at(0, FRAME_HEADER_LEN)?;
    let old = parse_header(&head)?;
    if old.frame_len != file_len as i64 {
        return Err(Error::Corruption("frame length field does not match the file"));
    }
    let tail = handle.read_at(file_len - TRAILER_FIXED_LEN as u64, TRAILER_FIXED_LEN)?;
    let old_trailer_len = u32::from_le_bytes(tail[..4].try_into().unwrap()) as u64;
    if old_trailer_len < TRAILER_FIXED_LEN as u64 || old_trailer_len > file_len {
        return Err(Error::Corruption("impossible trailer length"));
    }
    let old_offsets_chunk =
        handle.read_at(file_len - old_trailer_len, old_trailer_len as usize - TRAILER_FIXED_LEN)?;
    let mut offsets = decompress_offsets(&old_offsets_chunk)?;
    if offsets.len() + 1 != schunk.nchunks() {
        // Out of sync with the file: rewrite from scratch.
        return save_file(schunk, urlpath);
    }

    let insert_at = file_len - old_trailer_len;
    let nchunk = schunk.nchunks() - 1;
    let mut cursor = insert_at;
    let appended = match &schunk.chunks[nchunk] {
        ChunkSlot::Special { repeat: None, kind, .. } => {
            offsets.push(-(*kind as i64));
            None
        }
        slot => {
            let was_owned = matches!(slot, ChunkSlot::Owned(_));
            let bytes =
                crate::schunk::slot_bytes(slot, &schunk.frame_buf, &schunk.storage, schunk.typesize)?.into_owned();
            Some((bytes, was_owned))
        }
    };
    if let Some((bytes, was_owned)) = appended {
        handle.write_at(cursor, &bytes)?;
        offsets.push(cursor as i64);
        cursor += bytes.len() as u64;
        // The bytes now live in the file; drop the in-memory copy.
        if was_owned {
            schunk.chunks[nchunk] = ChunkSlot::OnDisk { offset: insert_at, cbytes: bytes.len() };
        }
    }

    let offsets_chunk = compress_offsets(&offsets)?;
    let trailer_len = offsets_chunk.len() + TRAILER_FIXED_LEN;
    handle.write_at(cursor, &offsets_chunk)?;
    handle.write_at(cursor + offsets_chunk.len() as u64, &(trailer_len as u32).to_le_bytes())?;
    handle.write_at(cursor + offsets_chunk.len() as u64 + 4, FRAME_MAGIC)?;
    let new_len = cursor + trailer_len as u64;
    handle.truncate(new_len)?;

    let header = build_header(schunk, new_len as usize, false, 0);
    handle.write_at(0, &header)?;
    Ok(())
}
