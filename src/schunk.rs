//! Super-chunk: an ordered sequence of chunks sharing one typesize and one
//! set of default parameters, with fixed and variable-length metadata layers.
//!
//! Chunks are owned by the super-chunk. A slot either holds the bytes, points
//! into a deserialized frame image, points at persisted storage, or records a
//! special (pattern) chunk by its kind and logical length. All mutations keep
//! the `nbytes`/`cbytes` counters and any backing storage in sync.

use std::borrow::Cow;

use crate::blosc2::{self, ChunkInfo};
use crate::constants::*;
use crate::context::{CCtx, CParams, DCtx, DParams};
use crate::error::{Error, Result};
use crate::frame;
use crate::sframe;
use crate::stdio::{self, OpenMode};
use crate::util::trace_warn;

/// Storage properties for a super-chunk.
#[derive(Clone)]
pub struct Storage {
    /// Contiguous frame (single file) vs sparse directory, for url-backed
    /// super-chunks.
    pub contiguous: bool,
    pub urlpath: Option<String>,
    pub cparams: CParams,
    pub dparams: DParams,
    /// Write a content checksum into frames.
    pub checksum: bool,
}

impl Default for Storage {
    fn default() -> Self {
        Storage {
            contiguous: false,
            urlpath: None,
            cparams: CParams::default(),
            dparams: DParams::new(),
            checksum: false,
        }
    }
}

/// Pattern kinds for special chunks.
#[derive(Clone, Debug, PartialEq)]
pub enum SpecialValue {
    Zero,
    Nan,
    Uninit,
    /// One repeated element, exactly `typesize` bytes.
    Value(Vec<u8>),
}

impl SpecialValue {
    pub(crate) fn kind(&self) -> u8 {
        match self {
            SpecialValue::Zero => BLOSC2_SPECIAL_ZERO,
            SpecialValue::Nan => BLOSC2_SPECIAL_NAN,
            SpecialValue::Uninit => BLOSC2_SPECIAL_UNINIT,
            SpecialValue::Value(_) => BLOSC2_SPECIAL_VALUE,
        }
    }
}

/// One chunk position inside a super-chunk.
#[derive(Clone, Debug)]
pub(crate) enum ChunkSlot {
    /// The chunk bytes, owned.
    Owned(Vec<u8>),
    /// Slice of the in-memory frame image this super-chunk was opened from.
    InFrame { offset: usize, cbytes: usize },
    /// Range of the url-backed contiguous frame.
    OnDisk { offset: u64, cbytes: usize },
    /// Numbered chunk file of a sparse directory.
    SparseFile { index: u64, cbytes: usize },
    /// Header-only special chunk.
    Special { kind: u8, nbytes: usize, repeat: Option<Vec<u8>> },
}

/// A named metadata layer.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaLayer {
    pub name: String,
    pub content: Vec<u8>,
}

pub struct SChunk {
    pub(crate) storage: Storage,
    pub(crate) typesize: usize,
    /// Bytes per (full) chunk; -1 until the first append fixes it.
    pub(crate) chunksize: i64,
    pub(crate) nbytes: i64,
    pub(crate) cbytes: i64,
    pub(crate) chunks: Vec<ChunkSlot>,
    pub(crate) meta: Vec<MetaLayer>,
    pub(crate) vlmeta: Vec<MetaLayer>,
    /// Frame image backing `InFrame` slots.
    pub(crate) frame_buf: Option<Vec<u8>>,
    pub(crate) cctx: CCtx,
    pub(crate) dctx: DCtx,
}

/// Materialize the bytes of one slot. Borrows straight from the frame image
/// where possible; lazy and special slots cost an owned buffer.
pub(crate) fn slot_bytes<'a>(
    slot: &'a ChunkSlot,
    frame_buf: &'a Option<Vec<u8>>,
    storage: &Storage,
    typesize: usize,
) -> Result<Cow<'a, [u8]>> {
    match slot {
        ChunkSlot::Owned(bytes) => Ok(Cow::Borrowed(bytes.as_slice())),
        ChunkSlot::InFrame { offset, cbytes } => {
            let buf = frame_buf.as_ref().ok_or(Error::Corruption("frame image is gone"))?;
            buf.get(*offset..offset + cbytes)
                .map(Cow::Borrowed)
                .ok_or(Error::Corruption("chunk range outside frame image"))
        }
        ChunkSlot::OnDisk { offset, cbytes } => {
            let urlpath = storage.urlpath.as_deref().ok_or(Error::Corruption("lazy chunk without storage"))?;
            let (backend, path) = stdio::resolve(urlpath)?;
            let mut handle = backend.open(&path, OpenMode::Read)?;
            Ok(Cow::Owned(handle.read_at(*offset, *cbytes)?))
        }
        ChunkSlot::SparseFile { index, cbytes } => {
            let urlpath = storage.urlpath.as_deref().ok_or(Error::Corruption("lazy chunk without storage"))?;
            let bytes = sframe::read_chunk_file(urlpath, *index)?;
            if bytes.len() != *cbytes {
                return Err(Error::Corruption("sparse chunk file has the wrong length"));
            }
            Ok(Cow::Owned(bytes))
        }
        ChunkSlot::Special { kind, nbytes, repeat } => {
            let pipeline = &storage.cparams.pipeline;
            let compcode = storage.cparams.compcode;
            let chunk = match *kind {
                BLOSC2_SPECIAL_ZERO => blosc2::chunk_zeros(typesize, *nbytes, pipeline, compcode)?,
                BLOSC2_SPECIAL_NAN => blosc2::chunk_nans(typesize, *nbytes, pipeline, compcode)?,
                BLOSC2_SPECIAL_UNINIT => blosc2::chunk_uninit(typesize, *nbytes, pipeline, compcode)?,
                BLOSC2_SPECIAL_VALUE => {
                    let value = repeat.as_deref().ok_or(Error::Corruption("value chunk lost its payload"))?;
                    blosc2::chunk_repeatval(typesize, *nbytes, pipeline, compcode, value)?
                }
                _ => return Err(Error::Corruption("unknown special chunk kind")),
            };
            Ok(Cow::Owned(chunk))
        }
    }
}

impl ChunkSlot {
    /// Logical (uncompressed) length of this slot.
    pub(crate) fn nbytes(&self, frame_buf: &Option<Vec<u8>>, storage: &Storage, typesize: usize) -> Result<usize> {
        match self {
            ChunkSlot::Special { nbytes, .. } => Ok(*nbytes),
            _ => {
                let bytes = slot_bytes(self, frame_buf, storage, typesize)?;
                Ok(ChunkInfo::parse(&bytes)?.nbytes)
            }
        }
    }

    /// Stored (compressed) length of this slot.
    pub(crate) fn cbytes(&self) -> usize {
        match self {
            ChunkSlot::Owned(bytes) => bytes.len(),
            ChunkSlot::InFrame { cbytes, .. }
            | ChunkSlot::OnDisk { cbytes, .. }
            | ChunkSlot::SparseFile { cbytes, .. } => *cbytes,
            ChunkSlot::Special { repeat, .. } => {
                BLOSC_EXTENDED_HEADER_LENGTH + repeat.as_ref().map_or(0, Vec::len)
            }
        }
    }
}

/// Classify an already-compressed chunk into a slot, so special chunks stay
/// header-only in memory and sentinel-encoded in frames.
pub(crate) fn slot_from_bytes(chunk: Vec<u8>) -> Result<(ChunkSlot, ChunkInfo)> {
    let info = ChunkInfo::parse(&chunk)?;
    if chunk.len() < info.cbytes {
        return Err(Error::Corruption("chunk is truncated"));
    }
    let slot = match info.special() {
        BLOSC2_NO_SPECIAL => ChunkSlot::Owned(chunk),
        BLOSC2_SPECIAL_VALUE => {
            let value = chunk[BLOSC_EXTENDED_HEADER_LENGTH..BLOSC_EXTENDED_HEADER_LENGTH + info.typesize].to_vec();
            ChunkSlot::Special { kind: BLOSC2_SPECIAL_VALUE, nbytes: info.nbytes, repeat: Some(value) }
        }
        kind => ChunkSlot::Special { kind, nbytes: info.nbytes, repeat: None },
    };
    Ok((slot, info))
}

impl SChunk {
    /// Create an empty super-chunk. With a urlpath in `storage`, an empty
    /// frame (file or directory) is written immediately.
    pub fn new(storage: Storage) -> Result<SChunk> {
        storage.cparams.validate()?;
        let cctx = CCtx::new(storage.cparams.clone())?;
        let dctx = DCtx::new(storage.dparams.clone())?;
        let typesize = storage.cparams.typesize;
        let mut schunk = SChunk {
            storage,
            typesize,
            chunksize: -1,
            nbytes: 0,
            cbytes: 0,
            chunks: Vec::new(),
            meta: Vec::new(),
            vlmeta: Vec::new(),
            frame_buf: None,
            cctx,
            dctx,
        };
        if schunk.storage.urlpath.is_some() {
            schunk.persist_all()?;
        }
        Ok(schunk)
    }

    pub fn typesize(&self) -> usize {
        self.typesize
    }

    pub fn nchunks(&self) -> usize {
        self.chunks.len()
    }

    /// Total logical bytes across chunks (special chunks by their pattern
    /// length).
    pub fn nbytes(&self) -> i64 {
        self.nbytes
    }

    /// Total stored bytes across chunks.
    pub fn cbytes(&self) -> i64 {
        self.cbytes
    }

    /// Bytes of one full chunk, -1 before the first append.
    pub fn chunksize(&self) -> i64 {
        self.chunksize
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn cctx_mut(&mut self) -> &mut CCtx {
        &mut self.cctx
    }

    pub fn dctx_mut(&mut self) -> &mut DCtx {
        &mut self.dctx
    }

    fn items_per_chunk(&self) -> Result<usize> {
        if self.chunksize <= 0 {
            return Err(Error::InvalidParam("super-chunk has no chunksize yet"));
        }
        Ok(self.chunksize as usize / self.typesize)
    }

    // Chunk operations.

    /// Compress one chunk's worth of data and append it.
    pub fn append_buffer(&mut self, src: &[u8]) -> Result<usize> {
        if self.chunksize == -1 {
            self.chunksize = src.len() as i64;
        } else if src.len() as i64 > self.chunksize {
            return Err(Error::InvalidParam("buffer larger than the super-chunk chunksize"));
        } else if (src.len() as i64) < self.chunksize {
            trace_warn!("appending a short chunk; further appends will misalign item access");
        }
        let mut chunk = vec![0u8; src.len() + BLOSC2_MAX_OVERHEAD];
        self.cctx.set_nchunk(self.chunks.len() as i64);
        let cbytes = blosc2::compress_ctx(&self.cctx, src, &mut chunk)?;
        chunk.truncate(cbytes);
        self.append_chunk(chunk)
    }

    /// Append an already-compressed chunk, taking ownership.
    pub fn append_chunk(&mut self, chunk: Vec<u8>) -> Result<usize> {
        let (slot, info) = self.admit_chunk(chunk)?;
        self.nbytes += info.nbytes as i64;
        self.cbytes += slot.cbytes() as i64;
        self.chunks.push(slot);
        self.persist_append()?;
        Ok(self.chunks.len())
    }

    /// Append a compressed chunk by copy.
    pub fn append_chunk_copy(&mut self, chunk: &[u8]) -> Result<usize> {
        self.append_chunk(chunk.to_vec())
    }

    /// Replace chunk `nchunk`, taking ownership of the new one.
    pub fn update_chunk(&mut self, nchunk: usize, chunk: Vec<u8>) -> Result<usize> {
        if nchunk >= self.chunks.len() {
            return Err(Error::InvalidIndex);
        }
        let (slot, info) = self.admit_chunk(chunk)?;
        let old_nbytes = self.chunks[nchunk].nbytes(&self.frame_buf, &self.storage, self.typesize)?;
        let old_cbytes = self.chunks[nchunk].cbytes();
        self.nbytes += info.nbytes as i64 - old_nbytes as i64;
        self.cbytes += slot.cbytes() as i64 - old_cbytes as i64;
        self.chunks[nchunk] = slot;
        self.persist_all()?;
        Ok(self.chunks.len())
    }

    /// Insert a chunk before position `nchunk`, shifting the rest.
    pub fn insert_chunk(&mut self, nchunk: usize, chunk: Vec<u8>) -> Result<usize> {
        if nchunk > self.chunks.len() {
            return Err(Error::InvalidIndex);
        }
        let (slot, info) = self.admit_chunk(chunk)?;
        self.nbytes += info.nbytes as i64;
        self.cbytes += slot.cbytes() as i64;
        self.chunks.insert(nchunk, slot);
        self.persist_all()?;
        Ok(self.chunks.len())
    }

    /// Remove chunk `nchunk`.
    pub fn delete_chunk(&mut self, nchunk: usize) -> Result<usize> {
        if nchunk >= self.chunks.len() {
            return Err(Error::InvalidIndex);
        }
        let old_nbytes = self.chunks[nchunk].nbytes(&self.frame_buf, &self.storage, self.typesize)?;
        let old_cbytes = self.chunks[nchunk].cbytes();
        self.chunks.remove(nchunk);
        self.nbytes -= old_nbytes as i64;
        self.cbytes -= old_cbytes as i64;
        self.persist_all()?;
        Ok(self.chunks.len())
    }

    /// Validate an incoming chunk against this super-chunk's parameters.
    fn admit_chunk(&mut self, chunk: Vec<u8>) -> Result<(ChunkSlot, ChunkInfo)> {
        let (slot, info) = slot_from_bytes(chunk)?;
        if info.typesize != self.typesize {
            return Err(Error::InvalidParam("chunk typesize does not match the super-chunk"));
        }
        if self.chunksize == -1 {
            self.chunksize = info.nbytes as i64;
        } else if info.nbytes as i64 > self.chunksize {
            return Err(Error::InvalidParam("chunk larger than the super-chunk chunksize"));
        }
        Ok((slot, info))
    }

    /// Append `nitems` elements of a pattern as special chunks of
    /// `chunksize` bytes each. Returns the new chunk count.
    pub fn fill_special(&mut self, nitems: i64, special: SpecialValue, chunksize: i64) -> Result<usize> {
        if nitems < 0 {
            return Err(Error::InvalidParam("negative item count"));
        }
        if let SpecialValue::Value(v) = &special {
            if v.len() != self.typesize {
                return Err(Error::InvalidParam("repeated value must be exactly typesize bytes"));
            }
        }
        if chunksize <= 0 || chunksize % self.typesize as i64 != 0 {
            return Err(Error::InvalidParam("special chunksize must be a positive multiple of typesize"));
        }
        if self.chunksize == -1 {
            self.chunksize = chunksize;
        } else if chunksize != self.chunksize {
            return Err(Error::InvalidParam("special chunksize does not match the super-chunk"));
        }

        let items_per_chunk = (chunksize as usize) / self.typesize;
        let mut left = nitems as usize;
        let kind = special.kind();
        let repeat = match special {
            SpecialValue::Value(v) => Some(v),
            _ => None,
        };
        while left > 0 {
            let items = left.min(items_per_chunk);
            let nbytes = items * self.typesize;
            if kind == BLOSC2_SPECIAL_NAN && self.typesize != 4 && self.typesize != 8 {
                return Err(Error::Data("NaN special chunk needs typesize 4 or 8"));
            }
            let slot = ChunkSlot::Special { kind, nbytes, repeat: repeat.clone() };
            self.nbytes += nbytes as i64;
            self.cbytes += slot.cbytes() as i64;
            self.chunks.push(slot);
            self.persist_append()?;
            left -= items;
        }
        Ok(self.chunks.len())
    }

    /// The chunk's bytes. `Cow::Borrowed` when the super-chunk can hand out
    /// its own storage; `Cow::Owned` when the chunk had to be materialized
    /// (lazy storage, special chunks).
    pub fn get_lazychunk(&self, nchunk: usize) -> Result<Cow<'_, [u8]>> {
        let slot = self.chunks.get(nchunk).ok_or(Error::InvalidIndex)?;
        slot_bytes(slot, &self.frame_buf, &self.storage, self.typesize)
    }

    /// A full copy of the chunk's bytes.
    pub fn get_chunk(&self, nchunk: usize) -> Result<Vec<u8>> {
        Ok(self.get_lazychunk(nchunk)?.into_owned())
    }

    /// Logical length of chunk `nchunk`.
    pub fn chunk_nbytes(&self, nchunk: usize) -> Result<usize> {
        let slot = self.chunks.get(nchunk).ok_or(Error::InvalidIndex)?;
        slot.nbytes(&self.frame_buf, &self.storage, self.typesize)
    }

    /// Decompress chunk `nchunk` into `dest`, returning its payload length.
    pub fn decompress_chunk(&mut self, nchunk: usize, dest: &mut [u8]) -> Result<usize> {
        let SChunk { chunks, frame_buf, storage, dctx, typesize, .. } = self;
        let slot = chunks.get(nchunk).ok_or(Error::InvalidIndex)?;
        let chunk = slot_bytes(slot, frame_buf, storage, *typesize)?;
        dctx.set_nchunk(nchunk as i64);
        blosc2::decompress_ctx(dctx, &chunk, dest)
    }

    /// Random access into chunk `nchunk`: `nitems` elements from item
    /// `start`.
    pub fn getitem(&mut self, nchunk: usize, start: usize, nitems: usize, dest: &mut [u8]) -> Result<usize> {
        let SChunk { chunks, frame_buf, storage, dctx, typesize, .. } = self;
        let slot = chunks.get(nchunk).ok_or(Error::InvalidIndex)?;
        let chunk = slot_bytes(slot, frame_buf, storage, *typesize)?;
        dctx.set_nchunk(nchunk as i64);
        blosc2::getitem_ctx(dctx, &chunk, start, nitems, dest)
    }

    /// Random access across the whole super-chunk, item coordinates.
    pub fn getitem_flat(&mut self, start: usize, nitems: usize, dest: &mut [u8]) -> Result<usize> {
        let items_per_chunk = self.items_per_chunk()?;
        let mut written = 0usize;
        let mut item = start;
        let stop = start + nitems;
        while item < stop {
            let nchunk = item / items_per_chunk;
            let in_chunk = item % items_per_chunk;
            let take = (items_per_chunk - in_chunk).min(stop - item);
            written += self.getitem(nchunk, in_chunk, take, &mut dest[written..])?;
            item += take;
        }
        Ok(written)
    }

    // Metadata layers (fixed): count-bounded, size-stable.

    pub fn meta_exists(&self, name: &str) -> Option<usize> {
        self.meta.iter().position(|m| m.name == name)
    }

    /// Add a metalayer. The name must be unused.
    pub fn meta_add(&mut self, name: &str, content: &[u8]) -> Result<usize> {
        if self.meta_exists(name).is_some() {
            return Err(Error::InvalidParam("metalayer name already exists"));
        }
        if self.meta.len() >= BLOSC2_MAX_METALAYERS {
            return Err(Error::InvalidParam("too many metalayers"));
        }
        if name.is_empty() || name.len() > BLOSC2_METALAYER_NAME_MAX {
            return Err(Error::InvalidParam("bad metalayer name length"));
        }
        self.meta.push(MetaLayer { name: name.to_string(), content: content.to_vec() });
        self.persist_meta()?;
        Ok(self.meta.len() - 1)
    }

    /// Update a metalayer in place. Fixed layers are size-stable: the new
    /// content must have the original length.
    pub fn meta_update(&mut self, name: &str, content: &[u8]) -> Result<usize> {
        let idx = self.meta_exists(name).ok_or_else(|| Error::MetalayerNotFound(name.to_string()))?;
        if content.len() != self.meta[idx].content.len() {
            return Err(Error::InvalidParam("metalayer updates cannot change the content length"));
        }
        self.meta[idx].content.copy_from_slice(content);
        self.persist_meta()?;
        Ok(idx)
    }

    /// Internal metalayer rewrite; unlike [`SChunk::meta_update`] the content
    /// may change length (geometry layers resize when the rank changes).
    pub(crate) fn meta_replace(&mut self, name: &str, content: Vec<u8>) -> Result<usize> {
        let idx = self.meta_exists(name).ok_or_else(|| Error::MetalayerNotFound(name.to_string()))?;
        self.meta[idx].content = content;
        self.persist_meta()?;
        Ok(idx)
    }

    pub fn meta_get(&self, name: &str) -> Result<&[u8]> {
        let idx = self.meta_exists(name).ok_or_else(|| Error::MetalayerNotFound(name.to_string()))?;
        Ok(&self.meta[idx].content)
    }

    pub fn meta_names(&self) -> Vec<&str> {
        self.meta.iter().map(|m| m.name.as_str()).collect()
    }

    // Variable-length metadata layers: unbounded, resizable, deletable.

    pub fn vlmeta_exists(&self, name: &str) -> Option<usize> {
        self.vlmeta.iter().position(|m| m.name == name)
    }

    pub fn vlmeta_add(&mut self, name: &str, content: &[u8]) -> Result<usize> {
        if self.vlmeta_exists(name).is_some() {
            return Err(Error::InvalidParam("vlmetalayer name already exists"));
        }
        if name.is_empty() || name.len() > BLOSC2_METALAYER_NAME_MAX {
            return Err(Error::InvalidParam("bad vlmetalayer name length"));
        }
        self.vlmeta.push(MetaLayer { name: name.to_string(), content: content.to_vec() });
        self.persist_meta()?;
        Ok(self.vlmeta.len() - 1)
    }

    /// Update a vlmetalayer; resizing is allowed.
    pub fn vlmeta_update(&mut self, name: &str, content: &[u8]) -> Result<usize> {
        let idx = self.vlmeta_exists(name).ok_or_else(|| Error::MetalayerNotFound(name.to_string()))?;
        self.vlmeta[idx].content = content.to_vec();
        self.persist_meta()?;
        Ok(idx)
    }

    pub fn vlmeta_get(&self, name: &str) -> Result<&[u8]> {
        let idx = self.vlmeta_exists(name).ok_or_else(|| Error::MetalayerNotFound(name.to_string()))?;
        Ok(&self.vlmeta[idx].content)
    }

    pub fn vlmeta_delete(&mut self, name: &str) -> Result<usize> {
        let idx = self.vlmeta_exists(name).ok_or_else(|| Error::MetalayerNotFound(name.to_string()))?;
        self.vlmeta.remove(idx);
        self.persist_meta()?;
        Ok(self.vlmeta.len())
    }

    pub fn vlmeta_names(&self) -> Vec<&str> {
        self.vlmeta.iter().map(|m| m.name.as_str()).collect()
    }

    // Frames.

    /// Serialize to a contiguous in-memory frame.
    pub fn to_buffer(&self) -> Result<Vec<u8>> {
        frame::to_cframe(self)
    }

    /// Deserialize from a contiguous frame, copying every chunk out.
    pub fn from_buffer(buf: &[u8]) -> Result<SChunk> {
        frame::from_cframe_copy(buf)
    }

    /// Deserialize from a contiguous frame, keeping the buffer as backing
    /// storage; chunks alias into it until mutated.
    pub fn from_buffer_owned(buf: Vec<u8>) -> Result<SChunk> {
        frame::from_cframe_owned(buf)
    }

    /// Open a persisted super-chunk (contiguous file or sparse directory).
    pub fn open(urlpath: &str) -> Result<SChunk> {
        let (backend, path) = stdio::resolve(urlpath)?;
        if backend.is_dir(&path) {
            sframe::open(urlpath)
        } else {
            frame::open_file(urlpath)
        }
    }

    /// Write this super-chunk to `urlpath` and keep it as backing storage.
    pub fn save(&mut self, urlpath: &str, contiguous: bool) -> Result<()> {
        self.materialize_all()?;
        self.storage.urlpath = Some(urlpath.to_string());
        self.storage.contiguous = contiguous;
        self.persist_all()
    }

    /// Deep copy under new storage parameters. Chunks are moved verbatim when
    /// the compression parameters agree, recompressed otherwise.
    pub fn copy(&mut self, storage: Storage) -> Result<SChunk> {
        if storage.cparams.typesize != self.typesize {
            return Err(Error::InvalidParam("copy cannot change the typesize"));
        }
        let same_params = {
            let a = &storage.cparams;
            let b = &self.storage.cparams;
            a.compcode == b.compcode
                && a.compcode_meta == b.compcode_meta
                && a.clevel == b.clevel
                && a.pipeline == b.pipeline
                && a.splitmode == b.splitmode
        };
        let mut dst = SChunk::new(storage)?;
        for m in &self.meta {
            dst.meta_add(&m.name, &m.content)?;
        }
        for m in &self.vlmeta {
            dst.vlmeta_add(&m.name, &m.content)?;
        }
        for nchunk in 0..self.nchunks() {
            if same_params {
                let chunk = self.get_chunk(nchunk)?;
                dst.append_chunk(chunk)?;
            } else {
                let nbytes = self.chunk_nbytes(nchunk)?;
                let mut buf = vec![0u8; nbytes];
                self.decompress_chunk(nchunk, &mut buf)?;
                dst.append_buffer(&buf)?;
            }
        }
        Ok(dst)
    }

    // Persistence plumbing for url-backed super-chunks.

    /// Turn every lazy slot into an owned one (used before rewriting the
    /// storage those slots point into).
    pub(crate) fn materialize_all(&mut self) -> Result<()> {
        for i in 0..self.chunks.len() {
            let owned = match &self.chunks[i] {
                ChunkSlot::InFrame { .. } | ChunkSlot::OnDisk { .. } | ChunkSlot::SparseFile { .. } => {
                    slot_bytes(&self.chunks[i], &self.frame_buf, &self.storage, self.typesize)?.into_owned()
                }
                _ => continue,
            };
            self.chunks[i] = ChunkSlot::Owned(owned);
        }
        self.frame_buf = None;
        Ok(())
    }

    fn persist_append(&mut self) -> Result<()> {
        let Some(urlpath) = self.storage.urlpath.clone() else { return Ok(()) };
        if self.storage.contiguous {
            frame::append_last_chunk_file(self, &urlpath)
        } else {
            sframe::append_last_chunk(self, &urlpath)
        }
    }

    fn persist_meta(&mut self) -> Result<()> {
        if self.storage.urlpath.is_some() {
            self.persist_all()
        } else {
            Ok(())
        }
    }

    pub(crate) fn persist_all(&mut self) -> Result<()> {
        let Some(urlpath) = self.storage.urlpath.clone() else { return Ok(()) };
        self.materialize_all()?;
        if self.storage.contiguous {
            frame::save_file(self, &urlpath)
        } else {
            sframe::save(self, &urlpath)
        }
    }
}

impl std::fmt::Debug for SChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SChunk")
            .field("typesize", &self.typesize)
            .field("chunksize", &self.chunksize)
            .field("nchunks", &self.chunks.len())
            .field("nbytes", &self.nbytes)
            .field("cbytes", &self.cbytes)
            .field("nmeta", &self.meta.len())
            .field("nvlmeta", &self.vlmeta.len())
            .field("urlpath", &self.storage.urlpath)
            .finish()
    }
}
