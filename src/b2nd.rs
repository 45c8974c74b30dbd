//! N-dimensional array overlay (b2nd).
//!
//! A `B2ndArray` maps an n-dim shape onto the chunk→block→cell partitioning
//! of a super-chunk it owns: each chunk stores one `extchunkshape` tile in
//! blockshape-major order. The `"b2nd"` metalayer is the single source of
//! geometric truth; the struct fields are a cache rebuilt from it on load.

use crate::b2nd_utils::{copy_buffer, multidim_to_unidim, strides_of, unidim_to_multidim};
use crate::blosc2;
use crate::constants::*;
use crate::context::CCtx;
use crate::error::{Error, Result};
use crate::schunk::{MetaLayer, SChunk, SpecialValue, Storage};
use crate::util::{MpReader, mp_push_fixarray, mp_push_i32, mp_push_i64, mp_push_str32};

pub const B2ND_METALAYER_VERSION: u8 = 0;
pub const B2ND_DEFAULT_DTYPE: &str = "|u1";
/// NumPy-style dtype strings.
pub const DTYPE_NUMPY_FORMAT: i8 = 0;

/// Creation parameters for a b2nd array.
#[derive(Clone)]
pub struct B2ndParams {
    pub storage: Storage,
    pub shape: Vec<i64>,
    pub chunkshape: Vec<i32>,
    pub blockshape: Vec<i32>,
    pub dtype: String,
    pub dtype_format: i8,
    /// Extra metalayers to attach besides `"b2nd"`.
    pub meta: Vec<MetaLayer>,
}

impl B2ndParams {
    pub fn new(storage: Storage, shape: &[i64], chunkshape: &[i32], blockshape: &[i32]) -> B2ndParams {
        B2ndParams {
            storage,
            shape: shape.to_vec(),
            chunkshape: chunkshape.to_vec(),
            blockshape: blockshape.to_vec(),
            dtype: B2ND_DEFAULT_DTYPE.to_string(),
            dtype_format: DTYPE_NUMPY_FORMAT,
            meta: Vec::new(),
        }
    }

    pub fn with_dtype(mut self, dtype: &str, dtype_format: i8) -> B2ndParams {
        self.dtype = dtype.to_string();
        self.dtype_format = dtype_format;
        self
    }

    fn validate(&self) -> Result<()> {
        let ndim = self.shape.len();
        if ndim > B2ND_MAX_DIM {
            return Err(Error::InvalidParam("too many dimensions"));
        }
        if self.chunkshape.len() != ndim || self.blockshape.len() != ndim {
            return Err(Error::InvalidParam("shape, chunkshape and blockshape must share their rank"));
        }
        for i in 0..ndim {
            if self.shape[i] < 0 {
                return Err(Error::InvalidParam("shape extents cannot be negative"));
            }
            if self.chunkshape[i] < 1 || self.blockshape[i] < 1 {
                return Err(Error::InvalidParam("chunkshape and blockshape extents must be at least 1"));
            }
            if self.blockshape[i] > self.chunkshape[i] {
                return Err(Error::InvalidParam("blockshape cannot exceed chunkshape"));
            }
        }
        Ok(())
    }
}

/// The array: a super-chunk plus cached geometry.
pub struct B2ndArray {
    pub(crate) schunk: SChunk,
    ndim: usize,
    shape: [i64; B2ND_MAX_DIM],
    chunkshape: [i32; B2ND_MAX_DIM],
    blockshape: [i32; B2ND_MAX_DIM],
    extshape: [i64; B2ND_MAX_DIM],
    extchunkshape: [i32; B2ND_MAX_DIM],
    nitems: i64,
    extnitems: i64,
    chunknitems: i64,
    extchunknitems: i64,
    blocknitems: i64,
    item_block_strides: [i64; B2ND_MAX_DIM],
    dtype: String,
    dtype_format: i8,
}

// Geometry helpers.

fn ceil_to_multiple(value: i64, multiple: i64) -> i64 {
    if value % multiple == 0 {
        value
    } else {
        value + multiple - value % multiple
    }
}

struct Geometry {
    shape: [i64; B2ND_MAX_DIM],
    chunkshape: [i32; B2ND_MAX_DIM],
    blockshape: [i32; B2ND_MAX_DIM],
    extshape: [i64; B2ND_MAX_DIM],
    extchunkshape: [i32; B2ND_MAX_DIM],
    nitems: i64,
    extnitems: i64,
    chunknitems: i64,
    extchunknitems: i64,
    blocknitems: i64,
}

fn derive_geometry(ndim: usize, shape: &[i64], chunkshape: &[i32], blockshape: &[i32]) -> Geometry {
    let mut g = Geometry {
        shape: [1; B2ND_MAX_DIM],
        chunkshape: [1; B2ND_MAX_DIM],
        blockshape: [1; B2ND_MAX_DIM],
        extshape: [1; B2ND_MAX_DIM],
        extchunkshape: [1; B2ND_MAX_DIM],
        nitems: 1,
        extnitems: 1,
        chunknitems: 1,
        extchunknitems: 1,
        blocknitems: 1,
    };
    for i in 0..ndim {
        g.shape[i] = shape[i];
        g.chunkshape[i] = chunkshape[i];
        g.blockshape[i] = blockshape[i];
        if shape[i] != 0 {
            g.extshape[i] = ceil_to_multiple(shape[i], chunkshape[i] as i64);
        } else {
            g.extshape[i] = 0;
        }
        g.extchunkshape[i] = ceil_to_multiple(chunkshape[i] as i64, blockshape[i] as i64) as i32;
    }
    for i in 0..ndim {
        g.nitems *= g.shape[i];
        g.extnitems *= g.extshape[i];
        g.chunknitems *= g.chunkshape[i] as i64;
        g.extchunknitems *= g.extchunkshape[i] as i64;
        g.blocknitems *= g.blockshape[i] as i64;
    }
    g
}

/// Serialize the `"b2nd"` metalayer: a 7-entry msgpack-style record of
/// version, ndim, shape, chunkshape, blockshape, dtype format and dtype.
pub fn serialize_meta(
    ndim: usize,
    shape: &[i64],
    chunkshape: &[i32],
    blockshape: &[i32],
    dtype: &str,
    dtype_format: i8,
) -> Result<Vec<u8>> {
    if dtype_format < 0 {
        return Err(Error::InvalidParam("dtype_format cannot be negative"));
    }
    let mut smeta = Vec::with_capacity(32 + ndim * 17 + dtype.len());
    mp_push_fixarray(&mut smeta, 7);
    smeta.push(B2ND_METALAYER_VERSION);
    smeta.push(ndim as u8);
    mp_push_fixarray(&mut smeta, ndim as u8);
    for &s in &shape[..ndim] {
        mp_push_i64(&mut smeta, s);
    }
    mp_push_fixarray(&mut smeta, ndim as u8);
    for &c in &chunkshape[..ndim] {
        mp_push_i32(&mut smeta, c);
    }
    mp_push_fixarray(&mut smeta, ndim as u8);
    for &b in &blockshape[..ndim] {
        mp_push_i32(&mut smeta, b);
    }
    smeta.push(dtype_format as u8);
    mp_push_str32(&mut smeta, dtype);
    Ok(smeta)
}

pub struct DeserializedMeta {
    pub ndim: usize,
    pub shape: Vec<i64>,
    pub chunkshape: Vec<i32>,
    pub blockshape: Vec<i32>,
    pub dtype: String,
    pub dtype_format: i8,
}

/// Parse a `"b2nd"` metalayer; the 5-entry `"caterva"` layout (no dtype) is
/// accepted as well.
pub fn deserialize_meta(smeta: &[u8]) -> Result<DeserializedMeta> {
    let mut r = MpReader::new(smeta);
    let entries = r.fixarray()?;
    if entries != 7 && entries != 5 {
        return Err(Error::Corruption("unexpected b2nd metalayer layout"));
    }
    let _version = r.fixint()?;
    let ndim = r.fixint()? as usize;
    if ndim > B2ND_MAX_DIM {
        return Err(Error::Corruption("b2nd metalayer rank too large"));
    }
    let n = r.fixarray()? as usize;
    if n != ndim {
        return Err(Error::Corruption("b2nd shape entry disagrees with ndim"));
    }
    let mut shape = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        shape.push(r.i64()?);
    }
    if r.fixarray()? as usize != ndim {
        return Err(Error::Corruption("b2nd chunkshape entry disagrees with ndim"));
    }
    let mut chunkshape = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        chunkshape.push(r.i32()?);
    }
    if r.fixarray()? as usize != ndim {
        return Err(Error::Corruption("b2nd blockshape entry disagrees with ndim"));
    }
    let mut blockshape = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        blockshape.push(r.i32()?);
    }
    let (dtype, dtype_format) = if entries == 7 {
        let fmt = r.fixint()? as i8;
        (r.str32()?.to_string(), fmt)
    } else {
        (B2ND_DEFAULT_DTYPE.to_string(), DTYPE_NUMPY_FORMAT)
    };
    Ok(DeserializedMeta { ndim, shape, chunkshape, blockshape, dtype, dtype_format })
}

impl B2ndArray {
    // Constructors.

    fn array_new(params: &B2ndParams, fill: Option<SpecialValue>) -> Result<B2ndArray> {
        params.validate()?;
        let ndim = params.shape.len();
        let g = derive_geometry(ndim, &params.shape, &params.chunkshape, &params.blockshape);

        let mut storage = params.storage.clone();
        let typesize = storage.cparams.typesize;
        // One blosc block per b2nd block.
        storage.cparams.blocksize = (g.blocknitems as usize) * typesize;
        let mut schunk = SChunk::new(storage)?;

        let smeta = serialize_meta(
            ndim,
            &params.shape,
            &params.chunkshape,
            &params.blockshape,
            &params.dtype,
            params.dtype_format,
        )?;
        schunk.meta_add("b2nd", &smeta)?;
        for layer in &params.meta {
            schunk.meta_add(&layer.name, &layer.content)?;
        }

        let mut array = B2ndArray {
            schunk,
            ndim,
            shape: g.shape,
            chunkshape: g.chunkshape,
            blockshape: g.blockshape,
            extshape: g.extshape,
            extchunkshape: g.extchunkshape,
            nitems: g.nitems,
            extnitems: g.extnitems,
            chunknitems: g.chunknitems,
            extchunknitems: g.extchunknitems,
            blocknitems: g.blocknitems,
            item_block_strides: strides_of(&blockshape_items(&g.blockshape, ndim)),
            dtype: params.dtype.clone(),
            dtype_format: params.dtype_format,
        };

        if let Some(special) = fill {
            let nchunks = if array.nitems == 0 { 0 } else { array.extnitems / array.chunknitems };
            if nchunks > 0 {
                let chunk_nbytes = array.extchunknitems * typesize as i64;
                let items_per_chunk = array.extchunknitems;
                array.schunk.fill_special(nchunks * items_per_chunk, special, chunk_nbytes)?;
            }
        }
        Ok(array)
    }

    /// Array with uninitialized contents.
    pub fn uninit(params: &B2ndParams) -> Result<B2ndArray> {
        Self::array_new(params, Some(SpecialValue::Uninit))
    }

    /// Alias of [`B2ndArray::uninit`], matching the original naming.
    pub fn empty(params: &B2ndParams) -> Result<B2ndArray> {
        Self::array_new(params, Some(SpecialValue::Uninit))
    }

    pub fn zeros(params: &B2ndParams) -> Result<B2ndArray> {
        Self::array_new(params, Some(SpecialValue::Zero))
    }

    pub fn nans(params: &B2ndParams) -> Result<B2ndArray> {
        let typesize = params.storage.cparams.typesize;
        if typesize != 4 && typesize != 8 {
            return Err(Error::Data("NaN arrays need typesize 4 or 8"));
        }
        Self::array_new(params, Some(SpecialValue::Nan))
    }

    /// Array filled with one repeated element.
    pub fn full(params: &B2ndParams, fill_value: &[u8]) -> Result<B2ndArray> {
        if fill_value.len() != params.storage.cparams.typesize {
            return Err(Error::InvalidParam("fill value must be exactly typesize bytes"));
        }
        Self::array_new(params, Some(SpecialValue::Value(fill_value.to_vec())))
    }

    /// Build an array from a C-order buffer of `shape` items.
    pub fn from_cbuffer(params: &B2ndParams, buffer: &[u8]) -> Result<B2ndArray> {
        let mut array = Self::array_new(params, Some(SpecialValue::Uninit))?;
        let expected = array.nitems * array.schunk.typesize() as i64;
        if (buffer.len() as i64) < expected {
            return Err(Error::ReadBuffer);
        }
        if array.nitems > 0 {
            let start = vec![0i64; array.ndim];
            let stop: Vec<i64> = array.shape[..array.ndim].to_vec();
            let shape = stop.clone();
            array.set_slice_cbuffer(buffer, &shape, &start, &stop)?;
        }
        Ok(array)
    }

    /// Adopt an existing super-chunk carrying a `"b2nd"` (or legacy
    /// `"caterva"`) metalayer.
    pub fn from_schunk(mut schunk: SChunk) -> Result<B2ndArray> {
        let smeta = schunk
            .meta_get("b2nd")
            .or_else(|_| schunk.meta_get("caterva"))
            .map_err(|_| Error::MetalayerNotFound("b2nd".to_string()))?
            .to_vec();
        let meta = deserialize_meta(&smeta)?;
        let g = derive_geometry(meta.ndim, &meta.shape, &meta.chunkshape, &meta.blockshape);

        // Chunk recompression must keep one blosc block per b2nd block, no
        // matter what parameters the super-chunk arrived with.
        let blocksize = (g.blocknitems as usize) * schunk.typesize();
        if schunk.storage.cparams.blocksize != blocksize {
            schunk.storage.cparams.blocksize = blocksize;
            schunk.cctx = CCtx::new(schunk.storage.cparams.clone())?;
        }
        let array = B2ndArray {
            ndim: meta.ndim,
            shape: g.shape,
            chunkshape: g.chunkshape,
            blockshape: g.blockshape,
            extshape: g.extshape,
            extchunkshape: g.extchunkshape,
            nitems: g.nitems,
            extnitems: g.extnitems,
            chunknitems: g.chunknitems,
            extchunknitems: g.extchunknitems,
            blocknitems: g.blocknitems,
            item_block_strides: strides_of(&blockshape_items(&g.blockshape, meta.ndim)),
            dtype: meta.dtype,
            dtype_format: meta.dtype_format,
            schunk,
        };
        Ok(array)
    }

    pub fn from_cframe(buf: &[u8]) -> Result<B2ndArray> {
        Self::from_schunk(SChunk::from_buffer(buf)?)
    }

    pub fn from_cframe_owned(buf: Vec<u8>) -> Result<B2ndArray> {
        Self::from_schunk(SChunk::from_buffer_owned(buf)?)
    }

    pub fn open(urlpath: &str) -> Result<B2ndArray> {
        Self::from_schunk(SChunk::open(urlpath)?)
    }

    pub fn to_cframe(&self) -> Result<Vec<u8>> {
        self.schunk.to_buffer()
    }

    pub fn save(&mut self, urlpath: &str, contiguous: bool) -> Result<()> {
        self.schunk.save(urlpath, contiguous)
    }

    // Accessors.

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape[..self.ndim]
    }

    pub fn chunkshape(&self) -> &[i32] {
        &self.chunkshape[..self.ndim]
    }

    pub fn blockshape(&self) -> &[i32] {
        &self.blockshape[..self.ndim]
    }

    pub fn extshape(&self) -> &[i64] {
        &self.extshape[..self.ndim]
    }

    pub fn extchunkshape(&self) -> &[i32] {
        &self.extchunkshape[..self.ndim]
    }

    pub fn nitems(&self) -> i64 {
        self.nitems
    }

    pub fn typesize(&self) -> usize {
        self.schunk.typesize()
    }

    pub fn dtype(&self) -> &str {
        &self.dtype
    }

    pub fn schunk(&self) -> &SChunk {
        &self.schunk
    }

    pub fn schunk_mut(&mut self) -> &mut SChunk {
        &mut self.schunk
    }

    fn chunks_in_array(&self) -> [i64; B2ND_MAX_DIM] {
        let mut out = [1i64; B2ND_MAX_DIM];
        for i in 0..self.ndim {
            out[i] = self.extshape[i] / self.chunkshape[i] as i64;
        }
        out
    }

    fn blocks_in_chunk(&self) -> [i64; B2ND_MAX_DIM] {
        let mut out = [1i64; B2ND_MAX_DIM];
        for i in 0..self.ndim {
            out[i] = (self.extchunkshape[i] / self.blockshape[i]) as i64;
        }
        out
    }

    /// Rebuild the cached geometry (and the metalayer) for a new shape.
    fn update_shape(&mut self, shape: &[i64]) -> Result<()> {
        let chunkshape: Vec<i32> = self.chunkshape[..self.ndim].to_vec();
        let blockshape: Vec<i32> = self.blockshape[..self.ndim].to_vec();
        let g = derive_geometry(self.ndim, shape, &chunkshape, &blockshape);
        self.shape = g.shape;
        self.extshape = g.extshape;
        self.nitems = g.nitems;
        self.extnitems = g.extnitems;

        let smeta = serialize_meta(self.ndim, shape, &chunkshape, &blockshape, &self.dtype, self.dtype_format)?;
        self.schunk.meta_replace("b2nd", smeta)?;
        Ok(())
    }

    // Slicing.

    /// Chunk indices overlapping `[start, stop)`.
    pub fn get_slice_nchunks(&self, start: &[i64], stop: &[i64]) -> Result<Vec<i64>> {
        self.check_bounds(start, stop)?;
        if self.ndim == 0 {
            return Ok(vec![0]);
        }
        let chunks_in_array = self.chunks_in_array();
        let strides = strides_of(&chunks_in_array[..self.ndim]);

        let mut update_start = [0i64; B2ND_MAX_DIM];
        let mut update_shape = [0i64; B2ND_MAX_DIM];
        let mut update_nchunks = 1i64;
        for i in 0..self.ndim {
            let cs = self.chunkshape[i] as i64;
            update_start[i] = start[i] / cs;
            update_shape[i] = (stop[i] + cs - 1) / cs - update_start[i];
            if stop[i] == start[i] {
                update_shape[i] = 0;
            }
            update_nchunks *= update_shape[i];
        }

        let mut out = Vec::new();
        let mut nchunk_ndim = [0i64; B2ND_MAX_DIM];
        for n in 0..update_nchunks {
            unidim_to_multidim(&update_shape[..self.ndim], n, &mut nchunk_ndim);
            for i in 0..self.ndim {
                nchunk_ndim[i] += update_start[i];
            }
            out.push(multidim_to_unidim(&nchunk_ndim[..self.ndim], &strides[..self.ndim]));
        }
        Ok(out)
    }

    fn check_bounds(&self, start: &[i64], stop: &[i64]) -> Result<()> {
        if start.len() != self.ndim || stop.len() != self.ndim {
            return Err(Error::InvalidParam("slice rank does not match the array"));
        }
        for i in 0..self.ndim {
            if start[i] < 0 || stop[i] < start[i] || stop[i] > self.shape[i] {
                return Err(Error::InvalidIndex);
            }
        }
        Ok(())
    }

    /// Probe the aligned single-chunk fast path. `Ok(None)` means the general
    /// path has to run; errors are real failures, never eligibility.
    fn slice_fastpath(&self, start: &[i64], stop: &[i64], slice_nitems: i64) -> Result<Option<i64>> {
        if slice_nitems != self.chunknitems {
            return Ok(None);
        }
        let mut inner_dim = self.ndim as i64 - 1;
        let mut partial_slice = 1i64;
        let mut partial_chunk = 1i64;
        for i in (0..self.ndim).rev() {
            if self.extshape[i] != self.shape[i] || self.extchunkshape[i] != self.chunkshape[i] {
                return Ok(None);
            }
            if self.chunkshape[i] > self.blockshape[i] {
                if (i as i64) < inner_dim {
                    if self.chunkshape[i] % self.blockshape[i] != 0 {
                        return Ok(None);
                    }
                } else if self.chunkshape[i] != self.blockshape[i] {
                    return Ok(None);
                }
                inner_dim = i as i64;
            }
            partial_slice *= stop[i] - start[i];
            partial_chunk *= self.chunkshape[i] as i64;
            if partial_slice != partial_chunk {
                return Ok(None);
            }
            if start[i] % self.chunkshape[i] as i64 != 0 {
                return Ok(None);
            }
        }
        let chunks = self.get_slice_nchunks(start, stop)?;
        if chunks.len() != 1 {
            return Err(Error::Data("aligned slice did not resolve to one chunk"));
        }
        Ok(Some(chunks[0]))
    }

    /// Copy the rectangle `[start, stop)` into `dest` (C-order,
    /// `dest_shape` items). Blocks outside the slice are never decompressed.
    pub fn get_slice_cbuffer(
        &mut self,
        start: &[i64],
        stop: &[i64],
        dest: &mut [u8],
        dest_shape: &[i64],
    ) -> Result<()> {
        self.check_bounds(start, stop)?;
        let typesize = self.schunk.typesize();

        if self.ndim == 0 {
            if dest.len() < typesize {
                return Err(Error::WriteBuffer);
            }
            self.schunk.decompress_chunk(0, &mut dest[..typesize])?;
            return Ok(());
        }
        if self.nitems == 0 {
            return Ok(());
        }

        let mut slice_nitems = 1i64;
        for i in 0..self.ndim {
            if stop[i] - start[i] > dest_shape[i] {
                return Err(Error::InvalidParam("destination shape smaller than the slice"));
            }
            slice_nitems *= stop[i] - start[i];
        }
        if (dest.len() as i64) < slice_nitems * typesize as i64 {
            return Err(Error::WriteBuffer);
        }
        if slice_nitems == 0 {
            return Ok(());
        }

        if let Some(nchunk) = self.slice_fastpath(start, stop, slice_nitems)? {
            self.schunk.decompress_chunk(nchunk as usize, dest)?;
            return Ok(());
        }

        self.walk_slice_chunks(start, stop, SliceBuffer::Get(dest), dest_shape)
    }

    /// Write `src` (C-order, `src_shape` items) into the rectangle
    /// `[start, stop)`, recompressing every touched chunk.
    pub fn set_slice_cbuffer(
        &mut self,
        src: &[u8],
        src_shape: &[i64],
        start: &[i64],
        stop: &[i64],
    ) -> Result<()> {
        self.check_bounds(start, stop)?;
        let typesize = self.schunk.typesize();

        if self.ndim == 0 {
            if src.len() < typesize {
                return Err(Error::ReadBuffer);
            }
            let mut chunk = vec![0u8; typesize + BLOSC2_MAX_OVERHEAD];
            self.schunk.cctx_mut().set_nchunk(0);
            let cbytes = blosc2::compress_ctx(&self.schunk.cctx, &src[..typesize], &mut chunk)?;
            chunk.truncate(cbytes);
            if self.schunk.nchunks() == 0 {
                self.schunk.append_chunk(chunk)?;
            } else {
                self.schunk.update_chunk(0, chunk)?;
            }
            return Ok(());
        }
        if self.nitems == 0 {
            return Ok(());
        }

        let mut slice_nitems = 1i64;
        for i in 0..self.ndim {
            if stop[i] - start[i] > src_shape[i] {
                return Err(Error::InvalidParam("source shape smaller than the slice"));
            }
            slice_nitems *= stop[i] - start[i];
        }
        if (src.len() as i64) < slice_nitems * typesize as i64 {
            return Err(Error::ReadBuffer);
        }
        if slice_nitems == 0 {
            return Ok(());
        }

        if let Some(nchunk) = self.slice_fastpath(start, stop, slice_nitems)? {
            let data_nbytes = (self.extchunknitems as usize) * typesize;
            let mut chunk = vec![0u8; data_nbytes + BLOSC2_MAX_OVERHEAD];
            self.schunk.cctx_mut().set_nchunk(nchunk);
            let cbytes = blosc2::compress_ctx(&self.schunk.cctx, &src[..data_nbytes], &mut chunk)?;
            chunk.truncate(cbytes);
            self.schunk.update_chunk(nchunk as usize, chunk)?;
            return Ok(());
        }

        self.walk_slice_chunks(start, stop, SliceBuffer::Set(src), src_shape)
    }

    /// The general slice path: visit every chunk overlapping `[start, stop)`
    /// and move the overlap block by block.
    fn walk_slice_chunks(
        &mut self,
        start: &[i64],
        stop: &[i64],
        mut buffer: SliceBuffer<'_>,
        buffer_shape: &[i64],
    ) -> Result<()> {
        let ndim = self.ndim;
        let typesize = self.schunk.typesize();
        let data_nbytes = (self.extchunknitems as usize) * typesize;
        let mut data = vec![0u8; data_nbytes];

        let chunks_in_array = self.chunks_in_array();
        let chunk_strides = strides_of(&chunks_in_array[..ndim]);
        let blocks_in_chunk = self.blocks_in_chunk();
        let nblocks = (self.extchunknitems / self.blocknitems) as usize;

        // The chunk grid rectangle covering the slice.
        let mut update_start = [0i64; B2ND_MAX_DIM];
        let mut update_shape = [0i64; B2ND_MAX_DIM];
        let mut update_nchunks = 1i64;
        for i in 0..ndim {
            let cs = self.chunkshape[i] as i64;
            update_start[i] = start[i] / cs;
            update_shape[i] = (stop[i] + cs - 1) / cs - update_start[i];
            update_nchunks *= update_shape[i];
        }

        for n in 0..update_nchunks {
            let mut nchunk_ndim = [0i64; B2ND_MAX_DIM];
            unidim_to_multidim(&update_shape[..ndim], n, &mut nchunk_ndim);
            for i in 0..ndim {
                nchunk_ndim[i] += update_start[i];
            }
            let nchunk = multidim_to_unidim(&nchunk_ndim[..ndim], &chunk_strides[..ndim]);

            // The chunk's rectangle clamped to the array shape.
            let mut chunk_start = [0i64; B2ND_MAX_DIM];
            let mut chunk_stop = [0i64; B2ND_MAX_DIM];
            for i in 0..ndim {
                chunk_start[i] = nchunk_ndim[i] * self.chunkshape[i] as i64;
                chunk_stop[i] = (chunk_start[i] + self.chunkshape[i] as i64).min(self.shape[i]);
            }
            if (0..ndim).any(|i| chunk_stop[i] <= start[i] || chunk_start[i] >= stop[i]) {
                continue;
            }

            match &buffer {
                SliceBuffer::Set(_) => {
                    // A full cover can skip the decompression; otherwise the
                    // old contents must survive around the slice.
                    let full_cover =
                        (0..ndim).all(|i| chunk_start[i] >= start[i] && chunk_stop[i] <= stop[i]);
                    if full_cover {
                        data.fill(0);
                    } else {
                        self.schunk.decompress_chunk(nchunk as usize, &mut data)?;
                    }
                }
                SliceBuffer::Get(_) => {
                    let mut maskout = vec![true; nblocks];
                    for (nblock, mask) in maskout.iter_mut().enumerate() {
                        let mut nblock_ndim = [0i64; B2ND_MAX_DIM];
                        unidim_to_multidim(&blocks_in_chunk[..ndim], nblock as i64, &mut nblock_ndim);
                        let mut empty = false;
                        for i in 0..ndim {
                            let bstart = (nblock_ndim[i] * self.blockshape[i] as i64 + chunk_start[i])
                                .min(chunk_stop[i]);
                            let bstop = (bstart + self.blockshape[i] as i64).min(chunk_stop[i]);
                            empty |= bstop <= start[i] || bstart >= stop[i];
                        }
                        *mask = empty;
                    }
                    self.schunk.dctx_mut().set_maskout(maskout);
                    self.schunk.decompress_chunk(nchunk as usize, &mut data)?;
                }
            }

            // Move every intersecting block's overlap.
            for nblock in 0..nblocks {
                let mut nblock_ndim = [0i64; B2ND_MAX_DIM];
                unidim_to_multidim(&blocks_in_chunk[..ndim], nblock as i64, &mut nblock_ndim);

                let mut block_start = [0i64; B2ND_MAX_DIM];
                let mut block_stop = [0i64; B2ND_MAX_DIM];
                for i in 0..ndim {
                    block_start[i] =
                        (nblock_ndim[i] * self.blockshape[i] as i64 + chunk_start[i]).min(chunk_stop[i]);
                    block_stop[i] =
                        (nblock_ndim[i] * self.blockshape[i] as i64 + chunk_start[i] + self.blockshape[i] as i64)
                            .min(chunk_stop[i]);
                }
                if (0..ndim).any(|i| block_stop[i] <= start[i] || block_start[i] >= stop[i]) {
                    continue;
                }

                // Overlap rectangle in absolute coordinates.
                let mut slice_start = [0i64; B2ND_MAX_DIM];
                let mut slice_stop = [0i64; B2ND_MAX_DIM];
                for i in 0..ndim {
                    slice_start[i] = block_start[i].max(start[i]);
                    slice_stop[i] = block_stop[i].min(stop[i]);
                }

                let mut buf_start = [0i64; B2ND_MAX_DIM];
                let mut buf_stop = [0i64; B2ND_MAX_DIM];
                let mut blk_start = [0i64; B2ND_MAX_DIM];
                let mut blk_stop = [0i64; B2ND_MAX_DIM];
                let mut blk_pad = [0i64; B2ND_MAX_DIM];
                for i in 0..ndim {
                    buf_start[i] = slice_start[i] - start[i];
                    buf_stop[i] = slice_stop[i] - start[i];
                    blk_start[i] = slice_start[i] - block_start[i];
                    blk_stop[i] = blk_start[i] + (slice_stop[i] - slice_start[i]);
                    blk_pad[i] = self.blockshape[i] as i64;
                }

                let block_off = nblock * self.blocknitems as usize * typesize;
                let block_data = &mut data[block_off..block_off + self.blocknitems as usize * typesize];
                match &mut buffer {
                    SliceBuffer::Get(dest) => copy_buffer(
                        ndim,
                        typesize,
                        block_data,
                        &blk_pad[..ndim],
                        &blk_start[..ndim],
                        &blk_stop[..ndim],
                        dest,
                        buffer_shape,
                        &buf_start[..ndim],
                    ),
                    SliceBuffer::Set(src) => copy_buffer(
                        ndim,
                        typesize,
                        src,
                        buffer_shape,
                        &buf_start[..ndim],
                        &buf_stop[..ndim],
                        block_data,
                        &blk_pad[..ndim],
                        &blk_start[..ndim],
                    ),
                }
            }

            if matches!(buffer, SliceBuffer::Set(_)) {
                let mut chunk = vec![0u8; data_nbytes + BLOSC2_MAX_OVERHEAD];
                self.schunk.cctx_mut().set_nchunk(nchunk);
                let cbytes = blosc2::compress_ctx(&self.schunk.cctx, &data, &mut chunk)?;
                chunk.truncate(cbytes);
                self.schunk.update_chunk(nchunk as usize, chunk)?;
            }
        }
        Ok(())
    }

    /// The whole array as a C-order buffer.
    pub fn to_cbuffer(&mut self, dest: &mut [u8]) -> Result<()> {
        let start = vec![0i64; self.ndim];
        let stop: Vec<i64> = self.shape[..self.ndim].to_vec();
        let shape = stop.clone();
        self.get_slice_cbuffer(&start, &stop, dest, &shape)
    }

    /// A new array holding the slice `[start, stop)`, with the geometry
    /// requested in `params` (its shape is overridden by the slice shape).
    pub fn get_slice(&mut self, params: &B2ndParams, start: &[i64], stop: &[i64]) -> Result<B2ndArray> {
        self.check_bounds(start, stop)?;
        let shape: Vec<i64> = (0..self.ndim).map(|i| stop[i] - start[i]).collect();
        let mut sliced_params = params.clone();
        sliced_params.shape = shape.clone();
        let mut dst = Self::array_new(&sliced_params, Some(SpecialValue::Uninit))?;
        let nbytes = dst.nitems * self.schunk.typesize() as i64;
        if nbytes > 0 {
            let mut buf = vec![0u8; nbytes as usize];
            self.get_slice_cbuffer(start, stop, &mut buf, &shape)?;
            let zeros = vec![0i64; self.ndim];
            dst.set_slice_cbuffer(&buf, &shape, &zeros, &shape)?;
        }
        Ok(dst)
    }

    /// Deep copy with the geometry of `params`.
    pub fn copy(&mut self, params: &B2ndParams) -> Result<B2ndArray> {
        let start = vec![0i64; self.ndim];
        let stop: Vec<i64> = self.shape[..self.ndim].to_vec();
        self.get_slice(params, &start, &stop)
    }

    // Shape mutations.

    /// Grow and/or shrink the array per axis. `start` places the change
    /// inside the axis (chunk-aligned unless at the end); `None` means the
    /// high end of each axis.
    pub fn resize(&mut self, new_shape: &[i64], start: Option<&[i64]>) -> Result<()> {
        if new_shape.len() != self.ndim {
            return Err(Error::InvalidParam("resize rank does not match the array"));
        }
        if let Some(start) = start {
            if start.len() != self.ndim {
                return Err(Error::InvalidParam("resize rank does not match the array"));
            }
            for i in 0..self.ndim {
                if start[i] > self.shape[i] {
                    return Err(Error::InvalidParam("resize start beyond the array shape"));
                }
                let interior_grow = new_shape[i] > self.shape[i] && start[i] != self.shape[i];
                let interior_shrink = new_shape[i] < self.shape[i]
                    && start[i] + self.shape[i] - new_shape[i] != self.shape[i];
                if interior_grow || interior_shrink {
                    // Chunks cannot be split in the middle of an axis.
                    if start[i] % self.chunkshape[i] as i64 != 0
                        || (new_shape[i] - self.shape[i]).abs() % self.chunkshape[i] as i64 != 0
                    {
                        return Err(Error::InvalidParam(
                            "interior resizes must be chunk-aligned in start and extent",
                        ));
                    }
                }
            }
        }

        let shrunk: Vec<i64> = (0..self.ndim).map(|i| new_shape[i].min(self.shape[i])).collect();
        self.shrink_shape(&shrunk, start)?;
        self.extend_shape(new_shape, start)?;
        Ok(())
    }

    fn extend_shape(&mut self, new_shape: &[i64], start: Option<&[i64]>) -> Result<()> {
        let mut diff_sum = 0i64;
        for i in 0..self.ndim {
            let diff = new_shape[i] - self.shape[i];
            if diff < 0 {
                return Err(Error::InvalidParam("extend cannot shrink an axis"));
            }
            diff_sum += diff;
        }
        if diff_sum == 0 {
            return Ok(());
        }

        let old_shape: Vec<i64> = self.shape[..self.ndim].to_vec();
        let old_nchunks = self.schunk.nchunks() as i64;
        self.update_shape(new_shape)?;

        let nchunks = if self.nitems == 0 { 0 } else { self.extnitems / self.chunknitems };
        if nchunks == old_nchunks {
            return Ok(());
        }
        let start: Vec<i64> = match start {
            Some(s) => s.to_vec(),
            None => old_shape.clone(),
        };
        let chunks_in_array = self.chunks_in_array();
        let typesize = self.schunk.typesize();
        let chunk_nbytes = (self.extchunknitems as usize) * typesize;
        let pipeline = self.schunk.storage.cparams.pipeline;
        let compcode = self.schunk.storage.cparams.compcode;

        for i in 0..nchunks {
            let mut nchunk_ndim = [0i64; B2ND_MAX_DIM];
            unidim_to_multidim(&chunks_in_array[..self.ndim], i, &mut nchunk_ndim);
            let inserted = (0..self.ndim).any(|j| {
                let origin = self.chunkshape[j] as i64 * nchunk_ndim[j];
                start[j] <= origin && origin < start[j] + new_shape[j] - old_shape[j]
            });
            if inserted {
                let chunk = blosc2::chunk_zeros(typesize, chunk_nbytes, &pipeline, compcode)?;
                self.schunk.insert_chunk(i as usize, chunk)?;
            }
        }
        Ok(())
    }

    fn shrink_shape(&mut self, new_shape: &[i64], start: Option<&[i64]>) -> Result<()> {
        let mut diff_sum = 0i64;
        for i in 0..self.ndim {
            let diff = new_shape[i] - self.shape[i];
            if diff > 0 {
                return Err(Error::InvalidParam("shrink cannot grow an axis"));
            }
            diff_sum += diff;
        }
        if diff_sum == 0 {
            return Ok(());
        }

        let old_shape: Vec<i64> = self.shape[..self.ndim].to_vec();
        let old_nchunks = self.schunk.nchunks() as i64;
        // The old chunk grid drives the deletion scan.
        let old_chunks_in_array = self.chunks_in_array();
        self.update_shape(new_shape)?;

        let start: Vec<i64> = match start {
            Some(s) => s.to_vec(),
            None => new_shape.to_vec(),
        };
        for i in (0..old_nchunks).rev() {
            let mut nchunk_ndim = [0i64; B2ND_MAX_DIM];
            unidim_to_multidim(&old_chunks_in_array[..self.ndim], i, &mut nchunk_ndim);
            let deleted = (0..self.ndim).any(|j| {
                let origin = self.chunkshape[j] as i64 * nchunk_ndim[j];
                start[j] <= origin && origin < start[j] + old_shape[j] - new_shape[j]
            });
            if deleted {
                self.schunk.delete_chunk(i as usize)?;
            }
        }
        Ok(())
    }

    /// Insert `buffer` along `axis` before `position`. The buffer must hold a
    /// whole number of cross-sections.
    pub fn insert(&mut self, buffer: &[u8], axis: usize, position: i64) -> Result<()> {
        if axis >= self.ndim {
            return Err(Error::InvalidParam("axis outside the array rank"));
        }
        let typesize = self.schunk.typesize() as i64;
        let mut cross_section = typesize;
        let mut buffer_shape = [0i64; B2ND_MAX_DIM];
        for i in 0..self.ndim {
            if i != axis {
                cross_section *= self.shape[i];
                buffer_shape[i] = self.shape[i];
            }
        }
        if cross_section == 0 || buffer.len() as i64 % cross_section != 0 {
            return Err(Error::InvalidParam("buffer is not a whole number of cross-sections"));
        }
        let grow = buffer.len() as i64 / cross_section;
        buffer_shape[axis] = grow;

        let mut new_shape: Vec<i64> = self.shape[..self.ndim].to_vec();
        new_shape[axis] += grow;
        let mut start = vec![0i64; self.ndim];
        start[axis] = position;
        if position == self.shape[axis] {
            self.resize(&new_shape, None)?;
        } else {
            self.resize(&new_shape, Some(&start))?;
        }

        let mut stop: Vec<i64> = self.shape[..self.ndim].to_vec();
        stop[axis] = position + grow;
        self.set_slice_cbuffer(buffer, &buffer_shape[..self.ndim], &start, &stop)
    }

    /// Append `buffer` at the end of `axis`. Chunk-sized appends along axis 0
    /// with block-aligned trailing axes go straight through the super-chunk.
    pub fn append(&mut self, buffer: &[u8], axis: usize) -> Result<()> {
        if axis >= self.ndim {
            return Err(Error::InvalidParam("axis outside the array rank"));
        }
        let chunk_nbytes = (self.extchunknitems as usize) * self.schunk.typesize();
        let compat = axis == 0
            && self.ndim > 0
            && (1..self.ndim).all(|i| self.chunkshape[i] == self.blockshape[i])
            && (1..self.ndim).all(|i| self.shape[i] == self.extshape[i])
            && self.chunkshape[0] % self.blockshape[0] == 0
            && self.shape[0] % self.chunkshape[0] as i64 == 0
            && buffer.len() == chunk_nbytes;
        if compat {
            self.schunk.append_buffer(buffer)?;
            let mut new_shape: Vec<i64> = self.shape[..self.ndim].to_vec();
            new_shape[0] += self.chunkshape[0] as i64;
            // The chunk is already in place; only the geometry moves.
            return self.update_shape(&new_shape);
        }
        self.insert(buffer, axis, self.shape[axis])
    }

    /// Delete `len` items along `axis` starting at `start`.
    pub fn delete(&mut self, axis: usize, start: i64, len: i64) -> Result<()> {
        if axis >= self.ndim {
            return Err(Error::InvalidParam("axis outside the array rank"));
        }
        if start < 0 || len < 0 || start + len > self.shape[axis] {
            return Err(Error::InvalidIndex);
        }
        let mut new_shape: Vec<i64> = self.shape[..self.ndim].to_vec();
        new_shape[axis] -= len;
        if start == self.shape[axis] - len {
            self.resize(&new_shape, None)
        } else {
            let mut s = vec![0i64; self.ndim];
            s[axis] = start;
            self.resize(&new_shape, Some(&s))
        }
    }

    /// Drop the length-1 axes flagged in `drop`. Only axes whose chunk and
    /// block extents are also 1 can go; anything else would change the chunk
    /// layout.
    pub fn squeeze_index(&mut self, drop: &[bool]) -> Result<()> {
        if drop.len() != self.ndim {
            return Err(Error::InvalidParam("squeeze rank does not match the array"));
        }
        let mut shape = Vec::new();
        let mut chunkshape = Vec::new();
        let mut blockshape = Vec::new();
        for i in 0..self.ndim {
            if drop[i] {
                if self.shape[i] != 1 {
                    return Err(Error::InvalidParam("only length-1 axes can be squeezed"));
                }
                if self.chunkshape[i] != 1 || self.blockshape[i] != 1 {
                    return Err(Error::InvalidParam("squeezed axes must have unit chunk and block extents"));
                }
            } else {
                shape.push(self.shape[i]);
                chunkshape.push(self.chunkshape[i]);
                blockshape.push(self.blockshape[i]);
            }
        }
        let ndim = shape.len();
        let g = derive_geometry(ndim, &shape, &chunkshape, &blockshape);
        self.ndim = ndim;
        self.shape = g.shape;
        self.chunkshape = g.chunkshape;
        self.blockshape = g.blockshape;
        self.extshape = g.extshape;
        self.extchunkshape = g.extchunkshape;
        self.nitems = g.nitems;
        self.extnitems = g.extnitems;
        self.chunknitems = g.chunknitems;
        self.extchunknitems = g.extchunknitems;
        self.blocknitems = g.blocknitems;
        self.item_block_strides = strides_of(&blockshape_items(&g.blockshape, ndim));

        let smeta = serialize_meta(ndim, &shape, &chunkshape, &blockshape, &self.dtype, self.dtype_format)?;
        self.schunk.meta_replace("b2nd", smeta)?;
        Ok(())
    }

    /// Drop every squeezable length-1 axis.
    pub fn squeeze(&mut self) -> Result<()> {
        let drop: Vec<bool> = (0..self.ndim)
            .map(|i| self.shape[i] == 1 && self.chunkshape[i] == 1 && self.blockshape[i] == 1)
            .collect();
        self.squeeze_index(&drop)
    }

    // Orthogonal selection.

    /// Gather `selection[i]` indices per axis (their Cartesian product) into
    /// `dest`, preserving the caller's index order, duplicates included.
    pub fn get_orthogonal_selection(
        &mut self,
        selection: &[Vec<i64>],
        dest: &mut [u8],
        dest_shape: &[i64],
    ) -> Result<()> {
        self.orthogonal_selection(selection, OrthoBuffer::Get(dest), dest_shape)
    }

    /// Scatter `src` into the Cartesian product of `selection`.
    pub fn set_orthogonal_selection(
        &mut self,
        selection: &[Vec<i64>],
        src: &[u8],
        src_shape: &[i64],
    ) -> Result<()> {
        self.orthogonal_selection(selection, OrthoBuffer::Set(src), src_shape)
    }

    fn orthogonal_selection(
        &mut self,
        selection: &[Vec<i64>],
        mut buffer: OrthoBuffer<'_>,
        buffer_shape: &[i64],
    ) -> Result<()> {
        let ndim = self.ndim;
        if ndim == 0 {
            return Err(Error::NotSupported("orthogonal selection needs at least one dimension"));
        }
        if selection.len() != ndim || buffer_shape.len() != ndim {
            return Err(Error::InvalidParam("selection rank does not match the array"));
        }
        let typesize = self.schunk.typesize();
        let mut sel_nitems = 1i64;
        for i in 0..ndim {
            for &v in &selection[i] {
                if v < 0 || v >= self.shape[i] {
                    return Err(Error::InvalidIndex);
                }
            }
            if (selection[i].len() as i64) > buffer_shape[i] {
                return Err(Error::InvalidParam("selection larger than the buffer shape"));
            }
            sel_nitems *= selection[i].len() as i64;
        }
        let needed = sel_nitems as usize * typesize;
        match &buffer {
            OrthoBuffer::Get(d) => {
                if d.len() < needed {
                    return Err(Error::WriteBuffer);
                }
            }
            OrthoBuffer::Set(s) => {
                if s.len() < needed {
                    return Err(Error::ReadBuffer);
                }
            }
        }
        if sel_nitems == 0 {
            return Ok(());
        }

        // Stable order by value, keeping the original position for the
        // buffer coordinate.
        let ordered: Vec<Vec<(i64, i64)>> = selection
            .iter()
            .map(|axis| {
                let mut v: Vec<(i64, i64)> =
                    axis.iter().enumerate().map(|(j, &value)| (value, j as i64)).collect();
                v.sort();
                v
            })
            .collect();

        // Per axis, the runs of sorted indices that share a chunk.
        let chunk_runs: Vec<Vec<(usize, usize, i64)>> = (0..ndim)
            .map(|i| runs_by(&ordered[i], |v| v / self.chunkshape[i] as i64))
            .collect();

        let chunks_in_array = self.chunks_in_array();
        let chunk_strides = strides_of(&chunks_in_array[..ndim]);
        let block_strides = {
            let blocks = self.blocks_in_chunk();
            strides_of(&blocks[..ndim])
        };
        let buffer_strides = strides_of(&buffer_shape[..ndim]);
        let nblocks = (self.extchunknitems / self.blocknitems) as usize;
        let data_nbytes = (self.extchunknitems as usize) * typesize;
        let mut data = vec![0u8; data_nbytes];

        // Walk the Cartesian product of per-axis chunk runs: each combination
        // is one chunk, decompressed exactly once.
        let mut run_pos = vec![0usize; ndim];
        'combos: loop {
            let mut nchunk = 0i64;
            for i in 0..ndim {
                let (_, _, chunk_i) = chunk_runs[i][run_pos[i]];
                nchunk += chunk_i * chunk_strides[i];
            }

            // The per-axis index ranges of this chunk's selection.
            let ranges: Vec<&[(i64, i64)]> = (0..ndim)
                .map(|i| {
                    let (lo, hi, _) = chunk_runs[i][run_pos[i]];
                    &ordered[i][lo..hi]
                })
                .collect();

            let get = matches!(buffer, OrthoBuffer::Get(_));
            if get {
                // Only the blocks the selection touches get decompressed.
                let mut maskout = vec![true; nblocks];
                let mut odo = vec![0usize; ndim];
                loop {
                    let mut nblock = 0i64;
                    for i in 0..ndim {
                        let (value, _) = ranges[i][odo[i]];
                        nblock +=
                            (value % self.chunkshape[i] as i64 / self.blockshape[i] as i64) * block_strides[i];
                    }
                    maskout[nblock as usize] = false;
                    if !advance(&mut odo, &ranges) {
                        break;
                    }
                }
                self.schunk.dctx_mut().set_maskout(maskout);
            }
            self.schunk.decompress_chunk(nchunk as usize, &mut data)?;

            // Element-by-element copies at the original buffer positions.
            let mut odo = vec![0usize; ndim];
            loop {
                let mut index_in_block = 0i64;
                let mut nblock = 0i64;
                let mut index_in_buffer = 0i64;
                for i in 0..ndim {
                    let (value, orig) = ranges[i][odo[i]];
                    let in_chunk = value % self.chunkshape[i] as i64;
                    nblock += in_chunk / self.blockshape[i] as i64 * block_strides[i];
                    index_in_block += in_chunk % self.blockshape[i] as i64 * self.item_block_strides[i];
                    index_in_buffer += orig * buffer_strides[i];
                }
                let data_off =
                    (nblock * self.blocknitems + index_in_block) as usize * typesize;
                let buf_off = index_in_buffer as usize * typesize;
                match &mut buffer {
                    OrthoBuffer::Get(dest) => {
                        dest[buf_off..buf_off + typesize].copy_from_slice(&data[data_off..data_off + typesize]);
                    }
                    OrthoBuffer::Set(src) => {
                        data[data_off..data_off + typesize].copy_from_slice(&src[buf_off..buf_off + typesize]);
                    }
                }
                if !advance(&mut odo, &ranges) {
                    break;
                }
            }

            if !get {
                let mut chunk = vec![0u8; data_nbytes + BLOSC2_MAX_OVERHEAD];
                self.schunk.cctx_mut().set_nchunk(nchunk);
                let cbytes = blosc2::compress_ctx(&self.schunk.cctx, &data, &mut chunk)?;
                chunk.truncate(cbytes);
                self.schunk.update_chunk(nchunk as usize, chunk)?;
            }

            // Next chunk combination.
            for i in (0..ndim + 1).rev() {
                if i == 0 {
                    break 'combos;
                }
                run_pos[i - 1] += 1;
                if run_pos[i - 1] < chunk_runs[i - 1].len() {
                    break;
                }
                run_pos[i - 1] = 0;
            }
        }
        Ok(())
    }
}

fn blockshape_items(blockshape: &[i32; B2ND_MAX_DIM], ndim: usize) -> Vec<i64> {
    blockshape[..ndim].iter().map(|&b| b as i64).collect()
}

/// Runs of equal `key(value)` over a sorted `(value, index)` list, as
/// `(lo, hi, key)` half-open ranges.
fn runs_by<F: Fn(i64) -> i64>(sorted: &[(i64, i64)], key: F) -> Vec<(usize, usize, i64)> {
    let mut runs = Vec::new();
    let mut lo = 0usize;
    while lo < sorted.len() {
        let k = key(sorted[lo].0);
        let mut hi = lo + 1;
        while hi < sorted.len() && key(sorted[hi].0) == k {
            hi += 1;
        }
        runs.push((lo, hi, k));
        lo = hi;
    }
    runs
}

/// Odometer step over per-axis ranges; false once every combination is done.
fn advance(odo: &mut [usize], ranges: &[&[(i64, i64)]]) -> bool {
    for i in (0..odo.len()).rev() {
        odo[i] += 1;
        if odo[i] < ranges[i].len() {
            return true;
        }
        odo[i] = 0;
    }
    false
}

enum SliceBuffer<'a> {
    Get(&'a mut [u8]),
    Set(&'a [u8]),
}

enum OrthoBuffer<'a> {
    Get(&'a mut [u8]),
    Set(&'a [u8]),
}

impl std::fmt::Debug for B2ndArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B2ndArray")
            .field("shape", &&self.shape[..self.ndim])
            .field("chunkshape", &&self.chunkshape[..self.ndim])
            .field("blockshape", &&self.blockshape[..self.ndim])
            .field("dtype", &self.dtype)
            .field("typesize", &self.schunk.typesize())
            .field("nchunks", &self.schunk.nchunks())
            .finish()
    }
}
