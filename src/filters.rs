//! Filter pipeline: slot bookkeeping, per-slot dispatch and the user filter
//! registry hooks, plus the prefilter/postfilter callback types.
//!
//! A pipeline holds up to [`BLOSC2_MAX_FILTERS`] `(id, meta)` slots, applied
//! in slot order on encode and reverse order on decode. Id 0 means the slot
//! is empty.

use std::sync::Arc;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::{bitshuffle, delta, shuffle, trunc_prec};

/// The `(ids, metas)` pair stored in chunk headers and parameter structs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pipeline {
    pub filters: [u8; BLOSC2_MAX_FILTERS],
    pub filters_meta: [u8; BLOSC2_MAX_FILTERS],
}

impl Default for Pipeline {
    fn default() -> Self {
        // Last slot carries the default byte shuffle, as the one-shot API does.
        let mut filters = [BLOSC_NOFILTER; BLOSC2_MAX_FILTERS];
        filters[BLOSC2_MAX_FILTERS - 1] = BLOSC_SHUFFLE;
        Pipeline { filters, filters_meta: [0; BLOSC2_MAX_FILTERS] }
    }
}

impl Pipeline {
    pub fn empty() -> Self {
        Pipeline { filters: [BLOSC_NOFILTER; BLOSC2_MAX_FILTERS], filters_meta: [0; BLOSC2_MAX_FILTERS] }
    }

    /// Single-filter pipeline in the last slot.
    pub fn single(filter: u8, meta: u8) -> Self {
        let mut p = Pipeline::empty();
        p.filters[BLOSC2_MAX_FILTERS - 1] = filter;
        p.filters_meta[BLOSC2_MAX_FILTERS - 1] = meta;
        p
    }

    /// Active `(id, meta)` slots in encode order.
    pub fn active(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.filters
            .iter()
            .zip(self.filters_meta.iter())
            .filter(|(&f, _)| f != BLOSC_NOFILTER)
            .map(|(&f, &m)| (f, m))
    }

    pub fn is_empty(&self) -> bool {
        self.filters.iter().all(|&f| f == BLOSC_NOFILTER)
    }

    pub fn contains(&self, id: u8) -> bool {
        self.filters.contains(&id)
    }

    /// Legacy one-bit-per-filter flags, used by the tuner's split decision
    /// and the short-form header bits.
    pub fn header_flags(&self) -> u8 {
        let mut flags = 0;
        for (f, _) in self.active() {
            match f {
                BLOSC_SHUFFLE => flags |= BLOSC_DOSHUFFLE,
                BLOSC_BITSHUFFLE => flags |= BLOSC_DOBITSHUFFLE,
                _ => {}
            }
        }
        flags
    }

    pub fn validate(&self, registry: &Registry) -> Result<()> {
        for (f, _) in self.active() {
            let known = f < BLOSC_LAST_FILTER || registry.has_filter(f);
            if !known {
                return Err(Error::FilterFailure { filter: f, reason: "unknown filter id" });
            }
        }
        Ok(())
    }
}

/// Per-block context handed to filter kernels that need more than bytes.
pub struct FilterRuntime<'a> {
    pub typesize: usize,
    /// The chunk's first (reference) block, for the delta filter.
    pub dref: &'a [u8],
    /// Byte offset of the current block inside the chunk payload.
    pub offset: usize,
}

/// Run one filter slot forward (compression direction).
pub fn forward(
    id: u8,
    meta: u8,
    rt: &FilterRuntime,
    src: &[u8],
    dest: &mut [u8],
    registry: &Registry,
) -> Result<()> {
    match id {
        BLOSC_SHUFFLE => shuffle::shuffle(rt.typesize, src, dest),
        BLOSC_BITSHUFFLE => bitshuffle::bitshuffle(rt.typesize, src, dest),
        BLOSC_DELTA => {
            delta::delta_encoder(rt.dref, rt.offset, rt.typesize, src, dest);
            Ok(())
        }
        BLOSC_TRUNC_PREC => trunc_prec::truncate_precision(meta, rt.typesize, src, dest),
        _ => registry.filter(id)?.run_forward(src, dest, meta, rt.typesize),
    }
}

/// Run one filter slot backward (decompression direction).
pub fn backward(
    id: u8,
    meta: u8,
    rt: &FilterRuntime,
    src: &[u8],
    dest: &mut [u8],
    registry: &Registry,
) -> Result<()> {
    match id {
        BLOSC_SHUFFLE => shuffle::unshuffle(rt.typesize, src, dest),
        BLOSC_BITSHUFFLE => bitshuffle::bitunshuffle(rt.typesize, src, dest),
        BLOSC_DELTA => {
            delta::delta_decoder(rt.dref, rt.offset, rt.typesize, src, dest);
            Ok(())
        }
        // Lossy truncation has no inverse; the bytes pass through.
        BLOSC_TRUNC_PREC => {
            dest[..src.len()].copy_from_slice(src);
            Ok(())
        }
        _ => registry.filter(id)?.run_backward(src, dest, meta, rt.typesize),
    }
}

type FilterKernel = Arc<dyn Fn(&[u8], &mut [u8], u8, usize) -> Result<()> + Send + Sync>;

/// A user-registered filter: `{id, encode, decode}` over
/// `(src, dst, meta, typesize)`.
#[derive(Clone)]
pub struct UserFilter {
    pub id: u8,
    pub name: String,
    forward: FilterKernel,
    backward: FilterKernel,
}

impl UserFilter {
    pub fn new(
        id: u8,
        name: impl Into<String>,
        forward: FilterKernel,
        backward: FilterKernel,
    ) -> Self {
        UserFilter { id, name: name.into(), forward, backward }
    }

    pub fn run_forward(&self, src: &[u8], dest: &mut [u8], meta: u8, typesize: usize) -> Result<()> {
        (self.forward)(src, dest, meta, typesize)
    }

    pub fn run_backward(&self, src: &[u8], dest: &mut [u8], meta: u8, typesize: usize) -> Result<()> {
        (self.backward)(src, dest, meta, typesize)
    }
}

/// Arguments handed to a prefilter, once per block, before the pipeline runs.
pub struct PrefilterParams<'a> {
    /// The block's slice of the caller's source buffer.
    pub input: &'a [u8],
    /// Block-sized slot the prefilter must fill.
    pub output: &'a mut [u8],
    pub nblock: usize,
    /// Byte offset of the block inside the chunk payload.
    pub offset: usize,
    pub typesize: usize,
    /// Index of the chunk inside its super-chunk, -1 outside one.
    pub nchunk: i64,
}

/// Arguments handed to a postfilter, once per block, after the pipeline ran.
pub struct PostfilterParams<'a> {
    /// The decompressed block.
    pub input: &'a [u8],
    /// Destination slot; usually rewritten in terms of `input`.
    pub output: &'a mut [u8],
    pub nblock: usize,
    pub offset: usize,
    pub typesize: usize,
    pub nchunk: i64,
}

pub type PrefilterFn = Arc<dyn Fn(&mut PrefilterParams) -> Result<()> + Send + Sync>;
pub type PostfilterFn = Arc<dyn Fn(&mut PostfilterParams) -> Result<()> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_is_shuffle() {
        let p = Pipeline::default();
        let active: Vec<_> = p.active().collect();
        assert_eq!(active, vec![(BLOSC_SHUFFLE, 0)]);
        assert_eq!(p.header_flags(), BLOSC_DOSHUFFLE);
    }

    #[test]
    fn forward_backward_roundtrip() {
        let reg = Registry::new();
        let src: Vec<u8> = (0..256).map(|i| i as u8).collect();
        let mut mid = vec![0u8; 256];
        let mut back = vec![0u8; 256];
        let rt = FilterRuntime { typesize: 4, dref: &[], offset: 0 };
        for id in [BLOSC_SHUFFLE, BLOSC_BITSHUFFLE, BLOSC_DELTA] {
            forward(id, 0, &rt, &src, &mut mid, &reg).unwrap();
            backward(id, 0, &rt, &mid, &mut back, &reg).unwrap();
            assert_eq!(src, back, "filter {id}");
        }
    }
}
