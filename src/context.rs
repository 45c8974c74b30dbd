//! Compression/decompression parameters and context lifecycle.
//!
//! A context resolves its parameters once, snapshots a registry handle and,
//! for `nthreads > 1`, eagerly builds the worker pool it owns. Each
//! compress/decompress call lives entirely inside one context; the only
//! cross-call state is the pool and the (single-use) block maskout.

use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::filters::{Pipeline, PostfilterFn, PrefilterFn};
use crate::registry::{self, SharedRegistry};
use crate::stune::SplitMode;
use crate::util;

fn default_nthreads() -> usize {
    util::env_usize("BLOSC_NTHREADS").filter(|&n| n >= 1).unwrap_or(1)
}

/// Compression parameters.
#[derive(Clone)]
pub struct CParams {
    pub compcode: u8,
    pub compcode_meta: u8,
    pub clevel: i32,
    pub typesize: usize,
    pub nthreads: usize,
    /// Requested blocksize; 0 lets the tuner choose.
    pub blocksize: usize,
    pub splitmode: SplitMode,
    pub pipeline: Pipeline,
    pub use_dict: bool,
    /// Trained dictionary for zstd-class codecs.
    pub dict: Option<Arc<Vec<u8>>>,
    /// Opaque per-codec parameter bytes.
    pub codec_params: Option<Arc<Vec<u8>>>,
    pub prefilter: Option<PrefilterFn>,
    pub tuner_id: u8,
}

impl Default for CParams {
    fn default() -> Self {
        CParams {
            compcode: BLOSC_LZ4,
            compcode_meta: 0,
            clevel: 5,
            typesize: 8,
            nthreads: default_nthreads(),
            blocksize: 0,
            splitmode: SplitMode::default(),
            pipeline: Pipeline::default(),
            use_dict: false,
            dict: None,
            codec_params: None,
            prefilter: None,
            tuner_id: 0,
        }
    }
}

impl std::fmt::Debug for CParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CParams")
            .field("compcode", &self.compcode)
            .field("clevel", &self.clevel)
            .field("typesize", &self.typesize)
            .field("nthreads", &self.nthreads)
            .field("blocksize", &self.blocksize)
            .field("splitmode", &self.splitmode)
            .field("pipeline", &self.pipeline)
            .field("use_dict", &self.use_dict)
            .finish_non_exhaustive()
    }
}

impl CParams {
    pub fn validate(&self) -> Result<()> {
        if self.typesize == 0 || self.typesize > BLOSC_MAX_TYPESIZE {
            return Err(Error::InvalidParam("typesize must be in 1..=255"));
        }
        if !(0..=9).contains(&self.clevel) {
            return Err(Error::InvalidParam("clevel must be in 0..=9"));
        }
        if self.nthreads == 0 {
            return Err(Error::InvalidParam("nthreads must be at least 1"));
        }
        if self.use_dict && self.dict.as_ref().is_some_and(|d| d.len() > BLOSC2_MAXDICTSIZE) {
            return Err(Error::InvalidParam("dictionary too large"));
        }
        Ok(())
    }
}

/// Decompression parameters.
#[derive(Clone)]
pub struct DParams {
    pub nthreads: usize,
    pub postfilter: Option<PostfilterFn>,
    pub dict: Option<Arc<Vec<u8>>>,
}

impl DParams {
    pub fn new() -> Self {
        DParams { nthreads: default_nthreads(), postfilter: None, dict: None }
    }
}

impl Default for DParams {
    fn default() -> Self {
        DParams::new()
    }
}

fn build_pool(nthreads: usize) -> Result<Option<Arc<ThreadPool>>> {
    if nthreads <= 1 {
        return Ok(None);
    }
    ThreadPoolBuilder::new()
        .num_threads(nthreads)
        .build()
        .map(|p| Some(Arc::new(p)))
        .map_err(|_| Error::NotSupported("could not spawn worker threads"))
}

/// Compression context: resolved parameters plus the worker pool.
pub struct CCtx {
    pub(crate) params: CParams,
    pub(crate) pool: Option<Arc<ThreadPool>>,
    pub(crate) registry: SharedRegistry,
    /// Chunk index reported to prefilters; set by super-chunk operations.
    pub(crate) nchunk: i64,
}

impl CCtx {
    /// Workers (if any) are spawned here, not at first use.
    pub fn new(params: CParams) -> Result<CCtx> {
        params.validate()?;
        let pool = build_pool(params.nthreads)?;
        Ok(CCtx { params, pool, registry: registry::global(), nchunk: -1 })
    }

    pub fn with_registry(params: CParams, registry: SharedRegistry) -> Result<CCtx> {
        params.validate()?;
        let pool = build_pool(params.nthreads)?;
        Ok(CCtx { params, pool, registry, nchunk: -1 })
    }

    pub fn params(&self) -> &CParams {
        &self.params
    }

    /// Resize the worker pool between calls.
    pub fn set_nthreads(&mut self, nthreads: usize) -> Result<()> {
        if nthreads == 0 {
            return Err(Error::InvalidParam("nthreads must be at least 1"));
        }
        if nthreads != self.params.nthreads {
            self.pool = build_pool(nthreads)?;
            self.params.nthreads = nthreads;
        }
        Ok(())
    }

    pub fn set_prefilter(&mut self, prefilter: Option<PrefilterFn>) {
        self.params.prefilter = prefilter;
    }

    pub(crate) fn set_nchunk(&mut self, nchunk: i64) {
        self.nchunk = nchunk;
    }
}

impl std::fmt::Debug for CCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CCtx").field("params", &self.params).finish_non_exhaustive()
    }
}

/// Decompression context.
pub struct DCtx {
    pub(crate) params: DParams,
    pub(crate) pool: Option<Arc<ThreadPool>>,
    pub(crate) registry: SharedRegistry,
    /// Blocks to skip on the next decompression; consumed by that call.
    pub(crate) maskout: Option<Vec<bool>>,
    pub(crate) nchunk: i64,
}

impl DCtx {
    pub fn new(params: DParams) -> Result<DCtx> {
        if params.nthreads == 0 {
            return Err(Error::InvalidParam("nthreads must be at least 1"));
        }
        let pool = build_pool(params.nthreads)?;
        Ok(DCtx { params, pool, registry: registry::global(), maskout: None, nchunk: -1 })
    }

    pub fn params(&self) -> &DParams {
        &self.params
    }

    pub fn set_nthreads(&mut self, nthreads: usize) -> Result<()> {
        if nthreads == 0 {
            return Err(Error::InvalidParam("nthreads must be at least 1"));
        }
        if nthreads != self.params.nthreads {
            self.pool = build_pool(nthreads)?;
            self.params.nthreads = nthreads;
        }
        Ok(())
    }

    /// Arm the block maskout for the next decompression call. `true` entries
    /// are skipped, leaving the destination untouched there.
    pub fn set_maskout(&mut self, maskout: Vec<bool>) {
        self.maskout = Some(maskout);
    }

    pub fn set_postfilter(&mut self, postfilter: Option<PostfilterFn>) {
        self.params.postfilter = postfilter;
    }

    pub(crate) fn set_nchunk(&mut self, nchunk: i64) {
        self.nchunk = nchunk;
    }
}

impl std::fmt::Debug for DCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DCtx").field("nthreads", &self.params.nthreads).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cparams_validation() {
        assert!(CParams::default().validate().is_ok());
        assert!(CParams { typesize: 0, ..Default::default() }.validate().is_err());
        assert!(CParams { typesize: 300, ..Default::default() }.validate().is_err());
        assert!(CParams { clevel: 10, ..Default::default() }.validate().is_err());
        assert!(CParams { nthreads: 0, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn set_nthreads_rebuilds_pool() {
        let mut ctx = CCtx::new(CParams { nthreads: 1, ..Default::default() }).unwrap();
        assert!(ctx.pool.is_none());
        ctx.set_nthreads(3).unwrap();
        assert_eq!(ctx.params.nthreads, 3);
        assert!(ctx.pool.is_some());
        ctx.set_nthreads(1).unwrap();
        assert!(ctx.pool.is_none());
    }
}
