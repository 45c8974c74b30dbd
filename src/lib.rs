//! Blocked, shuffling, typed compression.
//!
//! The crate stacks three subsystems:
//!
//! * a chunk engine ([`compress`], [`decompress`], [`getitem`] and their
//!   `_ctx` variants) running a filter pipeline and a pluggable codec over
//!   fixed-size blocks, dispatched in parallel;
//! * the super-chunk container ([`SChunk`]): an editable sequence of chunks
//!   with metadata layers, serializable as a contiguous or sparse frame;
//! * the n-dimensional overlay ([`B2ndArray`]): shape/chunk/block geometry,
//!   slicing, resizing and orthogonal selection on top of a super-chunk.

pub mod b2nd;
pub mod b2nd_utils;
pub mod bitshuffle;
pub mod blosc2;
pub mod codecs;
pub mod constants;
pub mod context;
pub mod delta;
pub mod error;
pub mod filters;
pub mod frame;
pub mod registry;
pub mod schunk;
pub mod sframe;
pub mod shuffle;
pub mod stdio;
pub mod stune;
pub mod trunc_prec;
pub mod util;

pub use b2nd::{B2ndArray, B2ndParams};
pub use blosc2::{
    cbuffer_metainfo, cbuffer_sizes, cbuffer_validate, chunk_nans, chunk_repeatval, chunk_uninit, chunk_zeros,
    compress, compress_ctx, decompress, decompress_ctx, getitem, getitem_ctx, ChunkInfo, BITSHUFFLE, NOSHUFFLE,
    SHUFFLE,
};
pub use codecs::{Codec, CodecRuntime};
pub use constants::*;
pub use context::{CCtx, CParams, DCtx, DParams};
pub use error::{Error, Result};
pub use filters::{Pipeline, PostfilterFn, PostfilterParams, PrefilterFn, PrefilterParams, UserFilter};
pub use registry::{Registry, SharedRegistry};
pub use schunk::{MetaLayer, SChunk, SpecialValue, Storage};
pub use stdio::{register_io_backend, IoBackend, IoHandle, OpenMode};
pub use stune::SplitMode;
