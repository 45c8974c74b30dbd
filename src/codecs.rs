//! Codec contract and the builtin codecs backed by their ecosystem crates.
//!
//! A codec compresses one stream of a block. `compress` returning `Ok(0)`
//! means "incompressible at this capacity" and makes the engine fall back to
//! verbatim storage; hard failures surface as errors.

use std::io::Write;
use std::sync::Arc;

use crate::constants::*;
use crate::error::{Error, Result};

/// Per-call view of codec-relevant state. Owned by the caller and passed
/// through, never stored by a codec.
pub struct CodecRuntime<'a> {
    pub typesize: usize,
    /// Trained dictionary for zstd-class codecs.
    pub dict: Option<&'a [u8]>,
    /// Opaque per-codec parameter bytes.
    pub params: Option<&'a [u8]>,
    /// Index of the chunk in its super-chunk, -1 outside one.
    pub nchunk: i64,
}

impl CodecRuntime<'_> {
    pub fn bare(typesize: usize) -> CodecRuntime<'static> {
        CodecRuntime { typesize, dict: None, params: None, nchunk: -1 }
    }
}

pub trait Codec: Send + Sync {
    /// Compress `src` into `dst`. `Ok(0)` flags incompressible input.
    fn compress(&self, src: &[u8], dst: &mut [u8], level: i32, meta: u8, rt: &CodecRuntime) -> Result<usize>;

    /// Decompress `src` into `dst`, returning the number of bytes written.
    fn decompress(&self, src: &[u8], dst: &mut [u8], meta: u8, rt: &CodecRuntime) -> Result<usize>;

    /// Whether [`Codec::get_cell`] works for blocks produced by this codec.
    fn supports_cells(&self) -> bool {
        false
    }

    /// Items per cell for cell-addressable codecs, `None` otherwise. The
    /// engine uses this to translate item ranges into cell indices.
    fn cell_nitems(&self, _meta: u8, _typesize: usize) -> Option<usize> {
        None
    }

    /// Materialize a single cell of a compressed block without decoding the
    /// rest. Only meaningful for codecs with cell-addressable layouts.
    fn get_cell(&self, _block: &[u8], _ncells: usize, _cell: usize, _dst: &mut [u8]) -> Result<usize> {
        Err(Error::NotSupported("codec has no cell access"))
    }
}

pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn compress(&self, src: &[u8], dst: &mut [u8], _level: i32, _meta: u8, _rt: &CodecRuntime) -> Result<usize> {
        // lz4_flex only errors on insufficient output room.
        Ok(lz4_flex::block::compress_into(src, dst).unwrap_or(0))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8], _meta: u8, _rt: &CodecRuntime) -> Result<usize> {
        lz4_flex::block::decompress_into(src, dst)
            .map_err(|_| Error::CodecFailure { codec: BLOSC_LZ4, reason: "lz4 stream decode failed" })
    }
}

pub struct SnappyCodec;

impl Codec for SnappyCodec {
    fn compress(&self, src: &[u8], dst: &mut [u8], _level: i32, _meta: u8, _rt: &CodecRuntime) -> Result<usize> {
        Ok(snap::raw::Encoder::new().compress(src, dst).unwrap_or(0))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8], _meta: u8, _rt: &CodecRuntime) -> Result<usize> {
        snap::raw::Decoder::new()
            .decompress(src, dst)
            .map_err(|_| Error::CodecFailure { codec: BLOSC_SNAPPY, reason: "snappy stream decode failed" })
    }
}

pub struct ZlibCodec;

impl Codec for ZlibCodec {
    fn compress(&self, src: &[u8], dst: &mut [u8], level: i32, _meta: u8, _rt: &CodecRuntime) -> Result<usize> {
        let level = level.clamp(0, 9) as u32;
        let cursor = std::io::Cursor::new(dst);
        let mut encoder = flate2::write::ZlibEncoder::new(cursor, flate2::Compression::new(level));
        if encoder.write_all(src).is_err() {
            return Ok(0);
        }
        match encoder.finish() {
            Ok(cursor) => Ok(cursor.position() as usize),
            Err(_) => Ok(0),
        }
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8], _meta: u8, _rt: &CodecRuntime) -> Result<usize> {
        let mut decoder = flate2::read::ZlibDecoder::new(src);
        let mut writer = std::io::Cursor::new(dst);
        std::io::copy(&mut decoder, &mut writer)
            .map(|n| n as usize)
            .map_err(|_| Error::CodecFailure { codec: BLOSC_ZLIB, reason: "zlib stream decode failed" })
    }
}

pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn compress(&self, src: &[u8], dst: &mut [u8], level: i32, _meta: u8, rt: &CodecRuntime) -> Result<usize> {
        let result = match rt.dict {
            Some(dict) => zstd::bulk::Compressor::with_dictionary(level, dict)
                .and_then(|mut c| c.compress_to_buffer(src, dst)),
            None => zstd::bulk::Compressor::new(level).and_then(|mut c| c.compress_to_buffer(src, dst)),
        };
        Ok(result.unwrap_or(0))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8], _meta: u8, rt: &CodecRuntime) -> Result<usize> {
        let result = match rt.dict {
            Some(dict) => zstd::bulk::Decompressor::with_dictionary(dict)
                .and_then(|mut d| d.decompress_to_buffer(src, dst)),
            None => zstd::bulk::Decompressor::new().and_then(|mut d| d.decompress_to_buffer(src, dst)),
        };
        result.map_err(|_| Error::CodecFailure { codec: BLOSC_ZSTD, reason: "zstd stream decode failed" })
    }
}

/// Resolve a builtin codec id. Id 0 (the historical BloscLZ slot) and unknown
/// defined ids are rejected; LZ4HC shares the LZ4 wire format and engine.
pub fn builtin(id: u8) -> Result<Arc<dyn Codec>> {
    match id {
        BLOSC_LZ4 | BLOSC_LZ4HC => Ok(Arc::new(Lz4Codec)),
        BLOSC_SNAPPY => Ok(Arc::new(SnappyCodec)),
        BLOSC_ZLIB => Ok(Arc::new(ZlibCodec)),
        BLOSC_ZSTD => Ok(Arc::new(ZstdCodec)),
        _ => Err(Error::CodecFailure { codec: id, reason: "codec not shipped with this build" }),
    }
}

pub fn compname_to_compcode(name: &str) -> Result<u8> {
    match name {
        BLOSC_LZ4_COMPNAME => Ok(BLOSC_LZ4),
        BLOSC_LZ4HC_COMPNAME => Ok(BLOSC_LZ4HC),
        BLOSC_SNAPPY_COMPNAME => Ok(BLOSC_SNAPPY),
        BLOSC_ZLIB_COMPNAME => Ok(BLOSC_ZLIB),
        BLOSC_ZSTD_COMPNAME => Ok(BLOSC_ZSTD),
        _ => Err(Error::InvalidParam("unknown compressor name")),
    }
}

pub fn compcode_to_compname(code: u8) -> Result<&'static str> {
    match code {
        BLOSC_LZ4 => Ok(BLOSC_LZ4_COMPNAME),
        BLOSC_LZ4HC => Ok(BLOSC_LZ4HC_COMPNAME),
        BLOSC_SNAPPY => Ok(BLOSC_SNAPPY_COMPNAME),
        BLOSC_ZLIB => Ok(BLOSC_ZLIB_COMPNAME),
        BLOSC_ZSTD => Ok(BLOSC_ZSTD_COMPNAME),
        _ => Err(Error::InvalidParam("unknown compressor code")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: &dyn Codec, id: u8) {
        let src: Vec<u8> = (0..4096).map(|i| (i % 17) as u8).collect();
        let mut packed = vec![0u8; 8192];
        let rt = CodecRuntime::bare(1);
        let n = codec.compress(&src, &mut packed, 5, 0, &rt).unwrap();
        assert!(n > 0 && n < src.len(), "codec {id} did not compress");
        let mut back = vec![0u8; src.len()];
        let m = codec.decompress(&packed[..n], &mut back, 0, &rt).unwrap();
        assert_eq!(m, src.len());
        assert_eq!(src, back);
    }

    #[test]
    fn builtin_roundtrips() {
        roundtrip(&Lz4Codec, BLOSC_LZ4);
        roundtrip(&SnappyCodec, BLOSC_SNAPPY);
        roundtrip(&ZlibCodec, BLOSC_ZLIB);
        roundtrip(&ZstdCodec, BLOSC_ZSTD);
    }

    #[test]
    fn incompressible_reports_zero() {
        // Room far below any representable compressed size.
        let src: Vec<u8> = (0..1024).map(|i| (i * 131 % 251) as u8).collect();
        let mut tiny = [0u8; 8];
        let rt = CodecRuntime::bare(1);
        assert_eq!(Lz4Codec.compress(&src, &mut tiny, 5, 0, &rt).unwrap(), 0);
        assert_eq!(SnappyCodec.compress(&src, &mut tiny, 5, 0, &rt).unwrap(), 0);
    }

    #[test]
    fn blosclz_slot_rejected() {
        assert!(builtin(BLOSC_BLOSCLZ).is_err());
    }

    #[test]
    fn zstd_dictionary_roundtrip() {
        let dict: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        let src: Vec<u8> = dict.iter().cycle().take(4096).copied().collect();
        let rt = CodecRuntime { typesize: 1, dict: Some(&dict), params: None, nchunk: -1 };
        let mut packed = vec![0u8; 8192];
        let n = ZstdCodec.compress(&src, &mut packed, 3, 0, &rt).unwrap();
        assert!(n > 0);
        let mut back = vec![0u8; src.len()];
        let m = ZstdCodec.decompress(&packed[..n], &mut back, 0, &rt).unwrap();
        assert_eq!(m, src.len());
        assert_eq!(src, back);
    }
}
