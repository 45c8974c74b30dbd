//! Format constants shared by the chunk engine, frames and the b2nd layer.

/* Version numbers */
pub const BLOSCR_VERSION_MAJOR: u8 = 0;
pub const BLOSCR_VERSION_MINOR: u8 = 1;
pub const BLOSCR_VERSION_STRING: &str = "0.1.0";

/// Chunk format version, stored in byte 0 of every chunk header.
pub const BLOSC2_VERSION_FORMAT: u8 = 5;

/// Frame format version, stored in the frame header.
pub const FRAME_FORMAT_VERSION: u8 = 2;

/// The maximum number of dimensions for b2nd arrays.
pub const B2ND_MAX_DIM: usize = 8;

// Chunk header geometry.
pub const BLOSC_MIN_HEADER_LENGTH: usize = 16;
pub const BLOSC_EXTENDED_HEADER_LENGTH: usize = 32;

/// Maximum per-chunk overhead added by compression. Equals the extended
/// header length for this format version.
pub const BLOSC2_MAX_OVERHEAD: usize = BLOSC_EXTENDED_HEADER_LENGTH;

/// Maximum source buffer size accepted for one chunk.
pub const BLOSC2_MAX_BUFFERSIZE: usize = i32::MAX as usize - BLOSC2_MAX_OVERHEAD;

/// Maximum typesize before a buffer is treated as an opaque byte stream.
pub const BLOSC_MAX_TYPESIZE: usize = u8::MAX as usize;

/// Minimum buffer size worth compressing.
pub const BLOSC_MIN_BUFFERSIZE: usize = 32;

/// Maximum number of streams a split block may produce.
pub const MAX_STREAMS: usize = 16;

// L1 and L2 cache sizes assumed by the tuner (typical values).
pub const L1: usize = 32 * 1024;
pub const L2: usize = 256 * 1024;

pub const BLOSC_MAX_BLOCKSIZE: usize = BLOSC2_MAX_BUFFERSIZE;

// Filter id ranges.
pub const BLOSC2_DEFINED_FILTERS_STOP: u8 = 31;
pub const BLOSC2_REGISTERED_FILTERS_START: u8 = 32;
pub const BLOSC2_REGISTERED_FILTERS_STOP: u8 = 159;
pub const BLOSC2_USER_FILTERS_START: u8 = 160;
pub const BLOSC2_USER_FILTERS_STOP: u8 = 255;

/// Number of slots in the filter pipeline.
pub const BLOSC2_MAX_FILTERS: usize = 6;

// Codes for the filters shipped with the library.
pub const BLOSC_NOFILTER: u8 = 0;
pub const BLOSC_SHUFFLE: u8 = 1;
pub const BLOSC_BITSHUFFLE: u8 = 2;
pub const BLOSC_DELTA: u8 = 3;
pub const BLOSC_TRUNC_PREC: u8 = 4;
pub const BLOSC_LAST_FILTER: u8 = 5;

// Bits of the chunk header flags byte (byte 2).
pub const BLOSC_DOSHUFFLE: u8 = 0x1;
pub const BLOSC_MEMCPYED: u8 = 0x2;
pub const BLOSC_DOBITSHUFFLE: u8 = 0x4;
pub const BLOSC_LITTLE_ENDIAN: u8 = 0x8;
pub const BLOSC_DONT_SPLIT: u8 = 0x10;
pub const BLOSC_EXTENDED_HEADER: u8 = 0x40;
pub const BLOSC_HIGH_CODEC: u8 = 0x80;

// Bits of the blosc2_flags byte (byte 31 of the extended header).
pub const BLOSC2_USEDICT: u8 = 0x1;
pub const BLOSC2_SPECIAL_SHIFT: u8 = 4;
pub const BLOSC2_SPECIAL_MASK: u8 = 0x7;

/// Maximum size for zstd compression dictionaries.
pub const BLOSC2_MAXDICTSIZE: usize = 128 * 1024;

// Codec id ranges.
pub const BLOSC2_DEFINED_CODECS_STOP: u8 = 31;
pub const BLOSC2_REGISTERED_CODECS_START: u8 = 32;
pub const BLOSC2_REGISTERED_CODECS_STOP: u8 = 159;
pub const BLOSC2_USER_CODECS_START: u8 = 160;
pub const BLOSC2_USER_CODECS_STOP: u8 = 255;

// Codes for the codecs shipped with the library. Id 0 is the historical
// BloscLZ slot: reserved, never produced or consumed by this implementation.
pub const BLOSC_BLOSCLZ: u8 = 0;
pub const BLOSC_LZ4: u8 = 1;
pub const BLOSC_LZ4HC: u8 = 2;
pub const BLOSC_SNAPPY: u8 = 3;
pub const BLOSC_ZLIB: u8 = 4;
pub const BLOSC_ZSTD: u8 = 5;
pub const BLOSC_LAST_CODEC: u8 = 6;

pub const BLOSC_LZ4_COMPNAME: &str = "lz4";
pub const BLOSC_LZ4HC_COMPNAME: &str = "lz4hc";
pub const BLOSC_SNAPPY_COMPNAME: &str = "snappy";
pub const BLOSC_ZLIB_COMPNAME: &str = "zlib";
pub const BLOSC_ZSTD_COMPNAME: &str = "zstd";

// Special chunk kinds (blosc2_flags bits 4..=6).
pub const BLOSC2_NO_SPECIAL: u8 = 0x0;
pub const BLOSC2_SPECIAL_ZERO: u8 = 0x1;
pub const BLOSC2_SPECIAL_NAN: u8 = 0x2;
pub const BLOSC2_SPECIAL_VALUE: u8 = 0x3;
pub const BLOSC2_SPECIAL_UNINIT: u8 = 0x4;
pub const BLOSC2_SPECIAL_LASTID: u8 = 0x4;

/// Maximum number of fixed metalayers in a super-chunk.
pub const BLOSC2_MAX_METALAYERS: usize = 16;
/// Maximum length of a metalayer name.
pub const BLOSC2_METALAYER_NAME_MAX: usize = 31;

// Stable negative error codes; `Error::code()` maps the taxonomy onto these.
pub const BLOSC2_ERROR_SUCCESS: i32 = 0;
pub const BLOSC2_ERROR_FAILURE: i32 = -1;
pub const BLOSC2_ERROR_DATA: i32 = -3;
pub const BLOSC2_ERROR_MEMORY_ALLOC: i32 = -4;
pub const BLOSC2_ERROR_READ_BUFFER: i32 = -5;
pub const BLOSC2_ERROR_WRITE_BUFFER: i32 = -6;
pub const BLOSC2_ERROR_CODEC_SUPPORT: i32 = -7;
pub const BLOSC2_ERROR_CODEC_PARAM: i32 = -8;
pub const BLOSC2_ERROR_CODEC_DICT: i32 = -9;
pub const BLOSC2_ERROR_VERSION_SUPPORT: i32 = -10;
pub const BLOSC2_ERROR_INVALID_HEADER: i32 = -11;
pub const BLOSC2_ERROR_INVALID_PARAM: i32 = -12;
pub const BLOSC2_ERROR_FILE_READ: i32 = -13;
pub const BLOSC2_ERROR_FILE_WRITE: i32 = -14;
pub const BLOSC2_ERROR_FILE_OPEN: i32 = -15;
pub const BLOSC2_ERROR_NOT_FOUND: i32 = -16;
pub const BLOSC2_ERROR_RUN_LENGTH: i32 = -17;
pub const BLOSC2_ERROR_FILTER_PIPELINE: i32 = -18;
pub const BLOSC2_ERROR_CHUNK_INSERT: i32 = -19;
pub const BLOSC2_ERROR_CHUNK_APPEND: i32 = -20;
pub const BLOSC2_ERROR_CHUNK_UPDATE: i32 = -21;
pub const BLOSC2_ERROR_2GB_LIMIT: i32 = -22;
pub const BLOSC2_ERROR_FRAME_TYPE: i32 = -24;
pub const BLOSC2_ERROR_FILE_TRUNCATE: i32 = -25;
pub const BLOSC2_ERROR_THREAD_CREATE: i32 = -26;
pub const BLOSC2_ERROR_POSTFILTER: i32 = -27;
pub const BLOSC2_ERROR_PLUGIN_IO: i32 = -30;
pub const BLOSC2_ERROR_FILE_REMOVE: i32 = -31;
pub const BLOSC2_ERROR_NULL_POINTER: i32 = -32;
pub const BLOSC2_ERROR_INVALID_INDEX: i32 = -33;
pub const BLOSC2_ERROR_METALAYER_NOT_FOUND: i32 = -34;
pub const BLOSC2_ERROR_MAX_BUFSIZE_EXCEEDED: i32 = -35;
