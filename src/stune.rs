//! Default tuner: picks the working blocksize and the split decision from the
//! codec, compression level, typesize and cache-size assumptions.

use crate::constants::*;

/// Split policy for block streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SplitMode {
    AlwaysSplit = 1,
    NeverSplit = 2,
    AutoSplit = 3,
    /// Splits only for the codec+filter combinations the format has always
    /// split for, keeping output byte-compatible across versions.
    #[default]
    ForwardCompatSplit = 4,
}

impl SplitMode {
    pub fn from_u8(v: u8) -> SplitMode {
        match v {
            1 => SplitMode::AlwaysSplit,
            2 => SplitMode::NeverSplit,
            3 => SplitMode::AutoSplit,
            _ => SplitMode::ForwardCompatSplit,
        }
    }
}

/// Whether a codec is meant for high compression ratios. HCR codecs prefer
/// bigger blocks; they show a large overhead on small ones.
fn is_hcr(compcode: u8) -> bool {
    matches!(compcode, BLOSC_LZ4HC | BLOSC_ZLIB | BLOSC_ZSTD)
}

/// Conditions for splitting a block into typesize streams before the codec.
pub fn split_block(
    splitmode: SplitMode,
    compcode: u8,
    clevel: i32,
    typesize: usize,
    blocksize: usize,
    filter_flags: u8,
) -> bool {
    match splitmode {
        SplitMode::AlwaysSplit => return true,
        SplitMode::NeverSplit => return false,
        SplitMode::AutoSplit | SplitMode::ForwardCompatSplit => {}
    }

    // Fast codecs prefer to split, and low zstd levels do too...
    (matches!(compcode, BLOSC_LZ4 | BLOSC_BLOSCLZ) || (compcode == BLOSC_ZSTD && clevel <= 5))
        // ...but splitting harms the ratio too much without byte shuffle.
        && (filter_flags & BLOSC_DOSHUFFLE) != 0
        && typesize <= MAX_STREAMS
        && blocksize / typesize.max(1) >= BLOSC_MIN_BUFFERSIZE
}

/// Resolve the automatic blocksize for one chunk of `nbytes` source bytes.
/// A non-zero `user_blocksize` wins, clamped and typesize-aligned.
pub fn compute_blocksize(
    clevel: i32,
    typesize: usize,
    nbytes: usize,
    compcode: u8,
    user_blocksize: usize,
    splitmode: SplitMode,
    filter_flags: u8,
) -> usize {
    // Protection against very small buffers.
    if nbytes < typesize {
        return nbytes.max(1);
    }

    let mut blocksize = nbytes;
    let splitting = split_block(splitmode, compcode, clevel, typesize, blocksize, filter_flags);

    if user_blocksize != 0 {
        blocksize = user_blocksize;
    } else {
        if nbytes >= L1 {
            blocksize = L1;
            if is_hcr(compcode) {
                blocksize *= 2;
            }
            match clevel {
                0 => blocksize /= 4,
                1 => blocksize /= 2,
                2 => {}
                3 => blocksize *= 2,
                4 | 5 => blocksize *= 4,
                6..=8 => blocksize *= 8,
                _ => {
                    blocksize *= 8;
                    if is_hcr(compcode) {
                        blocksize *= 2;
                    }
                }
            }
        }

        // Blocksize for splittable codecs: must stay cache-friendly once
        // multiplied by typesize.
        if clevel > 0 && splitting {
            blocksize = match clevel {
                1..=3 => 32 * 1024,
                4..=6 => 64 * 1024,
                7 => 128 * 1024,
                8 => 256 * 1024,
                _ => 512 * 1024,
            };
            blocksize *= typesize;
            if blocksize > 4 * 1024 * 1024 {
                blocksize = 4 * 1024 * 1024;
            }
            if blocksize < 32 * 1024 {
                blocksize = 32 * 1024;
            }
        }
    }

    if blocksize > nbytes {
        blocksize = nbytes;
    }
    // The blocksize must absolutely be a multiple of the typesize.
    if blocksize > typesize {
        blocksize = blocksize / typesize * typesize;
    }
    blocksize.max(1)
}
