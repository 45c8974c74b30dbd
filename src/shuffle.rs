//! Byte-transpose filter.
//!
//! For `n` elements of width `t`, byte `j` of element `i` lands at position
//! `j * n + i`. Any tail shorter than one element is copied verbatim, and the
//! inverse mirrors that, so the pair round-trips every `(t, len)` combination.

use crate::constants::BLOSC_MAX_TYPESIZE;
use crate::error::{Error, Result};

fn check_args(typesize: usize, src: &[u8], dest: &[u8]) -> Result<()> {
    if typesize == 0 || typesize > BLOSC_MAX_TYPESIZE {
        return Err(Error::InvalidParam("shuffle typesize out of range"));
    }
    if dest.len() < src.len() {
        return Err(Error::WriteBuffer);
    }
    Ok(())
}

/// Shuffle a block. `dest` receives exactly `src.len()` bytes.
pub fn shuffle(typesize: usize, src: &[u8], dest: &mut [u8]) -> Result<()> {
    check_args(typesize, src, dest)?;
    let blocksize = src.len();
    let neblock = blocksize / typesize;

    for j in 0..typesize {
        for i in 0..neblock {
            dest[j * neblock + i] = src[i * typesize + j];
        }
    }

    // Leftover bytes, not a whole element: plain copy.
    let tail = blocksize - blocksize % typesize;
    dest[tail..blocksize].copy_from_slice(&src[tail..blocksize]);
    Ok(())
}

/// Reverse of [`shuffle`].
pub fn unshuffle(typesize: usize, src: &[u8], dest: &mut [u8]) -> Result<()> {
    check_args(typesize, src, dest)?;
    let blocksize = src.len();
    let neblock = blocksize / typesize;

    for i in 0..neblock {
        for j in 0..typesize {
            dest[i * typesize + j] = src[j * neblock + i];
        }
    }

    let tail = blocksize - blocksize % typesize;
    dest[tail..blocksize].copy_from_slice(&src[tail..blocksize]);
    Ok(())
}
