//! Truncate-precision filter (lossy).
//!
//! Zeroes the `k` low mantissa bits of IEEE 754 floats, `k` taken from the
//! filter meta byte. `k == 0` is a no-op. Only typesizes 4 and 8 make sense
//! here. There is no inverse: decoding passes the bytes through unchanged.

use crate::error::{Error, Result};

const BITS_MANTISSA_FLOAT: u8 = 23;
const BITS_MANTISSA_DOUBLE: u8 = 52;

fn truncate32(zeroed_bits: u8, src: &[u8], dest: &mut [u8]) -> Result<()> {
    // Keep at least one mantissa bit alive so NaN/Inf encodings survive.
    if zeroed_bits >= BITS_MANTISSA_FLOAT {
        return Err(Error::Data("precision reduction too large for f32"));
    }
    let mask = !((1u32 << zeroed_bits) - 1);
    for (s, d) in src.chunks_exact(4).zip(dest.chunks_exact_mut(4)) {
        let v = u32::from_ne_bytes(s.try_into().unwrap()) & mask;
        d.copy_from_slice(&v.to_ne_bytes());
    }
    Ok(())
}

fn truncate64(zeroed_bits: u8, src: &[u8], dest: &mut [u8]) -> Result<()> {
    if zeroed_bits >= BITS_MANTISSA_DOUBLE {
        return Err(Error::Data("precision reduction too large for f64"));
    }
    let mask = !((1u64 << zeroed_bits) - 1);
    for (s, d) in src.chunks_exact(8).zip(dest.chunks_exact_mut(8)) {
        let v = u64::from_ne_bytes(s.try_into().unwrap()) & mask;
        d.copy_from_slice(&v.to_ne_bytes());
    }
    Ok(())
}

/// Apply the truncation to `src`, writing `src.len()` bytes into `dest`.
pub fn truncate_precision(prec_bits: u8, typesize: usize, src: &[u8], dest: &mut [u8]) -> Result<()> {
    if dest.len() < src.len() {
        return Err(Error::WriteBuffer);
    }
    if prec_bits == 0 {
        dest[..src.len()].copy_from_slice(src);
        return Ok(());
    }
    match typesize {
        4 => truncate32(prec_bits, src, dest),
        8 => truncate64(prec_bits, src, dest),
        _ => Err(Error::Data("truncate-precision needs typesize 4 or 8")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_bits_is_identity() {
        let src: Vec<u8> = (0..64).collect();
        let mut out = vec![0u8; 64];
        truncate_precision(0, 4, &src, &mut out).unwrap();
        assert_eq!(src, out);
    }

    #[test]
    fn error_bounded_by_truncated_bits() {
        let values: Vec<f32> = (0..100).map(|i| 0.1 + i as f32 * 3.7).collect();
        let src: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut out = vec![0u8; src.len()];
        let prec = 10u8;
        truncate_precision(prec, 4, &src, &mut out).unwrap();
        for (i, chunk) in out.chunks_exact(4).enumerate() {
            let t = f32::from_ne_bytes(chunk.try_into().unwrap());
            let ulps = 1u32 << prec;
            let orig_bits = values[i].to_bits();
            assert!(orig_bits - t.to_bits() < ulps);
            assert!(t <= values[i]);
        }
    }

    #[test]
    fn rejects_full_mantissa() {
        let src = [0u8; 8];
        let mut out = [0u8; 8];
        assert!(truncate_precision(23, 4, &src, &mut out).is_err());
        assert!(truncate_precision(52, 8, &src, &mut out).is_err());
        assert!(truncate_precision(23, 8, &src, &mut out).is_ok());
    }

    #[test]
    fn odd_typesize_rejected() {
        let src = [0u8; 6];
        let mut out = [0u8; 6];
        assert!(truncate_precision(3, 2, &src, &mut out).is_err());
    }
}
