//! Low-level byte utilities: little-endian field access, the msgpack-style
//! primitives used by the b2nd metalayer, checksums and environment probing.

use crate::error::{Error, Result};

/// Read a little-endian i32 field.
#[inline]
pub fn sw32(buf: &[u8], offset: usize) -> Result<i32> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or(Error::ReadBuffer)?;
    Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Read a little-endian i64 field.
#[inline]
pub fn sw64(buf: &[u8], offset: usize) -> Result<i64> {
    let bytes = buf
        .get(offset..offset + 8)
        .ok_or(Error::ReadBuffer)?;
    Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Store a little-endian i32 field.
#[inline]
pub fn st32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Store a little-endian i64 field.
#[inline]
pub fn st64(buf: &mut [u8], offset: usize, value: i64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn xxh32(data: &[u8], seed: u32) -> u32 {
    xxhash_rust::xxh32::xxh32(data, seed)
}

/// Integer environment variable, `None` when unset or unparsable.
pub fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

pub fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some()
}

/// Diagnostics level from `BLOSC_WARN` (0 = silent).
pub fn diag_level() -> usize {
    env_usize("BLOSC_WARN").unwrap_or(0)
}

macro_rules! trace_error {
    ($($arg:tt)*) => {
        if $crate::util::diag_level() >= 1 {
            eprintln!("[bloscr error] {}", format_args!($($arg)*));
        }
    };
}

macro_rules! trace_warn {
    ($($arg:tt)*) => {
        if $crate::util::diag_level() >= 2 {
            eprintln!("[bloscr warn] {}", format_args!($($arg)*));
        }
    };
}

pub(crate) use trace_error;
pub(crate) use trace_warn;

// msgpack-style primitives. Only the small subset the b2nd metalayer needs:
// fixarray headers, positive fixints, int32/int64 and str32. Integer payloads
// are big-endian, as msgpack mandates.

pub const MSGPACK_FIXARRAY: u8 = 0x90;
pub const MSGPACK_INT32: u8 = 0xd2;
pub const MSGPACK_INT64: u8 = 0xd3;
pub const MSGPACK_STR32: u8 = 0xdb;

pub fn mp_push_fixarray(out: &mut Vec<u8>, n: u8) {
    debug_assert!(n < 16);
    out.push(MSGPACK_FIXARRAY | n);
}

pub fn mp_push_i32(out: &mut Vec<u8>, value: i32) {
    out.push(MSGPACK_INT32);
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn mp_push_i64(out: &mut Vec<u8>, value: i64) {
    out.push(MSGPACK_INT64);
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn mp_push_str32(out: &mut Vec<u8>, s: &str) {
    out.push(MSGPACK_STR32);
    out.extend_from_slice(&(s.len() as i32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Cursor over a msgpack-framed byte run.
pub struct MpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        MpReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(Error::Corruption("truncated msgpack run"))?;
        self.pos += n;
        Ok(bytes)
    }

    pub fn fixarray(&mut self) -> Result<u8> {
        let b = self.take(1)?[0];
        if b & 0xf0 != MSGPACK_FIXARRAY {
            return Err(Error::Corruption("expected msgpack fixarray"));
        }
        Ok(b & 0x0f)
    }

    /// A 7-bit positive fixint.
    pub fn fixint(&mut self) -> Result<u8> {
        let b = self.take(1)?[0];
        if b & 0x80 != 0 {
            return Err(Error::Corruption("expected msgpack fixint"));
        }
        Ok(b)
    }

    pub fn i32(&mut self) -> Result<i32> {
        if self.take(1)?[0] != MSGPACK_INT32 {
            return Err(Error::Corruption("expected msgpack int32"));
        }
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64> {
        if self.take(1)?[0] != MSGPACK_INT64 {
            return Err(Error::Corruption("expected msgpack int64"));
        }
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn str32(&mut self) -> Result<&'a str> {
        if self.take(1)?[0] != MSGPACK_STR32 {
            return Err(Error::Corruption("expected msgpack str32"));
        }
        let len = i32::from_be_bytes(self.take(4)?.try_into().unwrap());
        if len < 0 {
            return Err(Error::Corruption("negative msgpack string length"));
        }
        std::str::from_utf8(self.take(len as usize)?)
            .map_err(|_| Error::Corruption("metalayer string is not utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_field_roundtrip() {
        let mut buf = [0u8; 16];
        st32(&mut buf, 4, -77);
        st64(&mut buf, 8, 1 << 40);
        assert_eq!(sw32(&buf, 4).unwrap(), -77);
        assert_eq!(sw64(&buf, 8).unwrap(), 1 << 40);
        assert!(sw32(&buf, 14).is_err());
    }

    #[test]
    fn msgpack_roundtrip() {
        let mut out = Vec::new();
        mp_push_fixarray(&mut out, 3);
        mp_push_i64(&mut out, -9);
        mp_push_i32(&mut out, 1234);
        mp_push_str32(&mut out, "|u1");

        let mut r = MpReader::new(&out);
        assert_eq!(r.fixarray().unwrap(), 3);
        assert_eq!(r.i64().unwrap(), -9);
        assert_eq!(r.i32().unwrap(), 1234);
        assert_eq!(r.str32().unwrap(), "|u1");
    }
}
