//! Codec and filter registries.
//!
//! Builtins are dispatched statically; registered-official and user-defined
//! ids live in a [`Registry`]. Contexts snapshot a shared registry handle at
//! creation, and a process-wide default registry exists for the one-shot API.
//! Frames do not embed codec names, so a codec registered after a frame was
//! written must decode with the original behavior.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::codecs::{self, Codec};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::filters::UserFilter;

/// A registered codec descriptor: `{id, name, implementation}`.
#[derive(Clone)]
pub struct CodecEntry {
    pub id: u8,
    pub name: String,
    pub codec: Arc<dyn Codec>,
}

#[derive(Default)]
pub struct Registry {
    codecs: HashMap<u8, CodecEntry>,
    filters: HashMap<u8, UserFilter>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a codec under a registered-official or user id.
    pub fn register_codec(&mut self, id: u8, name: impl Into<String>, codec: Arc<dyn Codec>) -> Result<()> {
        if id <= BLOSC2_DEFINED_CODECS_STOP {
            return Err(Error::InvalidParam("codec id collides with the builtin range"));
        }
        if self.codecs.contains_key(&id) {
            return Err(Error::InvalidParam("codec id already registered"));
        }
        self.codecs.insert(id, CodecEntry { id, name: name.into(), codec });
        Ok(())
    }

    pub fn register_filter(&mut self, filter: UserFilter) -> Result<()> {
        if filter.id <= BLOSC2_DEFINED_FILTERS_STOP {
            return Err(Error::InvalidParam("filter id collides with the builtin range"));
        }
        if self.filters.contains_key(&filter.id) {
            return Err(Error::InvalidParam("filter id already registered"));
        }
        self.filters.insert(filter.id, filter);
        Ok(())
    }

    /// Resolve any codec id, builtin or registered.
    pub fn codec(&self, id: u8) -> Result<Arc<dyn Codec>> {
        if id < BLOSC_LAST_CODEC {
            return codecs::builtin(id);
        }
        self.codecs
            .get(&id)
            .map(|e| e.codec.clone())
            .ok_or(Error::CodecFailure { codec: id, reason: "codec id not registered" })
    }

    pub fn has_codec(&self, id: u8) -> bool {
        id < BLOSC_LAST_CODEC || self.codecs.contains_key(&id)
    }

    pub fn filter(&self, id: u8) -> Result<&UserFilter> {
        self.filters
            .get(&id)
            .ok_or(Error::FilterFailure { filter: id, reason: "filter id not registered" })
    }

    pub fn has_filter(&self, id: u8) -> bool {
        self.filters.contains_key(&id)
    }
}

/// Shareable registry handle, as snapshotted by contexts.
pub type SharedRegistry = Arc<RwLock<Registry>>;

/// The process-wide default registry.
pub fn global() -> SharedRegistry {
    static GLOBAL: OnceLock<SharedRegistry> = OnceLock::new();
    GLOBAL.get_or_init(|| Arc::new(RwLock::new(Registry::new()))).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::CodecRuntime;

    struct NullCodec;
    impl Codec for NullCodec {
        fn compress(&self, src: &[u8], dst: &mut [u8], _l: i32, _m: u8, _rt: &CodecRuntime) -> Result<usize> {
            if dst.len() < src.len() {
                return Ok(0);
            }
            dst[..src.len()].copy_from_slice(src);
            Ok(src.len())
        }
        fn decompress(&self, src: &[u8], dst: &mut [u8], _m: u8, _rt: &CodecRuntime) -> Result<usize> {
            dst[..src.len()].copy_from_slice(src);
            Ok(src.len())
        }
    }

    #[test]
    fn user_codec_registration() {
        let mut reg = Registry::new();
        reg.register_codec(BLOSC2_USER_CODECS_START, "null", Arc::new(NullCodec)).unwrap();
        assert!(reg.has_codec(BLOSC2_USER_CODECS_START));
        // Collisions and builtin-range ids are rejected.
        assert!(reg.register_codec(BLOSC2_USER_CODECS_START, "null2", Arc::new(NullCodec)).is_err());
        assert!(reg.register_codec(BLOSC_ZSTD, "evil", Arc::new(NullCodec)).is_err());
    }

    #[test]
    fn builtins_resolve_without_registration() {
        let reg = Registry::new();
        assert!(reg.codec(BLOSC_LZ4).is_ok());
        assert!(reg.codec(BLOSC_ZSTD).is_ok());
        assert!(reg.codec(200).is_err());
    }
}
