//! Sparse frame: a directory holding the frame's metadata image
//! (`chunks.b2frame`) plus one numbered file per stored chunk. Single-chunk
//! operations touch single files; special chunks live only in the offsets
//! table as sentinels.

use crate::blosc2::ChunkInfo;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::frame::{
    self, assemble_schunk, build_header, build_offsets, compress_offsets, decompress_offsets, meta_image,
    parse_header, read_sections, sentinel_nbytes, storage_from_header, FRAME_MAGIC, TRAILER_FIXED_LEN,
};
use crate::schunk::{slot_bytes, ChunkSlot, SChunk};
use crate::stdio::{self, FrameLock, OpenMode};

const INDEX_NAME: &str = "chunks.b2frame";

fn index_path(dir: &str) -> String {
    format!("{dir}/{INDEX_NAME}")
}

fn chunk_path(dir: &str, index: u64) -> String {
    format!("{dir}/{index:08}.chunk")
}

/// Read one numbered chunk file whole.
pub(crate) fn read_chunk_file(urlpath: &str, index: u64) -> Result<Vec<u8>> {
    let (backend, dir) = stdio::resolve(urlpath)?;
    let mut handle = backend.open(&chunk_path(&dir, index), OpenMode::Read)?;
    let len = handle.size()? as usize;
    handle.read_at(0, len)
}

/// The metadata image with the trailer appended and the (sparse) header
/// patched in. Offsets for stored chunks carry `position + 1`.
fn index_image(schunk: &SChunk) -> Result<Vec<u8>> {
    let mut image = meta_image(schunk)?;
    // Positions, not byte offsets: sentinel entries keep their kind encoding.
    let (mut offsets, _) = build_offsets(schunk, 0)?;
    let mut position = 0i64;
    for (i, slot) in schunk.chunks.iter().enumerate() {
        if !matches!(slot, ChunkSlot::Special { repeat: None, .. }) {
            offsets[i] = position + 1;
        }
        position += 1;
    }
    let offsets_chunk = compress_offsets(&offsets)?;
    let trailer_len = offsets_chunk.len() + TRAILER_FIXED_LEN;
    image.extend_from_slice(&offsets_chunk);
    image.extend_from_slice(&(trailer_len as u32).to_le_bytes());
    image.extend_from_slice(FRAME_MAGIC);

    let checksum = if schunk.storage.checksum { frame::content_checksum_of(schunk)? } else { 0 };
    let header = build_header(schunk, image.len(), true, checksum);
    image[..frame::FRAME_HEADER_LEN].copy_from_slice(&header);
    Ok(image)
}

/// Write the whole sparse frame: recreate the directory, one file per stored
/// chunk (named by chunk position), then the metadata image.
pub(crate) fn save(schunk: &SChunk, urlpath: &str) -> Result<()> {
    let _lock = FrameLock::acquire(urlpath)?;
    let (backend, dir) = stdio::resolve(urlpath)?;
    if backend.exists(&dir) {
        backend.destroy(&dir)?;
    }
    backend.create_dir(&dir)?;
    for (i, slot) in schunk.chunks.iter().enumerate() {
        if matches!(slot, ChunkSlot::Special { repeat: None, .. }) {
            continue;
        }
        let bytes = slot_bytes(slot, &schunk.frame_buf, &schunk.storage, schunk.typesize)?;
        let mut handle = backend.open(&chunk_path(&dir, i as u64), OpenMode::Write)?;
        handle.write_at(0, &bytes)?;
        handle.truncate(bytes.len() as u64)?;
    }
    let image = index_image(schunk)?;
    let mut handle = backend.open(&index_path(&dir), OpenMode::Write)?;
    handle.write_at(0, &image)?;
    handle.truncate(image.len() as u64)?;
    Ok(())
}

/// Append the last chunk as its own file and refresh the metadata image.
pub(crate) fn append_last_chunk(schunk: &mut SChunk, urlpath: &str) -> Result<()> {
    let _lock = FrameLock::acquire(urlpath)?;
    let (backend, dir) = stdio::resolve(urlpath)?;
    if !backend.is_dir(&dir) {
        return save(schunk, urlpath);
    }
    let nchunk = schunk.nchunks() - 1;
    let appended = match &schunk.chunks[nchunk] {
        ChunkSlot::Special { repeat: None, .. } => None,
        slot => {
            let was_owned = matches!(slot, ChunkSlot::Owned(_));
            Some((slot_bytes(slot, &schunk.frame_buf, &schunk.storage, schunk.typesize)?.into_owned(), was_owned))
        }
    };
    if let Some((bytes, was_owned)) = appended {
        let mut handle = backend.open(&chunk_path(&dir, nchunk as u64), OpenMode::Write)?;
        handle.write_at(0, &bytes)?;
        handle.truncate(bytes.len() as u64)?;
        if was_owned {
            schunk.chunks[nchunk] = ChunkSlot::SparseFile { index: nchunk as u64, cbytes: bytes.len() };
        }
    }
    let image = index_image(schunk)?;
    let mut handle = backend.open(&index_path(&dir), OpenMode::Write)?;
    handle.write_at(0, &image)?;
    handle.truncate(image.len() as u64)?;
    Ok(())
}

/// Open a sparse frame directory; chunk files are read on demand.
pub(crate) fn open(urlpath: &str) -> Result<SChunk> {
    let (backend, dir) = stdio::resolve(urlpath)?;
    let mut handle = backend.open(&index_path(&dir), OpenMode::Read)?;
    let len = handle.size()? as usize;
    let image = handle.read_at(0, len)?;

    let header = parse_header(&image)?;
    if header.frame_len as usize != image.len() {
        return Err(Error::Corruption("index image length field does not match the file"));
    }
    if image.len() < frame::FRAME_HEADER_LEN + TRAILER_FIXED_LEN || &image[image.len() - 8..] != FRAME_MAGIC {
        return Err(Error::Corruption("bad sparse index trailer"));
    }
    let trailer_len = u32::from_le_bytes(image[image.len() - 12..image.len() - 8].try_into().unwrap()) as usize;
    if trailer_len < TRAILER_FIXED_LEN || trailer_len > image.len() - frame::FRAME_HEADER_LEN {
        return Err(Error::Corruption("impossible trailer length"));
    }
    let offsets_chunk = &image[image.len() - trailer_len..image.len() - TRAILER_FIXED_LEN];
    let offsets = decompress_offsets(offsets_chunk)?;
    if offsets.len() as i64 != header.nchunks {
        return Err(Error::Corruption("offsets table disagrees with nchunks"));
    }
    if header.flags & frame::FRAME_SPARSE == 0 {
        return Err(Error::Corruption("index image is not flagged sparse"));
    }
    let (meta, vlmeta, _) = read_sections(&image, header.flags & frame::FRAME_HAS_VLMETA != 0)?;

    let mut slots = Vec::with_capacity(offsets.len());
    for (i, &entry) in offsets.iter().enumerate() {
        if entry > 0 {
            let index = (entry - 1) as u64;
            let bytes = read_chunk_file(urlpath, index)?;
            let info = ChunkInfo::parse(&bytes)?;
            if info.typesize != header.typesize {
                return Err(Error::Corruption("chunk typesize disagrees with the frame"));
            }
            let slot = match info.special() {
                BLOSC2_SPECIAL_VALUE => ChunkSlot::Special {
                    kind: BLOSC2_SPECIAL_VALUE,
                    nbytes: info.nbytes,
                    repeat: Some(
                        bytes[BLOSC_EXTENDED_HEADER_LENGTH..BLOSC_EXTENDED_HEADER_LENGTH + info.typesize].to_vec(),
                    ),
                },
                BLOSC2_NO_SPECIAL => ChunkSlot::SparseFile { index, cbytes: info.cbytes },
                kind => ChunkSlot::Special { kind, nbytes: info.nbytes, repeat: None },
            };
            slots.push(slot);
        } else {
            let kind = (-entry) as u8;
            if kind == 0 || kind > BLOSC2_SPECIAL_LASTID || kind == BLOSC2_SPECIAL_VALUE {
                return Err(Error::Corruption("bad special sentinel in offsets table"));
            }
            slots.push(ChunkSlot::Special { kind, nbytes: sentinel_nbytes(&header, i)?, repeat: None });
        }
    }

    let mut storage = storage_from_header(&header);
    storage.urlpath = Some(urlpath.to_string());
    storage.contiguous = false;
    let has_checksum = header.flags & frame::FRAME_HAS_CHECKSUM != 0;
    let expected = header.checksum;
    let schunk = assemble_schunk(header, meta, vlmeta, slots, storage, None)?;
    if has_checksum {
        frame::verify_checksum_of(&schunk, expected)?;
    }
    Ok(schunk)
}
