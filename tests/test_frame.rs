//! Frame round-trips: in-memory, contiguous files, sparse directories,
//! checksums and the metadata sections.

use bloscr::{CParams, SChunk, SpecialValue, Storage};
use tempfile::tempdir;

fn storage(typesize: usize) -> Storage {
    Storage { cparams: CParams { typesize, ..Default::default() }, ..Default::default() }
}

fn sample_schunk() -> SChunk {
    let mut schunk = SChunk::new(storage(4)).unwrap();
    for k in 0..3u8 {
        let buf: Vec<u8> = (0..4096).map(|i| (i as u8).wrapping_add(k)).collect();
        schunk.append_buffer(&buf).unwrap();
    }
    schunk
}

fn assert_same_payload(a: &mut SChunk, b: &mut SChunk) {
    assert_eq!(a.nchunks(), b.nchunks());
    assert_eq!(a.nbytes(), b.nbytes());
    for i in 0..a.nchunks() {
        let n = a.chunk_nbytes(i).unwrap();
        let mut out_a = vec![0u8; n];
        let mut out_b = vec![1u8; n];
        a.decompress_chunk(i, &mut out_a).unwrap();
        b.decompress_chunk(i, &mut out_b).unwrap();
        assert_eq!(out_a, out_b, "chunk {i}");
    }
}

#[test]
fn buffer_roundtrip_is_byte_stable() {
    let schunk = sample_schunk();
    let frame = schunk.to_buffer().unwrap();
    let copy = SChunk::from_buffer(&frame).unwrap();
    let frame2 = copy.to_buffer().unwrap();
    assert_eq!(frame, frame2);
}

#[test]
fn buffer_roundtrip_payload() {
    let mut schunk = sample_schunk();
    schunk.meta_add("name", b"three-buffers").unwrap();
    schunk.vlmeta_add("notes", b"variable length metadata, compressed in the frame").unwrap();

    let frame = schunk.to_buffer().unwrap();
    let mut copy = SChunk::from_buffer(&frame).unwrap();
    assert_same_payload(&mut schunk, &mut copy);
    assert_eq!(copy.meta_get("name").unwrap(), b"three-buffers");
    assert_eq!(copy.vlmeta_get("notes").unwrap(), b"variable length metadata, compressed in the frame");

    let mut aliased = SChunk::from_buffer_owned(frame).unwrap();
    assert_same_payload(&mut schunk, &mut aliased);
}

#[test]
fn special_chunks_ride_the_offsets_table() {
    let mut schunk = SChunk::new(storage(4)).unwrap();
    schunk.append_buffer(&vec![7u8; 8192]).unwrap();
    schunk.fill_special(4096, SpecialValue::Zero, 8192).unwrap();
    schunk.fill_special(2048, SpecialValue::Value(vec![1, 2, 3, 4]), 8192).unwrap();

    let frame = schunk.to_buffer().unwrap();
    let mut copy = SChunk::from_buffer(&frame).unwrap();
    assert_same_payload(&mut schunk, &mut copy);

    // Zero chunks take no body space: the frame stays close to one chunk.
    let single = {
        let mut s = SChunk::new(storage(4)).unwrap();
        s.append_buffer(&vec![7u8; 8192]).unwrap();
        s.to_buffer().unwrap().len()
    };
    assert!(frame.len() < single + 256, "sentinels should not grow the frame much");
}

#[test]
fn empty_schunk_roundtrip() {
    let schunk = SChunk::new(storage(8)).unwrap();
    let frame = schunk.to_buffer().unwrap();
    let copy = SChunk::from_buffer(&frame).unwrap();
    assert_eq!(copy.nchunks(), 0);
    assert_eq!(copy.typesize(), 8);
}

#[test]
fn corrupted_frames_are_rejected() {
    let schunk = sample_schunk();
    let frame = schunk.to_buffer().unwrap();

    let mut bad = frame.clone();
    bad[0] = b'X';
    assert!(SChunk::from_buffer(&bad).is_err());

    // Truncation.
    assert!(SChunk::from_buffer(&frame[..frame.len() - 4]).is_err());

    // Future version.
    let mut future = frame.clone();
    future[8] = 99;
    assert!(SChunk::from_buffer(&future).is_err());
}

#[test]
fn checksum_catches_bit_rot() {
    let mut st = storage(4);
    st.checksum = true;
    let mut schunk = SChunk::new(st).unwrap();
    schunk.append_buffer(&vec![5u8; 4096]).unwrap();
    let frame = schunk.to_buffer().unwrap();
    assert!(SChunk::from_buffer(&frame).is_ok());

    // Flip one payload byte behind the header sections.
    let mut rotten = frame.clone();
    let idx = frame.len() / 2;
    rotten[idx] ^= 0x40;
    assert!(SChunk::from_buffer(&rotten).is_err());
}

#[test]
fn contiguous_file_save_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.b2frame");
    let urlpath = path.to_str().unwrap().to_string();

    let mut schunk = sample_schunk();
    schunk.meta_add("kind", b"contiguous").unwrap();
    schunk.save(&urlpath, true).unwrap();

    let mut opened = SChunk::open(&urlpath).unwrap();
    assert_eq!(opened.meta_get("kind").unwrap(), b"contiguous");
    assert_same_payload(&mut schunk, &mut opened);

    // Appends to the opened schunk persist in place.
    let extra: Vec<u8> = (0..4096).map(|i| (i % 100) as u8).collect();
    opened.append_buffer(&extra).unwrap();
    let mut reopened = SChunk::open(&urlpath).unwrap();
    assert_eq!(reopened.nchunks(), 4);
    let mut out = vec![0u8; 4096];
    reopened.decompress_chunk(3, &mut out).unwrap();
    assert_eq!(out, extra);
}

#[test]
fn url_backed_schunk_writes_through() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("live.b2frame");
    let urlpath = path.to_str().unwrap().to_string();

    let mut st = storage(1);
    st.urlpath = Some(urlpath.clone());
    st.contiguous = true;
    let mut schunk = SChunk::new(st).unwrap();
    for k in 0..5u8 {
        schunk.append_buffer(&vec![k; 1024]).unwrap();
    }
    schunk.delete_chunk(1).unwrap();

    let mut reopened = SChunk::open(&urlpath).unwrap();
    assert_eq!(reopened.nchunks(), 4);
    let expect = [0u8, 2, 3, 4];
    let mut out = vec![0u8; 1024];
    for (i, &v) in expect.iter().enumerate() {
        reopened.decompress_chunk(i, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == v), "chunk {i}");
    }
}

#[test]
fn sparse_directory_save_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sparse.b2nd");
    let urlpath = path.to_str().unwrap().to_string();

    let mut st = storage(4);
    st.urlpath = Some(urlpath.clone());
    st.contiguous = false;
    let mut schunk = SChunk::new(st).unwrap();
    for k in 0..3u8 {
        schunk.append_buffer(&vec![k; 8192]).unwrap();
    }
    schunk.fill_special(2048, SpecialValue::Zero, 8192).unwrap();

    // One file per stored chunk plus the index image.
    assert!(path.join("chunks.b2frame").exists());
    assert!(path.join("00000000.chunk").exists());
    assert!(path.join("00000002.chunk").exists());
    // The sentinel zero chunk has no file.
    assert!(!path.join("00000003.chunk").exists());

    let mut opened = SChunk::open(&urlpath).unwrap();
    assert_same_payload(&mut schunk, &mut opened);
}

#[test]
fn mem_backend_frames() {
    let mut schunk = sample_schunk();
    schunk.save("mem://frames/unit", true).unwrap();
    let mut opened = SChunk::open("mem://frames/unit").unwrap();
    assert_same_payload(&mut schunk, &mut opened);
}
