//! Integration tests for chunked payload I/O

use sha2::{Digest, Sha256};
use std::fs;
use std::sync::Arc;
use std::thread;
use tusk_core::*;
use tusk_engine::*;

fn id(s: &str) -> UploadId {
    UploadId::new(s).unwrap()
}

#[test]
fn initiate_creates_exact_size_payload_and_zero_offset_sidecar() {
    let (store, _temp) = UploadStore::temp().unwrap();

    for (name, size) in [("one", 1u64), ("kib", 1024), ("odd", 12_345)] {
        store.initiate_upload(&id(name), size, Metadata::new()).unwrap();

        let paths = store.paths(&id(name));
        assert_eq!(fs::metadata(&paths.payload).unwrap().len(), size);

        let sidecar: UploadInfo = serde_json::from_slice(&fs::read(&paths.info).unwrap()).unwrap();
        assert_eq!(sidecar.offset, 0);
        assert_eq!(sidecar.size, size);
    }
}

#[test]
fn sequential_chunks_preserve_order_and_content() {
    let (store, _temp) = UploadStore::temp().unwrap();
    store.initiate_upload(&id("seq"), 11, Metadata::new()).unwrap();

    let offset = store.write_chunk(&id("seq"), 0, &b"first"[..]).unwrap();
    assert_eq!(offset, 5);
    let offset = store.write_chunk(&id("seq"), offset, &b"second"[..]).unwrap();
    assert_eq!(offset, 11);

    let info = store.get_info(&id("seq")).unwrap();
    assert_eq!(info.offset, 11);
    assert!(info.is_complete());

    let payload = fs::read(store.paths(&id("seq")).payload).unwrap();
    assert_eq!(&payload[0..5], b"first");
    assert_eq!(&payload[5..11], b"second");
}

#[test]
fn progress_tracks_offset() {
    let (store, _temp) = UploadStore::temp().unwrap();
    store.initiate_upload(&id("prog"), 40, Metadata::new()).unwrap();
    assert_eq!(store.get_progress(&id("prog")).unwrap(), 0.0);
    assert!(!store.is_complete(&id("prog")).unwrap());

    store.write_chunk(&id("prog"), 0, &[1u8; 10][..]).unwrap();
    assert_eq!(store.get_progress(&id("prog")).unwrap(), 25.0);

    store.write_chunk(&id("prog"), 10, &[1u8; 30][..]).unwrap();
    assert_eq!(store.get_progress(&id("prog")).unwrap(), 100.0);
    assert!(store.is_complete(&id("prog")).unwrap());
}

#[test]
fn rewriting_an_earlier_range_never_moves_offset_backwards() {
    let (store, _temp) = UploadStore::temp().unwrap();
    store.initiate_upload(&id("mono"), 10, Metadata::new()).unwrap();

    store.write_chunk(&id("mono"), 0, &b"abcdefgh"[..]).unwrap();
    let returned = store.write_chunk(&id("mono"), 2, &b"XY"[..]).unwrap();
    assert_eq!(returned, 4);
    assert_eq!(store.get_info(&id("mono")).unwrap().offset, 8);

    let payload = fs::read(store.paths(&id("mono")).payload).unwrap();
    assert_eq!(&payload[0..8], b"abXYefgh");
}

#[test]
fn distinct_uploads_do_not_interfere() {
    let (store, _temp) = UploadStore::temp().unwrap();
    const UPLOADS: usize = 8;
    const CHUNK: usize = 4096;
    const CHUNKS: usize = 16;

    for i in 0..UPLOADS {
        store
            .initiate_upload(&id(&format!("par-{}", i)), (CHUNK * CHUNKS) as u64, Metadata::new())
            .unwrap();
    }

    let store = Arc::new(store);
    let handles: Vec<_> = (0..UPLOADS)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let upload = id(&format!("par-{}", i));
                let chunk = vec![i as u8; CHUNK];
                let mut offset = 0u64;
                for _ in 0..CHUNKS {
                    offset = store.write_chunk(&upload, offset, &chunk[..]).unwrap();
                }
                offset
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), (CHUNK * CHUNKS) as u64);
    }

    for i in 0..UPLOADS {
        let upload = id(&format!("par-{}", i));
        assert!(store.is_complete(&upload).unwrap());
        let payload = fs::read(store.paths(&upload).payload).unwrap();
        assert!(payload.iter().all(|b| *b == i as u8), "upload {} was corrupted", i);
    }
}

#[test]
fn terminate_removes_all_state() {
    let (store, _temp) = UploadStore::temp().unwrap();
    store.initiate_upload(&id("term"), 16, Metadata::new()).unwrap();
    store.write_chunk(&id("term"), 0, &b"partial"[..]).unwrap();

    store.terminate(&id("term")).unwrap();

    assert!(!store.paths(&id("term")).dir.exists());
    assert!(store.get_info(&id("term")).unwrap_err().is_not_found());
    assert!(!store.exists(&id("term")));
}

#[test]
fn end_to_end_upload_then_finalize() {
    let (store, temp) = UploadStore::temp().unwrap();
    let data: Vec<u8> = (0..20u8).collect();

    store.initiate_upload(&id("u1"), 20, Metadata::new()).unwrap();
    store.write_chunk(&id("u1"), 0, &data[..]).unwrap();
    assert!(store.is_complete(&id("u1")).unwrap());
    assert_eq!(store.get_progress(&id("u1")).unwrap(), 100.0);

    let dest = temp.path().join("dest").join("file.bin");
    store.finalize_upload(&id("u1"), &dest).unwrap();

    assert_eq!(fs::read(&dest).unwrap(), data);
    assert!(!store.paths(&id("u1")).dir.exists());
}

#[test]
fn finalized_payload_matches_uploaded_bytes() {
    let (store, temp) = UploadStore::temp().unwrap();
    const PART: usize = 256 * 1024;
    let mut all = Vec::new();
    for i in 0..5u8 {
        all.extend(vec![i; PART]);
    }
    let original = Sha256::digest(&all);

    store.initiate_upload(&id("big"), all.len() as u64, Metadata::new()).unwrap();
    let mut offset = 0u64;
    for part in all.chunks(PART) {
        offset = store.write_chunk(&id("big"), offset, part).unwrap();
    }
    assert_eq!(offset, all.len() as u64);

    let dest = temp.path().join("big.bin");
    store.finalize_upload(&id("big"), &dest).unwrap();
    assert_eq!(Sha256::digest(fs::read(&dest).unwrap()), original);
}

#[test]
fn sidecar_survives_store_reopen() {
    let temp = tempfile::tempdir().unwrap();
    let base = temp.path().join("uploads");

    {
        let store = UploadStore::new(PathResolver::new(&base), 1024).unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("filename".into(), "a.pdf".into());
        store.initiate_upload(&id("persist"), 100, metadata).unwrap();
        store.write_chunk(&id("persist"), 0, &[9u8; 60][..]).unwrap();
    }

    let reopened = UploadStore::new(PathResolver::new(&base), 1024).unwrap();
    let info = reopened.get_info(&id("persist")).unwrap();
    assert_eq!(info.offset, 60);
    assert_eq!(info.metadata.get("filename").unwrap(), "a.pdf");
    assert_eq!(reopened.list_uploads().unwrap().len(), 1);
}
