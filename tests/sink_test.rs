use drive_transfer_engine::engine::sink::ChunkFile;

const KB: usize = 1024;

#[test]
fn test_pieces_land_at_their_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("video.bin");
    let file = ChunkFile::create(&path, 10 * KB as u64, 3).unwrap();

    assert_eq!(file.total_pieces(), 3);
    assert_eq!(file.missing_pieces(), vec![0, 1, 2]);

    // Uneven pieces, written out of order.
    file.put_piece(2, 7 * KB as u64, &vec![0xCC; 3 * KB]).unwrap();
    file.put_piece(0, 0, &vec![0xAA; 4 * KB]).unwrap();
    assert!(file.has_piece(2));
    assert!(!file.has_piece(1));
    assert!(!file.is_complete());
    assert_eq!(file.missing_pieces(), vec![1]);

    file.put_piece(1, 4 * KB as u64, &vec![0xBB; 3 * KB]).unwrap();
    assert!(file.is_complete());
    assert_eq!(file.written_bytes(), 10 * KB as u64);
    file.flush().unwrap();

    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(on_disk.len(), 10 * KB);
    assert!(on_disk[..4 * KB].iter().all(|&b| b == 0xAA));
    assert!(on_disk[4 * KB..7 * KB].iter().all(|&b| b == 0xBB));
    assert!(on_disk[7 * KB..].iter().all(|&b| b == 0xCC));
}

#[test]
fn test_rewriting_a_piece_counts_once() {
    let dir = tempfile::tempdir().unwrap();
    let file = ChunkFile::create(&dir.path().join("a"), 100, 2).unwrap();

    file.put_piece(0, 0, &[1u8; 50]).unwrap();
    file.put_piece(0, 0, &[2u8; 50]).unwrap();
    assert_eq!(file.written_bytes(), 50);
}

#[test]
fn test_out_of_bounds_writes_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let file = ChunkFile::create(&dir.path().join("b"), 100, 2).unwrap();

    assert!(file.put_piece(2, 0, &[0u8; 10]).is_err());
    assert!(file.put_piece(1, 95, &[0u8; 10]).is_err());
    assert!(!file.has_piece(1));
    assert!(!file.has_piece(7));
}

#[test]
fn test_empty_file_is_complete() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("empty");
    let file = ChunkFile::create(&path, 0, 0).unwrap();

    assert!(file.is_complete());
    assert!(file.missing_pieces().is_empty());
    file.flush().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    assert_eq!(file.path(), path.as_path());
    assert_eq!(file.content_length(), 0);
}
