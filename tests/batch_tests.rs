// Write batch tests: atomic visibility, staging semantics, caps and
// restarts.

use caskdb::{Error, IndexType, Options, WriteBatchOptions, DB};
use tempfile::TempDir;

#[test]
fn test_batch_is_invisible_until_commit() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(Options::new(dir.path())).unwrap();

    let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
    batch.put(b"x", b"1").unwrap();
    batch.put(b"y", b"2").unwrap();

    assert!(matches!(db.get(b"x"), Err(Error::KeyNotFound)));

    batch.commit().unwrap();
    assert_eq!(db.get(b"x").unwrap(), b"1".to_vec());
    assert_eq!(db.get(b"y").unwrap(), b"2".to_vec());
}

#[test]
fn test_empty_batch_commit() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(Options::new(dir.path())).unwrap();

    let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
    batch.commit().unwrap();
    assert_eq!(db.stat().unwrap().key_num, 0);
}

#[test]
fn test_batch_rejects_empty_key() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(Options::new(dir.path())).unwrap();

    let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
    assert!(matches!(batch.put(b"", b"v"), Err(Error::KeyIsEmpty)));
    assert!(matches!(batch.delete(b""), Err(Error::KeyIsEmpty)));
}

#[test]
fn test_batch_last_write_wins() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(Options::new(dir.path())).unwrap();

    let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
    batch.put(b"k", b"first").unwrap();
    batch.put(b"k", b"second").unwrap();
    batch.commit().unwrap();

    assert_eq!(db.get(b"k").unwrap(), b"second".to_vec());
}

#[test]
fn test_batch_delete_semantics() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(Options::new(dir.path())).unwrap();

    db.put(b"existing", b"v").unwrap();

    let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
    batch.delete(b"existing").unwrap();

    // deleting a key unknown to both index and batch drops the staged
    // write and stages nothing
    batch.put(b"ghost", b"staged").unwrap();
    batch.delete(b"ghost").unwrap();

    batch.commit().unwrap();

    assert!(matches!(db.get(b"existing"), Err(Error::KeyNotFound)));
    assert!(matches!(db.get(b"ghost"), Err(Error::KeyNotFound)));
}

#[test]
fn test_exceed_max_batch_num() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(Options::new(dir.path())).unwrap();

    let options = WriteBatchOptions { max_batch_num: 3, sync_writes: false };
    let batch = db.new_write_batch(options).unwrap();
    for i in 0..4 {
        batch.put(format!("key-{}", i).as_bytes(), b"v").unwrap();
    }

    assert!(matches!(batch.commit(), Err(Error::ExceedMaxBatchNum)));
}

#[test]
fn test_batch_survives_restart() {
    let dir = TempDir::new().unwrap();
    let options = Options::new(dir.path());

    {
        let db = DB::open(options.clone()).unwrap();
        let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
        batch.put(b"a", b"1").unwrap();
        batch.put(b"b", b"2").unwrap();
        batch.delete(b"a").unwrap();
        batch.commit().unwrap();
        db.close().unwrap();
    }

    let db = DB::open(options).unwrap();
    assert!(matches!(db.get(b"a"), Err(Error::KeyNotFound)));
    assert_eq!(db.get(b"b").unwrap(), b"2".to_vec());
}

#[test]
fn test_sequence_numbers_continue_after_restart() {
    let dir = TempDir::new().unwrap();
    let options = Options::new(dir.path());

    {
        let db = DB::open(options.clone()).unwrap();
        let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
        batch.put(b"k", b"round-1").unwrap();
        batch.commit().unwrap();
        db.close().unwrap();
    }

    // a batch committed after restart must get a fresh, higher sequence;
    // if it reused an old one, replay ordering would break
    {
        let db = DB::open(options.clone()).unwrap();
        let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
        batch.put(b"k", b"round-2").unwrap();
        batch.commit().unwrap();
        db.close().unwrap();
    }

    let db = DB::open(options).unwrap();
    assert_eq!(db.get(b"k").unwrap(), b"round-2".to_vec());
}

#[test]
fn test_bptree_batch_requires_seq_no_file() {
    let dir = TempDir::new().unwrap();
    let options = Options::new(dir.path()).index_type(IndexType::BPlusTree);

    // a brand-new directory may use batches right away
    {
        let db = DB::open(options.clone()).unwrap();
        let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
        batch.put(b"k", b"v").unwrap();
        batch.commit().unwrap();
        db.close().unwrap();
    }

    // close persisted the sequence file, so batches stay available
    let db = DB::open(options).unwrap();
    assert!(db.new_write_batch(WriteBatchOptions::default()).is_ok());
    db.close().unwrap();
}

#[test]
fn test_bptree_batch_unavailable_without_seq_no_file() {
    let dir = TempDir::new().unwrap();

    // populate the directory under the default in-memory index, which
    // never writes a sequence file
    {
        let db = DB::open(Options::new(dir.path())).unwrap();
        db.put(b"k", b"v").unwrap();
        db.close().unwrap();
    }

    let options = Options::new(dir.path()).index_type(IndexType::BPlusTree);
    let db = DB::open(options).unwrap();
    assert!(matches!(
        db.new_write_batch(WriteBatchOptions::default()),
        Err(Error::SeqNoFileNotFound)
    ));
}
