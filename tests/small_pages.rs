use lsm_engine::{Compressor, Database, Options, SeekMode, Slice};
use std::sync::Arc;
use test_log::test;

/// A do-nothing scheme with a non-reserved id, so the compressed page
/// pipeline runs without pulling in a real codec.
struct PassThrough;

impl Compressor for PassThrough {
    fn id(&self) -> u32 {
        7777
    }

    fn bound(&self, n: usize) -> usize {
        n
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> lsm_engine::Result<usize> {
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn uncompress(&self, src: &[u8], dst: &mut [u8]) -> lsm_engine::Result<()> {
        dst.copy_from_slice(src);
        Ok(())
    }
}

#[test]
fn oversized_value_spans_pages_uncompressed() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().page_size(512).block_size_kib(64),
    )?;

    let value: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    db.insert(b"big", &value)?;

    // From the in-memory tree
    assert_eq!(Some(Slice::from(value.clone())), db.get(b"big")?);

    // And from a segment, where the record spans several 512-byte pages
    db.flush()?;
    let mut cursor = db.cursor()?;
    cursor.seek(b"big", SeekMode::Eq)?;
    assert!(cursor.valid());
    assert_eq!(value.as_slice(), &*cursor.value()?);

    Ok(())
}

#[test]
fn oversized_value_spans_pages_compressed() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default()
            .page_size(512)
            .block_size_kib(64)
            .compression(Arc::new(PassThrough)),
    )?;

    let value: Vec<u8> = (0..4096u32).map(|i| (i % 241) as u8).collect();
    db.insert(b"big", &value)?;
    db.flush()?;

    let mut cursor = db.cursor()?;
    cursor.seek(b"big", SeekMode::Eq)?;
    assert!(cursor.valid());
    assert_eq!(value.as_slice(), &*cursor.value()?);

    Ok(())
}

#[test]
fn small_pages_bulk_data() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().page_size(256).block_size_kib(64),
    )?;

    for i in 0..1000u32 {
        db.insert(format!("{i:05}").as_bytes(), format!("value-{i}").as_bytes())?;
    }
    db.flush()?;

    let mut cursor = db.cursor()?;
    cursor.first()?;
    let mut n = 0u32;
    while cursor.valid() {
        assert_eq!(format!("{n:05}").as_bytes(), &*cursor.key()?);
        n += 1;
        cursor.next()?;
    }
    assert_eq!(1000, n);

    Ok(())
}

#[test]
fn compression_mismatch_is_surfaced() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.lsm");

    {
        let db = Database::open(
            &path,
            Options::default().compression(Arc::new(PassThrough)),
        )?;
        db.insert(b"k", b"v")?;
        db.flush()?;
        db.checkpoint()?;
    }

    // Reopening without the scheme fails with a mismatch
    let err = Database::open(&path, Options::default()).unwrap_err();
    assert!(matches!(
        err,
        lsm_engine::Error::Mismatch {
            db: 7777,
            configured: 1
        }
    ));

    // A factory that installs the right scheme rescues the open
    let db = Database::open(
        &path,
        Options::default().compression_factory(Arc::new(|id| {
            (id == 7777).then(|| Arc::new(PassThrough) as Arc<dyn Compressor>)
        })),
    )?;
    assert_eq!(Some(Slice::from(b"v")), db.get(b"k")?);

    Ok(())
}
