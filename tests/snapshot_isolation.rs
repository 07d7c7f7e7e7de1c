use lsm_engine::{Database, Options, Slice};
use test_log::test;

#[test]
fn reader_keeps_its_view_across_writes() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.lsm");

    let writer = Database::open(&path, Options::default())?;
    let reader = Database::open(&path, Options::default())?;

    for i in 0..100u32 {
        writer.insert(format!("old{i:03}").as_bytes(), b"v")?;
    }

    // The reader opens its cursor before the second wave of writes
    let mut cursor = reader.cursor()?;
    cursor.first()?;

    for i in 0..100u32 {
        writer.insert(format!("new{i:03}").as_bytes(), b"v")?;
    }
    writer.flush()?;
    writer.work(2, 10_000)?;

    // The pinned cursor still yields exactly the pre-existing keys
    let mut count = 0;
    while cursor.valid() {
        let key = cursor.key()?;
        assert!(key.starts_with(b"old"), "cursor leaked a new key: {key:?}");
        count += 1;
        cursor.next()?;
    }
    assert_eq!(100, count);
    drop(cursor);

    // A fresh cursor sees both waves
    let mut fresh = reader.cursor()?;
    fresh.first()?;
    let mut total = 0;
    while fresh.valid() {
        total += 1;
        fresh.next()?;
    }
    assert_eq!(200, total);

    Ok(())
}

#[test]
fn reader_view_survives_overwrites() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.lsm");

    let writer = Database::open(&path, Options::default())?;
    let reader = Database::open(&path, Options::default())?;

    writer.insert(b"k", b"before")?;

    let mut cursor = reader.cursor()?;
    cursor.seek(b"k", lsm_engine::SeekMode::Eq)?;
    assert_eq!(Slice::from(b"before"), cursor.value()?);

    writer.insert(b"k", b"after")?;

    // The open cursor's view is frozen
    assert_eq!(Slice::from(b"before"), cursor.value()?);
    drop(cursor);

    assert_eq!(Some(Slice::from(b"after")), reader.get(b"k")?);
    Ok(())
}

#[test]
fn writers_on_two_connections_serialize() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.lsm");

    let a = Database::open(&path, Options::default())?;
    let b = Database::open(&path, Options::default())?;

    a.begin(1)?;
    a.insert(b"from-a", b"1")?;

    // B cannot start writing while A holds the writer lock
    assert!(matches!(b.insert(b"from-b", b"x"), Err(lsm_engine::Error::Busy)));

    a.commit(0)?;

    // Now B can, and both see each other's data
    b.insert(b"from-b", b"2")?;
    assert_eq!(Some(Slice::from(b"1")), b.get(b"from-a")?);
    assert_eq!(Some(Slice::from(b"2")), a.get(b"from-b")?);

    Ok(())
}

#[test]
fn chunks_recycle_after_readers_move_on() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.lsm");

    // Small autoflush so trees retire quickly
    let db = Database::open(&path, Options::default().autoflush_kib(64))?;

    let value = vec![7u8; 1024];
    for i in 0..1000u32 {
        db.insert(format!("{i:06}").as_bytes(), &value)?;
    }
    db.flush()?;

    // After flush + discard, everything is still readable
    for i in (0..1000u32).step_by(97) {
        assert!(db.get(format!("{i:06}").as_bytes())?.is_some());
    }

    Ok(())
}

#[test]
fn concurrent_reader_and_writer_threads() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.lsm");

    let writer = Database::open(&path, Options::default())?;
    for i in 0..500u32 {
        writer.insert(format!("{i:05}").as_bytes(), b"seed")?;
    }

    let reader = Database::open(&path, Options::default())?;

    let handle = std::thread::spawn(move || -> lsm_engine::Result<usize> {
        let mut hits = 0;
        for _ in 0..20 {
            let mut cursor = reader.cursor()?;
            cursor.first()?;
            let mut n = 0;
            while cursor.valid() {
                n += 1;
                cursor.next()?;
            }
            // Every snapshot must hold at least the seed keys
            assert!(n >= 500, "snapshot saw {n} keys");
            hits += n;
        }
        Ok(hits)
    });

    for i in 0..200u32 {
        writer.insert(format!("extra{i:04}").as_bytes(), b"x")?;
    }

    handle.join().map_err(|_| lsm_engine::Error::Other("reader thread panicked"))??;
    Ok(())
}
