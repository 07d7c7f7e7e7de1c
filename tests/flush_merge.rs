use lsm_engine::{Database, Info, InfoValue, Options, Slice};
use test_log::test;

fn count_keys(db: &Database) -> lsm_engine::Result<u64> {
    let mut cursor = db.cursor()?;
    cursor.first()?;
    let mut n = 0;
    while cursor.valid() {
        n += 1;
        cursor.next()?;
    }
    Ok(n)
}

fn level_count(db: &Database) -> lsm_engine::Result<usize> {
    match db.info(Info::DbStructure)? {
        InfoValue::Text(text) => Ok(text.lines().count()),
        other => panic!("unexpected info value: {other:?}"),
    }
}

#[test]
fn repeated_flushes_stack_levels() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().autowork(false),
    )?;

    for wave in 0..3u32 {
        for i in 0..200u32 {
            db.insert(
                format!("w{wave}-{i:04}").as_bytes(),
                format!("{wave}/{i}").as_bytes(),
            )?;
        }
        db.flush()?;
    }

    assert_eq!(3, level_count(&db)?);
    assert_eq!(600, count_keys(&db)?);
    Ok(())
}

#[test]
fn work_folds_levels_together() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().autowork(false),
    )?;

    for wave in 0..4u32 {
        for i in 0..300u32 {
            db.insert(format!("{i:04}").as_bytes(), format!("wave{wave}").as_bytes())?;
        }
        db.flush()?;
    }
    assert_eq!(4, level_count(&db)?);

    let written = db.work(4, 100_000)?;
    assert!(written > 0);
    assert!(level_count(&db)? < 4);

    // The newest wave wins for every key
    for i in (0..300u32).step_by(23) {
        assert_eq!(
            Some(Slice::from(b"wave3")),
            db.get(format!("{i:04}").as_bytes())?,
        );
    }
    assert_eq!(300, count_keys(&db)?);
    Ok(())
}

#[test]
fn deletes_annihilate_in_final_merge() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().autowork(false),
    )?;

    for i in 0..200u32 {
        db.insert(format!("{i:04}").as_bytes(), b"v")?;
    }
    db.flush()?;

    for i in 0..200u32 {
        if i % 2 == 0 {
            db.delete(format!("{i:04}").as_bytes())?;
        }
    }
    db.delete_range(b"0150", b"0199")?;
    db.flush()?;

    db.work(2, 100_000)?;

    let mut cursor = db.cursor()?;
    cursor.first()?;
    let mut keys = Vec::new();
    while cursor.valid() {
        keys.push(cursor.key()?.to_vec());
        cursor.next()?;
    }

    for key in &keys {
        let n: u32 = String::from_utf8_lossy(key).parse().unwrap();
        assert_eq!(1, n % 2, "even key {n} survived its delete");
        assert!(
            n <= 150 || n >= 199,
            "key {n} survived the range delete"
        );
    }
    assert_eq!(
        (0..200u32)
            .filter(|n| n % 2 == 1 && (*n <= 150 || *n >= 199))
            .count(),
        keys.len()
    );
    Ok(())
}

#[test]
fn autowork_keeps_db_readable_under_load() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().autoflush_kib(16).automerge(2),
    )?;

    for i in 0..3000u32 {
        db.insert(format!("{i:06}").as_bytes(), format!("value-{i}").as_bytes())?;
    }

    for i in (0..3000u32).step_by(251) {
        assert_eq!(
            Some(Slice::from(format!("value-{i}").into_bytes())),
            db.get(format!("{i:06}").as_bytes())?,
        );
    }
    assert_eq!(3000, count_keys(&db)?);
    Ok(())
}

#[test]
fn bounded_work_pauses_and_resumes_a_merge() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().autowork(false),
    )?;

    let value = vec![3u8; 256];
    for wave in 0..2u32 {
        for i in 0..2000u32 {
            db.insert(format!("w{wave}-{i:05}").as_bytes(), &value)?;
        }
        db.flush()?;
    }

    // A tiny budget forces the merge to pause mid-way
    db.work(2, 64)?;

    // The database stays fully readable across the paused state
    assert_eq!(4000, count_keys(&db)?);

    // Finishing the merge preserves the data
    db.work(2, 100_000)?;
    assert_eq!(4000, count_keys(&db)?);
    Ok(())
}

#[test]
fn merged_segments_grow_separator_btrees() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().autowork(false),
    )?;

    let value = vec![9u8; 128];
    for i in 0..2000u32 {
        db.insert(format!("{i:06}").as_bytes(), &value)?;
    }
    db.flush()?;

    // A multi-page segment carries a separator B-tree root
    let InfoValue::Text(structure) = db.info(Info::DbStructure)? else {
        panic!("expected text");
    };
    assert!(
        !structure.contains("root=0"),
        "expected a separator B-tree: {structure}"
    );

    // Point reads descend it
    for i in (0..2000u32).step_by(199) {
        assert!(db.get(format!("{i:06}").as_bytes())?.is_some());
    }
    Ok(())
}
