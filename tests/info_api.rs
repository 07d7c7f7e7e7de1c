use lsm_engine::{Database, Info, InfoValue, Options};
use test_log::test;

#[test]
fn write_and_read_counters() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    for i in 0..10u32 {
        db.insert(format!("k{i}").as_bytes(), b"v")?;
    }
    db.delete(b"k0")?;

    assert_eq!(InfoValue::Count(11), db.info(Info::NWrite)?);

    db.get(b"k1")?;
    db.get(b"k2")?;
    let InfoValue::Count(reads) = db.info(Info::NRead)? else {
        panic!("expected a count");
    };
    assert!(reads >= 2);

    Ok(())
}

#[test]
fn tree_size_tracks_writes() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().autowork(false),
    )?;

    let InfoValue::TreeSize { old, live } = db.info(Info::TreeSize)? else {
        panic!("expected a tree size");
    };
    assert_eq!(0, old);
    assert_eq!(0, live);

    db.insert(b"key", vec![0u8; 2000])?;

    let InfoValue::TreeSize { live, .. } = db.info(Info::TreeSize)? else {
        panic!("expected a tree size");
    };
    assert!(live > 2000);

    Ok(())
}

#[test]
fn structure_dumps() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().autowork(false),
    )?;

    for i in 0..500u32 {
        db.insert(format!("{i:05}").as_bytes(), vec![1u8; 64])?;
    }
    db.flush()?;

    let InfoValue::Text(structure) = db.info(Info::DbStructure)? else {
        panic!("expected text");
    };
    assert!(structure.contains("level 0"));

    // The segment's first page anchors the array queries
    let first_page = structure
        .split("): ")
        .nth(1)
        .and_then(|rest| rest.split("..").next())
        .and_then(|s| s.parse::<u64>().ok())
        .expect("parse first page from structure dump");

    let InfoValue::Pages(pages) = db.info(Info::ArrayPages { first_page })? else {
        panic!("expected pages");
    };
    assert!(!pages.is_empty());
    assert_eq!(first_page, pages[0]);

    let InfoValue::Text(blocks) = db.info(Info::ArrayStructure { first_page })? else {
        panic!("expected text");
    };
    assert!(!blocks.is_empty());

    // Page dumps render without error
    let InfoValue::Text(dump) = db.info(Info::PageAsciiDump { page: first_page })? else {
        panic!("expected text");
    };
    assert!(dump.contains("ncell"));

    let InfoValue::Text(hex) = db.info(Info::PageHexDump { page: first_page })? else {
        panic!("expected text");
    };
    assert!(hex.contains("ncell"));

    Ok(())
}

#[test]
fn log_structure_and_compression_id() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    db.insert(b"k", b"v")?;

    let InfoValue::Text(log) = db.info(Info::LogStructure)? else {
        panic!("expected text");
    };
    assert_eq!(6, log.split_whitespace().count());

    assert_eq!(InfoValue::Id(0), db.info(Info::CompressionId)?);

    db.flush()?;
    db.checkpoint()?;

    Ok(())
}

#[test]
fn freelist_reports_reclaimed_blocks() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().autowork(false).block_size_kib(64),
    )?;

    // Two waves into separate segments, then fold them: the consumed
    // inputs give their blocks back
    let value = vec![5u8; 512];
    for wave in 0..2u32 {
        for i in 0..500u32 {
            db.insert(format!("w{wave}-{i:05}").as_bytes(), &value)?;
        }
        db.flush()?;
    }
    db.work(2, 100_000)?;

    let InfoValue::Freelist(freelist) = db.info(Info::Freelist)? else {
        panic!("expected a freelist");
    };
    assert!(
        !freelist.is_empty(),
        "merging two segments should free blocks"
    );

    Ok(())
}

#[test]
fn user_version_round_trips_between_connections() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.lsm");

    let a = Database::open(&path, Options::default())?;
    let b = Database::open(&path, Options::default())?;

    assert_eq!(0, a.user_version()?);
    a.set_user_version(42)?;
    assert_eq!(42, b.user_version()?);

    Ok(())
}
