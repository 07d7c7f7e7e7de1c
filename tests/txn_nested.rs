use lsm_engine::{Database, Options, Slice};
use test_log::test;

#[test]
fn rollback_to_outermost_discards_everything() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    db.begin(1)?;
    db.insert(b"x", b"1")?;
    db.begin(2)?;
    db.insert(b"y", b"2")?;
    db.rollback(1)?;
    db.commit(0)?;

    let mut cursor = db.cursor()?;
    cursor.first()?;
    assert!(!cursor.valid());

    Ok(())
}

#[test]
fn rollback_inner_keeps_outer_writes() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    db.begin(1)?;
    db.insert(b"keep", b"1")?;
    db.begin(2)?;
    db.insert(b"drop", b"2")?;
    db.rollback(2)?;
    db.commit(0)?;

    assert_eq!(Some(Slice::from(b"1")), db.get(b"keep")?);
    assert_eq!(None, db.get(b"drop")?);

    Ok(())
}

#[test]
fn nested_commit_folds_into_parent() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    db.begin(1)?;
    db.insert(b"a", b"1")?;
    db.begin(2)?;
    db.insert(b"b", b"2")?;
    db.commit(1)?;

    // The savepoint is gone; the outer transaction is still open and
    // holds both writes
    db.insert(b"c", b"3")?;
    db.commit(0)?;

    assert_eq!(Some(Slice::from(b"1")), db.get(b"a")?);
    assert_eq!(Some(Slice::from(b"2")), db.get(b"b")?);
    assert_eq!(Some(Slice::from(b"3")), db.get(b"c")?);

    Ok(())
}

#[test]
fn uncommitted_writes_are_visible_to_own_cursor() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    db.insert(b"committed", b"1")?;

    db.begin(1)?;
    db.insert(b"pending", b"2")?;

    assert_eq!(Some(Slice::from(b"2")), db.get(b"pending")?);

    db.rollback(0)?;
    assert_eq!(None, db.get(b"pending")?);
    assert_eq!(Some(Slice::from(b"1")), db.get(b"committed")?);

    Ok(())
}

#[test]
fn work_inside_transaction_is_misuse() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    db.begin(1)?;
    db.insert(b"x", b"1")?;

    assert!(matches!(db.flush(), Err(lsm_engine::Error::Misuse(_))));
    assert!(matches!(db.work(2, 64), Err(lsm_engine::Error::Misuse(_))));
    assert!(matches!(db.checkpoint(), Err(lsm_engine::Error::Misuse(_))));

    db.commit(0)?;
    db.flush()?;

    Ok(())
}

#[test]
fn failed_op_rolls_back_to_mark() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    db.begin(1)?;
    db.insert(b"good", b"1")?;

    // An invalid op must leave the open transaction intact
    assert!(db.insert(b"", b"bad").is_err());

    db.commit(0)?;
    assert_eq!(Some(Slice::from(b"1")), db.get(b"good")?);

    Ok(())
}
