use lsm_engine::{Database, Options, Slice};
use test_log::test;

#[test]
fn insert_get_overwrite_delete() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    assert_eq!(None, db.get(b"missing")?);

    db.insert(b"alpha", b"1")?;
    db.insert(b"beta", b"2")?;
    assert_eq!(Some(Slice::from(b"1")), db.get(b"alpha")?);
    assert_eq!(Some(Slice::from(b"2")), db.get(b"beta")?);

    db.insert(b"alpha", b"one")?;
    assert_eq!(Some(Slice::from(b"one")), db.get(b"alpha")?);

    db.delete(b"alpha")?;
    assert_eq!(None, db.get(b"alpha")?);
    assert_eq!(Some(Slice::from(b"2")), db.get(b"beta")?);

    Ok(())
}

#[test]
fn iteration_is_ordered() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    // Insert out of order
    for i in [5u32, 1, 9, 3, 7, 0, 8, 2, 6, 4] {
        db.insert(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())?;
    }

    let mut cursor = db.cursor()?;
    cursor.first()?;

    let mut seen = Vec::new();
    while cursor.valid() {
        seen.push(cursor.key()?.to_vec());
        cursor.next()?;
    }

    let expect: Vec<Vec<u8>> = (0..10u32).map(|i| format!("k{i}").into_bytes()).collect();
    assert_eq!(expect, seen);

    // And backwards
    lsm_engine::Cursor::last(&mut cursor)?;
    let mut seen_rev = Vec::new();
    while cursor.valid() {
        seen_rev.push(cursor.key()?.to_vec());
        cursor.prev()?;
    }
    seen_rev.reverse();
    assert_eq!(expect, seen_rev);

    Ok(())
}

#[test]
fn cursor_iterator_adapter() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    db.insert(b"a", b"1")?;
    db.insert(b"b", b"2")?;
    db.insert(b"c", b"3")?;

    let items: Vec<_> = db.cursor()?.collect::<lsm_engine::Result<Vec<_>>>()?;
    assert_eq!(3, items.len());
    assert_eq!(Slice::from(b"a"), items[0].0);
    assert_eq!(Slice::from(b"3"), items[2].1);

    Ok(())
}

#[test]
fn empty_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db.lsm"), Options::default()).unwrap();

    assert!(db.insert(b"", b"x").is_err());
    assert!(db.delete(b"").is_err());
}
