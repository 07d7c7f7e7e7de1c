use lsm_engine::{Database, Options, Slice};
use test_log::test;

fn collect(db: &Database) -> lsm_engine::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut cursor = db.cursor()?;
    cursor.first()?;
    let mut out = Vec::new();
    while cursor.valid() {
        out.push((cursor.key()?.to_vec(), cursor.value()?.to_vec()));
        cursor.next()?;
    }
    Ok(out)
}

#[test]
fn bounds_survive_interior_goes() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4"), (b"e", b"5"), (b"f", b"6")]
    {
        db.insert(k, v)?;
    }
    db.delete_range(b"b", b"e")?;

    let items = collect(&db)?;
    assert_eq!(
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"e".to_vec(), b"5".to_vec()),
            (b"f".to_vec(), b"6".to_vec()),
        ],
        items
    );
    Ok(())
}

#[test]
fn delete_range_is_idempotent() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    for i in 0..20u32 {
        db.insert(format!("{i:03}").as_bytes(), b"v")?;
    }

    db.delete_range(b"005", b"015")?;
    let once = collect(&db)?;

    db.delete_range(b"005", b"015")?;
    assert_eq!(once, collect(&db)?);
    Ok(())
}

#[test]
fn insert_after_range_delete_is_visible() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    db.insert(b"a", b"1")?;
    db.insert(b"m", b"old")?;
    db.insert(b"z", b"1")?;
    db.delete_range(b"a", b"z")?;

    assert_eq!(None, db.get(b"m")?);

    db.insert(b"m", b"new")?;
    assert_eq!(Some(Slice::from(b"new")), db.get(b"m")?);

    let keys: Vec<Vec<u8>> = collect(&db)?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(vec![b"a".to_vec(), b"m".to_vec(), b"z".to_vec()], keys);
    Ok(())
}

#[test]
fn range_delete_shadows_flushed_data() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    for i in 0..100u32 {
        db.insert(format!("{i:04}").as_bytes(), b"v")?;
    }

    // Push everything into a segment, then delete a range in memory
    db.flush()?;
    db.delete_range(b"0010", b"0090")?;

    // 0000..=0010 and 0090..=0099 survive: 11 + 10 keys
    let keys: Vec<Vec<u8>> = collect(&db)?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(21, keys.len());
    assert!(keys.contains(&b"0010".to_vec()));
    assert!(keys.contains(&b"0090".to_vec()));
    assert!(!keys.contains(&b"0050".to_vec()));

    // Folding the delete into the segments preserves the result
    db.flush()?;
    db.work(2, 10_000)?;

    let keys_after: Vec<Vec<u8>> = collect(&db)?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, keys_after);
    Ok(())
}

#[test]
fn overlapping_range_deletes() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.lsm"), Options::default())?;

    for key in [b"a", b"c", b"e", b"g", b"i"] {
        db.insert(key, b"v")?;
    }
    db.delete_range(b"a", b"e")?;
    db.delete_range(b"c", b"i")?;

    let keys: Vec<Vec<u8>> = collect(&db)?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(vec![b"a".to_vec(), b"i".to_vec()], keys);
    Ok(())
}

#[test]
fn random_ops_match_reference_model() -> lsm_engine::Result<()> {
    use rand::{rngs::StdRng, Rng as _, SeedableRng as _};
    use std::collections::BTreeMap;

    let dir = tempfile::tempdir()?;
    let db = Database::open(
        dir.path().join("db.lsm"),
        Options::default().autoflush_kib(8),
    )?;
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0xBEEFCAFE);

    for round in 0..2000u32 {
        let key = format!("{:03}", rng.random_range(0..500u32)).into_bytes();
        match rng.random_range(0..10u32) {
            0..=5 => {
                let value = format!("v{round}").into_bytes();
                db.insert(&key, &value)?;
                model.insert(key, value);
            }
            6..=7 => {
                db.delete(&key)?;
                model.remove(&key);
            }
            _ => {
                let hi = format!("{:03}", rng.random_range(0..500u32)).into_bytes();
                let (lo, hi) = if key < hi { (key, hi) } else { (hi, key) };
                db.delete_range(&lo, &hi)?;
                let doomed: Vec<Vec<u8>> = model
                    .range::<[u8], _>((
                        std::ops::Bound::Excluded(&lo[..]),
                        std::ops::Bound::Excluded(&hi[..]),
                    ))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in doomed {
                    model.remove(&key);
                }
            }
        }

        if round % 500 == 499 {
            db.flush()?;
        }
    }

    let expect: Vec<(Vec<u8>, Vec<u8>)> =
        model.into_iter().map(|(k, v)| (k, v)).collect();
    assert_eq!(expect, collect(&db)?);
    Ok(())
}
