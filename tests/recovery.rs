use lsm_engine::{env::MemEnv, Database, Env, Options, Slice};
use std::{path::Path, sync::Arc};
use test_log::test;

fn mem_open(env: &Arc<MemEnv>, path: &Path, opts: Options) -> lsm_engine::Result<Database> {
    let env: Arc<dyn Env> = Arc::new(env.share());
    Database::open_with_env(env, path, opts)
}

#[test]
fn recovery_sees_a_prefix_of_commits() -> lsm_engine::Result<()> {
    let env = Arc::new(MemEnv::new());
    let path = Path::new("/crash/db.lsm");

    {
        let db = mem_open(&env, path, Options::default().autowork(false))?;
        db.insert(b"a", b"1")?;
        db.insert(b"b", b"2")?;
        db.insert(b"c", b"3")?;
        db.skip_close_checkpoint();
    }
    env.crash();

    // Whatever survives must be a prefix of the committed transactions
    let db = mem_open(&env, path, Options::default().autowork(false))?;
    let c = db.get(b"c")?.is_some();
    let b = db.get(b"b")?.is_some();
    let a = db.get(b"a")?.is_some();

    assert!(!c || b, "c recovered without b");
    assert!(!b || a, "b recovered without a");

    Ok(())
}

#[test]
fn full_safety_commits_survive_verbatim() -> lsm_engine::Result<()> {
    let env = Arc::new(MemEnv::new());
    let path = Path::new("/crash/full.lsm");
    let opts = || Options::default().safety(lsm_engine::SafetyLevel::Full);

    {
        let db = mem_open(&env, path, opts())?;
        for i in 0..50u32 {
            db.insert(format!("key{i:03}").as_bytes(), format!("val{i}").as_bytes())?;
        }
        db.skip_close_checkpoint();
    }
    env.crash();

    let db = mem_open(&env, path, opts())?;
    for i in 0..50u32 {
        assert_eq!(
            Some(Slice::from(format!("val{i}").into_bytes())),
            db.get(format!("key{i:03}").as_bytes())?,
            "key{i:03} lost after crash",
        );
    }

    Ok(())
}

#[test]
fn recovery_stops_at_torn_commit() -> lsm_engine::Result<()> {
    let env = Arc::new(MemEnv::new());
    let path = Path::new("/crash/torn.lsm");
    let opts = || Options::default().safety(lsm_engine::SafetyLevel::Full);

    {
        let db = mem_open(&env, path, opts())?;
        db.insert(b"first", b"1")?;
        db.insert(b"second", b"2")?;
        db.skip_close_checkpoint();
    }

    // Corrupt the second transaction's record body: its commit
    // checksum must stop verifying while the first stays intact. In
    // FULL safety each commit is padded to a fresh 512-byte sector,
    // so the second transaction starts at offset 512.
    {
        let log = env.open_file(Path::new("/crash/torn.lsm-log"), false, false)?;
        log.write_at(516, &[0xAB, 0xAB])?;
        log.sync()?;
    }
    env.crash();

    let db = mem_open(&env, path, opts())?;
    assert_eq!(Some(Slice::from(b"1")), db.get(b"first")?);
    assert_eq!(None, db.get(b"second")?);

    Ok(())
}

#[test]
fn flush_checkpoint_kill_reopen_keeps_everything() -> lsm_engine::Result<()> {
    let env = Arc::new(MemEnv::new());
    let path = Path::new("/crash/bulk.lsm");

    {
        let db = mem_open(&env, path, Options::default().autowork(false))?;
        for i in 0..10_000u32 {
            db.insert(format!("{i:016}").as_bytes(), b"payload")?;
        }
        db.flush()?;
        db.checkpoint()?;
        db.skip_close_checkpoint();
    }
    env.crash();

    let db = mem_open(&env, path, Options::default().autowork(false))?;

    let mut cursor = db.cursor()?;
    cursor.first()?;
    let mut count = 0u32;
    let mut prev: Option<Vec<u8>> = None;
    while cursor.valid() {
        let key = cursor.key()?.to_vec();
        if let Some(prev) = &prev {
            assert!(*prev < key, "iteration went backwards");
        }
        prev = Some(key);
        count += 1;
        cursor.next()?;
    }
    assert_eq!(10_000, count);

    Ok(())
}

#[test]
fn checkpointed_state_survives_log_deletion() -> lsm_engine::Result<()> {
    let env = Arc::new(MemEnv::new());
    let path = Path::new("/crash/nolog.lsm");

    {
        let db = mem_open(&env, path, Options::default().autowork(false))?;
        for i in 0..500u32 {
            db.insert(format!("{i:06}").as_bytes(), b"v")?;
        }
        db.flush()?;
        db.checkpoint()?;
        db.skip_close_checkpoint();
    }
    env.crash();

    // The log holds nothing the checkpoint does not
    env.unlink(Path::new("/crash/nolog.lsm-log"))?;

    let db = mem_open(&env, path, Options::default().autowork(false))?;
    for i in (0..500u32).step_by(37) {
        assert_eq!(Some(Slice::from(b"v")), db.get(format!("{i:06}").as_bytes())?);
    }

    Ok(())
}

#[test]
fn clean_close_then_reopen() -> lsm_engine::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.lsm");

    {
        let db = Database::open(&path, Options::default())?;
        for i in 0..200u32 {
            db.insert(format!("{i:05}").as_bytes(), format!("{i}").as_bytes())?;
        }
    }

    let db = Database::open(&path, Options::default())?;
    for i in (0..200u32).step_by(17) {
        assert_eq!(
            Some(Slice::from(format!("{i}").into_bytes())),
            db.get(format!("{i:05}").as_bytes())?,
        );
    }

    Ok(())
}
