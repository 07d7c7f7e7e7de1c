// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The connection handle.
//!
//! A [`Database`] is one client of a (possibly shared) database file.
//! Writes go through the write-ahead log into the shared in-memory
//! tree under the WRITER lock; flush and merge work runs under the
//! WORKER lock; meta pages are written under the CHECKPOINTER lock.
//! All coordination state lives in the process-wide registry entry and
//! the shared-memory header, so any number of handles - across threads
//! - behave like independent clients.

pub mod config;
pub mod cursor;
pub mod info;
mod work;

use crate::{
    checkpoint,
    compress::{Compressor, COMPRESSION_NONE},
    env::{Env, EnvFile, StdEnv},
    error::{Error, Result},
    fs::FileSystem,
    lock::{LockKind, LockSlot, NUM_RW_CLIENTS},
    log_file::LogWriter,
    registry::{self, SharedDb},
    shm::{
        header::{self, TreeHeader},
        ShmPtr,
    },
    slice::Slice,
    snapshot::Snapshot,
    tree::{self, entry::EntryFlags, TreeMark, TreeWriter},
};
use config::Options;
use cursor::{Cursor, SeekMode};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

/// Suffix of the log file, next to the database file.
pub const LOG_SUFFIX: &str = "-log";

pub(crate) struct ConnState {
    pub txn_depth: usize,
    pub marks: Vec<TreeMark>,
    pub hdr: Option<TreeHeader>,
    pub rollback: Vec<ShmPtr>,
    pub log: Option<LogWriter>,
    pub recycle_floor: u32,
    pub work_kib_since_ckpt: u64,
}

pub(crate) struct DbInner {
    pub env: Arc<dyn Env>,
    pub path: PathBuf,
    pub shared: Arc<SharedDb>,
    pub conn: u32,
    pub fs: FileSystem,
    pub db_file: Arc<dyn EnvFile>,
    pub log_file: Option<Arc<dyn EnvFile>>,
    pub opts: Options,
    pub state: Mutex<ConnState>,
    pub nwrite: AtomicU64,
    pub nread: AtomicU64,

    /// Shallow clones used internally by the close path skip teardown.
    pub proxy: bool,

    /// Skip the close-time flush/checkpoint (crash simulation hook).
    pub skip_close_checkpoint: std::sync::atomic::AtomicBool,
}

/// A connection to an LSM database.
///
/// Cheap to clone; clones share the connection (and its transaction
/// state). Open several [`Database`]s on the same path for independent
/// clients.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl DbInner {
    pub(crate) fn lock(&self, slot: LockSlot, kind: LockKind) -> Result<()> {
        self.shared.locks.lock(self.conn, slot, kind)
    }

    pub(crate) fn unlock(&self, slot: LockSlot) {
        self.shared.locks.unlock(self.conn, slot);
    }

    /// Bounded blocking acquisition, used for DMS1 during open/close
    /// and for short internal critical sections.
    pub(crate) fn lock_retry(&self, slot: LockSlot, kind: LockKind) -> Result<()> {
        for attempt in 0..10u32 {
            match self.lock(slot, kind) {
                Err(Error::Busy) => {
                    let ms = (attempt * 10).min(100);
                    self.env.sleep(Duration::from_millis(u64::from(ms).max(1)));
                }
                outcome => return outcome,
            }
        }
        Err(Error::Busy)
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().expect("lock poisoned")
    }

    /// The lowest shm sequence id any registered reader still needs.
    pub(crate) fn reader_floor(&self) -> Result<u32> {
        #[allow(clippy::expect_used)]
        let _guard = self.shared.reader_slots.lock().expect("lock poisoned");

        let mut floor = u32::MAX;
        for i in 0..header::NUM_READER_SLOTS {
            let held = !self
                .shared
                .locks
                .shared_holders(LockSlot::Reader(i))
                .is_empty();
            if !held {
                continue;
            }
            if let Some((_snap, shm_id)) = header::reader_slot(&self.shared.shm, i)? {
                floor = floor.min(shm_id);
            }
        }
        Ok(floor)
    }

    /// The lowest snapshot id any registered reader still pins.
    pub(crate) fn snapshot_floor(&self, current: u64) -> Result<u64> {
        #[allow(clippy::expect_used)]
        let _guard = self.shared.reader_slots.lock().expect("lock poisoned");

        let mut floor = current;
        for i in 0..header::NUM_READER_SLOTS {
            let held = !self
                .shared
                .locks
                .shared_holders(LockSlot::Reader(i))
                .is_empty();
            if !held {
                continue;
            }
            if let Some((snap, _shm_id)) = header::reader_slot(&self.shared.shm, i)? {
                floor = floor.min(snap);
            }
        }
        Ok(floor)
    }

    /// Claims a reader slot protecting `(snapshot id, shm id)`.
    pub(crate) fn claim_reader_slot(&self, snap_id: u64, shm_id: u32) -> Result<usize> {
        #[allow(clippy::expect_used)]
        let _guard = self.shared.reader_slots.lock().expect("lock poisoned");

        // Prefer a vacant slot; otherwise share one whose floor
        // already protects us
        for i in 0..header::NUM_READER_SLOTS {
            let held = !self
                .shared
                .locks
                .shared_holders(LockSlot::Reader(i))
                .is_empty();
            if held {
                continue;
            }
            header::set_reader_slot(&self.shared.shm, i, Some((snap_id, shm_id)))?;
            self.lock(LockSlot::Reader(i), LockKind::Shared)?;
            return Ok(i);
        }

        for i in 0..header::NUM_READER_SLOTS {
            if let Some((slot_snap, slot_shm)) = header::reader_slot(&self.shared.shm, i)? {
                if slot_snap <= snap_id && slot_shm <= shm_id {
                    self.lock(LockSlot::Reader(i), LockKind::Shared)?;
                    return Ok(i);
                }
            }
        }

        Err(Error::Busy)
    }

    pub(crate) fn release_reader_slot(&self, slot: usize) {
        #[allow(clippy::expect_used)]
        let _guard = self.shared.reader_slots.lock().expect("lock poisoned");

        self.unlock(LockSlot::Reader(slot));
        if self
            .shared
            .locks
            .shared_holders(LockSlot::Reader(slot))
            .is_empty()
        {
            let _ = header::set_reader_slot(&self.shared.shm, slot, None);
        }
    }

    /// Loads the tree header, repairing shared memory first when a
    /// writer died mid-transaction.
    pub(crate) fn load_header_repairing(&self) -> Result<TreeHeader> {
        if header::writer_flag(&self.shared.shm)? {
            log::warn!("dead writer detected; repairing shared memory");
            let mut hdr = TreeHeader::load(&self.shared.shm)?;
            tree::repair(&self.shared.shm, &mut hdr)?;
            hdr.publish(&self.shared.shm)?;
            header::set_writer_flag(&self.shared.shm, false)?;
            return Ok(hdr);
        }
        TreeHeader::load(&self.shared.shm)
    }
}

impl Database {
    /// Opens (or creates) a database at `path` using the standard
    /// environment.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Self> {
        Self::open_with_env(Arc::new(StdEnv), path.as_ref(), opts)
    }

    /// Opens a database through a custom [`Env`].
    #[allow(clippy::too_many_lines)]
    pub fn open_with_env(env: Arc<dyn Env>, path: &Path, opts: Options) -> Result<Self> {
        opts.validate()?;

        let path = path.to_path_buf();
        let (shared, conn) = registry::attach(&path);

        let bootstrap = DbBootstrap {
            env,
            path,
            shared,
            conn,
            opts,
        };
        bootstrap.open()
    }

    // --- transactions --------------------------------------------------

    /// Opens nested transactions so that `level` of them are active.
    ///
    /// Level 1 is the outermost write transaction; levels above it are
    /// savepoints that [`Self::rollback`] can unwind to.
    pub fn begin(&self, level: usize) -> Result<()> {
        if level == 0 {
            return Ok(());
        }

        let mut state = self.inner.state();
        if state.txn_depth == 0 {
            self.open_write_txn(&mut state)?;
        }
        while state.txn_depth < level {
            let mark = self.mark(&state)?;
            state.marks.push(mark);
            state.txn_depth += 1;
        }
        Ok(())
    }

    fn mark(&self, state: &ConnState) -> Result<TreeMark> {
        let hdr = state
            .hdr
            .clone()
            .ok_or(Error::Misuse("no open transaction"))?;
        Ok(TreeMark {
            log_len: state.rollback.len(),
            hdr,
        })
    }

    fn open_write_txn(&self, state: &mut ConnState) -> Result<()> {
        if self.inner.opts.readonly {
            return Err(Error::ReadOnly);
        }

        self.inner.lock(LockSlot::Writer, LockKind::Exclusive)?;

        let outcome = (|| {
            let mut hdr = self.inner.load_header_repairing()?;
            header::set_writer_flag(&self.inner.shared.shm, true)?;

            // Release log space the last checkpoint made reclaimable
            let mut log = None;
            if let Some(log_file) = &self.inner.log_file {
                let mut writer = LogWriter::new(log_file.clone(), hdr.log);
                let (_ckpt_id, ckpt_offset) = header::checkpoint_info(&self.inner.shared.shm)?;
                writer.trim(ckpt_offset);
                hdr.log = writer.state();
                log = Some(writer);
            }

            state.recycle_floor = self.inner.reader_floor()?;
            state.hdr = Some(hdr);
            state.rollback.clear();
            state.log = log;
            Ok(())
        })();

        if let Err(e) = outcome {
            let _ = header::set_writer_flag(&self.inner.shared.shm, false);
            self.inner.unlock(LockSlot::Writer);
            return Err(e);
        }

        let mark = self.mark(state)?;
        state.marks.push(mark);
        state.txn_depth = 1;
        Ok(())
    }

    /// Commits transactions down to `level`; `commit(0)` publishes
    /// everything durably.
    pub fn commit(&self, level: usize) -> Result<()> {
        let mut state = self.inner.state();
        if state.txn_depth == 0 {
            return Ok(());
        }

        while state.txn_depth > level.max(1) {
            state.marks.pop();
            state.txn_depth -= 1;
        }

        if level > 0 {
            return Ok(());
        }

        // Final commit of the outermost transaction
        state.marks.pop();
        state.txn_depth = 0;

        let result = self.publish_commit(&mut state);
        self.close_write_txn(&mut state);
        result?;

        drop(state);
        if self.inner.opts.autowork {
            self.auto_work();
        }
        Ok(())
    }

    fn publish_commit(&self, state: &mut ConnState) -> Result<()> {
        let mut hdr = state
            .hdr
            .take()
            .ok_or(Error::Misuse("no open transaction"))?;

        if let Some(log) = state.log.as_mut() {
            log.commit(self.inner.opts.safety)?;
            hdr.log = log.state();
        }

        hdr.root.txid += 1;

        // Set the tree aside for flushing once it outgrows the
        // threshold
        let threshold = u64::from(self.inner.opts.autoflush_kib) * 1024;
        if threshold > 0
            && hdr.root.byte_count > threshold
            && hdr.old_root.is_empty()
            && !hdr.root.is_empty()
        {
            let floor = state.recycle_floor;
            let mut writer =
                TreeWriter::new(&self.inner.shared.shm, &mut hdr, &mut state.rollback, floor);
            writer.make_old()?;
            hdr.old_log_offset = hdr.log.regions[2].1;
            hdr.old_log_cksum = hdr.log.cksum;
            log::debug!("autoflush: tree set aside at txid {}", hdr.root.txid);
        }

        hdr.publish(&self.inner.shared.shm)?;
        Ok(())
    }

    fn close_write_txn(&self, state: &mut ConnState) {
        state.hdr = None;
        state.log = None;
        state.marks.clear();
        state.rollback.clear();
        state.txn_depth = 0;
        let _ = header::set_writer_flag(&self.inner.shared.shm, false);
        self.inner.unlock(LockSlot::Writer);
    }

    /// Rolls back to the start of transaction `level`, which stays
    /// open; `rollback(0)` abandons the whole transaction stack.
    pub fn rollback(&self, level: usize) -> Result<()> {
        let mut state = self.inner.state();
        if state.txn_depth == 0 {
            return Ok(());
        }
        if level > state.txn_depth {
            return Err(Error::Misuse("rollback to a level that is not open"));
        }

        let target = level.max(1);
        let mark = state
            .marks
            .get(target - 1)
            .cloned()
            .ok_or(Error::Misuse("rollback mark missing"))?;

        let ConnState {
            hdr, rollback, ..
        } = &mut *state;
        let hdr = hdr.as_mut().ok_or(Error::Misuse("no open transaction"))?;
        tree::rollback_to(&self.inner.shared.shm, hdr, rollback, &mark)?;

        // Drop any log records buffered since; regions revert with the
        // restored header
        if let (Some(log_file), true) = (&self.inner.log_file, state.log.is_some()) {
            state.log = Some(LogWriter::new(log_file.clone(), mark.hdr.log));
        }

        state.marks.truncate(target);
        state.txn_depth = target;

        if level == 0 {
            state.marks.clear();
            state.txn_depth = 0;
            self.close_write_txn(&mut state);
        }
        Ok(())
    }

    // --- writes --------------------------------------------------------

    fn with_write<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&Self, &mut ConnState) -> Result<()>,
    {
        let mut state = self.inner.state();
        let implicit = state.txn_depth == 0;
        if implicit {
            self.open_write_txn(&mut state)?;
        }

        let mark = self.mark(&state)?;
        let outcome = op(self, &mut state);

        if let Err(e) = outcome {
            // Leave no partial work behind
            let ConnState {
                hdr, rollback, ..
            } = &mut *state;
            if let Some(hdr) = hdr.as_mut() {
                let _ = tree::rollback_to(&self.inner.shared.shm, hdr, rollback, &mark);
            }
            if implicit {
                state.marks.clear();
                state.txn_depth = 0;
                self.close_write_txn(&mut state);
            }
            return Err(e);
        }

        if implicit {
            state.marks.pop();
            state.txn_depth = 0;
            let result = self.publish_commit(&mut state);
            self.close_write_txn(&mut state);
            result?;

            drop(state);
            if self.inner.opts.autowork {
                self.auto_work();
            }
        }
        Ok(())
    }

    /// Inserts (or overwrites) a key.
    pub fn insert(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let key = key.as_ref();
        let value = value.as_ref();

        if key.is_empty() || key.len() > u16::MAX as usize {
            return Err(Error::Misuse("keys must be 1..=65535 bytes"));
        }
        if value.len() > u32::MAX as usize {
            return Err(Error::Misuse("values are limited to 2^32 bytes"));
        }

        self.with_write(|db, state| {
            if let Some(log) = state.log.as_mut() {
                log.log_write(key, value)?;
            }

            let floor = state.recycle_floor;
            let ConnState {
                hdr, rollback, ..
            } = &mut *state;
            let hdr = hdr.as_mut().ok_or(Error::Misuse("no open transaction"))?;
            let mut writer = TreeWriter::new(&db.inner.shared.shm, hdr, rollback, floor);
            writer.insert(EntryFlags::INSERT, key, Some(value))?;

            db.inner.nwrite.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    /// Deletes a key (a no-op if it does not exist).
    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let key = key.as_ref();
        if key.is_empty() || key.len() > u16::MAX as usize {
            return Err(Error::Misuse("keys must be 1..=65535 bytes"));
        }

        self.with_write(|db, state| {
            if let Some(log) = state.log.as_mut() {
                log.log_delete(key)?;
            }

            let floor = state.recycle_floor;
            let ConnState {
                hdr, rollback, ..
            } = &mut *state;
            let hdr = hdr.as_mut().ok_or(Error::Misuse("no open transaction"))?;
            let mut writer = TreeWriter::new(&db.inner.shared.shm, hdr, rollback, floor);
            writer.insert(EntryFlags::POINT_DELETE, key, None)?;

            db.inner.nwrite.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    /// Deletes every key strictly between `lo` and `hi` (both bounds
    /// themselves survive).
    pub fn delete_range(&self, lo: impl AsRef<[u8]>, hi: impl AsRef<[u8]>) -> Result<()> {
        let lo = lo.as_ref();
        let hi = hi.as_ref();
        if lo.is_empty() || hi.is_empty() {
            return Err(Error::Misuse("range bounds must not be empty"));
        }
        if lo >= hi {
            return Ok(());
        }

        self.with_write(|db, state| {
            if let Some(log) = state.log.as_mut() {
                log.log_delete_range(lo, hi)?;
            }

            let floor = state.recycle_floor;
            let ConnState {
                hdr, rollback, ..
            } = &mut *state;
            let hdr = hdr.as_mut().ok_or(Error::Misuse("no open transaction"))?;
            let mut writer = TreeWriter::new(&db.inner.shared.shm, hdr, rollback, floor);
            writer.delete_range(0, lo, hi)?;

            db.inner.nwrite.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    // --- reads ---------------------------------------------------------

    /// Point lookup.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Slice>> {
        let mut csr = self.cursor()?;
        csr.seek(key.as_ref(), SeekMode::Eq)?;
        if csr.valid() {
            let value = csr.value()?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    /// Opens a cursor over a consistent view of the database.
    pub fn cursor(&self) -> Result<Cursor> {
        Cursor::open(self.inner.clone())
    }

    /// Closes the connection. Equivalent to dropping the handle: the
    /// last in-process connection flushes, checkpoints and trims the
    /// file tail on the way out.
    pub fn close(self) {
        drop(self);
    }

    /// Suppresses the close-time flush and checkpoint, so dropping the
    /// handle behaves like an abrupt process kill. Test hook.
    #[doc(hidden)]
    pub fn skip_close_checkpoint(&self) {
        self.inner
            .skip_close_checkpoint
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    // --- introspection -------------------------------------------------

    /// Serves a typed introspection request.
    #[allow(clippy::too_many_lines)]
    pub fn info(&self, request: info::Info) -> Result<info::InfoValue> {
        use info::{Info, InfoValue};

        match request {
            Info::NWrite => Ok(InfoValue::Count(self.inner.nwrite.load(Ordering::Relaxed))),
            Info::NRead => Ok(InfoValue::Count(self.inner.nread.load(Ordering::Relaxed))),

            Info::DbStructure => {
                let snap = self.loaded_snapshot()?;
                let mut text = String::new();
                for (i, level) in snap.levels.iter().enumerate() {
                    use std::fmt::Write as _;
                    let _ = write!(
                        text,
                        "level {} (age {}): {}..{} root={} size={}",
                        i, level.age, level.lhs.first, level.lhs.last, level.lhs.root,
                        level.lhs.size,
                    );
                    for seg in &level.rhs {
                        let _ = write!(text, " <- {}..{} size={}", seg.first, seg.last, seg.size);
                    }
                    text.push('\n');
                }
                Ok(InfoValue::Text(text))
            }

            Info::ArrayStructure { first_page } => {
                let csr = self.segment_cursor(first_page)?;
                let pages = csr.pages()?;
                let mut blocks: Vec<u32> = Vec::new();
                for &page in &pages {
                    let block = if self.inner.fs.compressed() {
                        self.inner.fs.block_of_offset(page)
                    } else {
                        self.inner.fs.block_of_page(page)
                    };
                    if blocks.last() != Some(&block) {
                        blocks.push(block);
                    }
                }
                let text = blocks
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                Ok(InfoValue::Text(text))
            }

            Info::ArrayPages { first_page } => {
                let csr = self.segment_cursor(first_page)?;
                Ok(InfoValue::Pages(csr.pages()?))
            }

            Info::LogStructure => {
                let hdr = TreeHeader::load(&self.inner.shared.shm)?;
                let [r0, r1, r2] = hdr.log.regions;
                Ok(InfoValue::Text(format!(
                    "{} {}; {} {}; {} {}",
                    r0.0, r0.1, r1.0, r1.1, r2.0, r2.1
                )))
            }

            Info::PageAsciiDump { page } => self.dump_page(page, false),
            Info::PageHexDump { page } => self.dump_page(page, true),

            Info::Freelist => {
                let snap = self.loaded_snapshot()?;
                Ok(InfoValue::Freelist(snap.freelist))
            }

            Info::CheckpointSize => Ok(InfoValue::KiB(self.checkpoint_backlog_kib())),

            Info::TreeSize => {
                let hdr = TreeHeader::load(&self.inner.shared.shm)?;
                Ok(InfoValue::TreeSize {
                    old: hdr.old_root.byte_count,
                    live: hdr.root.byte_count,
                })
            }

            Info::CompressionId => {
                let snap = self.loaded_snapshot()?;
                Ok(InfoValue::Id(snap.compression_id))
            }
        }
    }

    fn loaded_snapshot(&self) -> Result<Snapshot> {
        let hdr = TreeHeader::load(&self.inner.shared.shm)?;
        let mut snap = work::read_shm_snapshot(&self.inner.shared)?;
        self.inner.load_levels_overflow(&hdr, &mut snap)?;
        Ok(snap)
    }

    fn segment_cursor(&self, first_page: u64) -> Result<crate::segment::cursor::SegCursor> {
        let snap = Arc::new(self.loaded_snapshot()?);
        let seg = snap
            .levels
            .iter()
            .flat_map(|l| std::iter::once(&l.lhs).chain(l.rhs.iter()))
            .find(|seg| seg.first == first_page)
            .copied()
            .ok_or(Error::Misuse("no segment starts at that page"))?;
        Ok(crate::segment::cursor::SegCursor::new(
            self.inner.fs.clone(),
            snap,
            seg,
        ))
    }

    fn dump_page(&self, page: u64, hex: bool) -> Result<info::InfoValue> {
        use std::fmt::Write as _;

        let view = crate::segment::PageView::new(&self.inner.fs, self.inner.fs.read_page(page)?);
        let mut text = format!(
            "page {} ncell={} flags={:#06x}\n",
            page,
            view.ncell(),
            view.flags(),
        );

        for i in 0..view.ncell() {
            if view.is_btree() {
                let cell = view.btree_cell(i)?;
                let _ = writeln!(text, "  {i}: separator -> page {}", cell.child);
            } else {
                let cell = view.cell(i)?;
                let key = if hex {
                    cell.key.iter().map(|b| format!("{b:02x}")).collect::<String>()
                } else {
                    String::from_utf8_lossy(&cell.key).into_owned()
                };
                let vlen = cell.value.as_ref().map_or(0, |v| v.len());
                let _ = writeln!(
                    text,
                    "  {i}: {:#04x} {} ({} byte value)",
                    cell.flags.bits(),
                    key,
                    vlen
                );
            }
        }
        Ok(info::InfoValue::Text(text))
    }

    // --- user version --------------------------------------------------

    /// Reads the application cookie.
    pub fn user_version(&self) -> Result<u32> {
        Ok(TreeHeader::load(&self.inner.shared.shm)?.user_version)
    }

    /// Writes the application cookie.
    pub fn set_user_version(&self, version: u32) -> Result<()> {
        self.with_write(|_db, state| {
            let hdr = state
                .hdr
                .as_mut()
                .ok_or(Error::Misuse("no open transaction"))?;
            hdr.user_version = version;
            Ok(())
        })
    }
}

struct DbBootstrap {
    env: Arc<dyn Env>,
    path: PathBuf,
    shared: Arc<SharedDb>,
    conn: u32,
    opts: Options,
}

impl DbBootstrap {
    fn log_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(LOG_SUFFIX);
        PathBuf::from(name)
    }

    fn resolve_compression(
        opts: &Options,
        persisted: u32,
    ) -> Result<Option<Arc<dyn Compressor>>> {
        let configured = opts
            .compression
            .as_ref()
            .map_or(COMPRESSION_NONE, |c| c.id());

        // A database that has never been checkpointed accepts anything
        if persisted == 0 || persisted == configured {
            return Ok(opts.compression.clone().filter(|c| c.id() != COMPRESSION_NONE));
        }

        if persisted == COMPRESSION_NONE {
            return Err(Error::Mismatch {
                db: persisted,
                configured,
            });
        }

        // Give the factory one chance to install matching hooks
        if let Some(factory) = &opts.compression_factory {
            if let Some(compressor) = factory(persisted) {
                if compressor.id() == persisted {
                    return Ok(Some(compressor));
                }
            }
        }

        Err(Error::Mismatch {
            db: persisted,
            configured,
        })
    }

    #[allow(clippy::too_many_lines)]
    fn open(self) -> Result<Database> {
        let locks = &self.shared.locks;

        // DMS1 serializes connect/disconnect
        let mut dms1 = Err(Error::Busy);
        for attempt in 0..10u32 {
            dms1 = locks.lock(self.conn, LockSlot::Dms1, LockKind::Exclusive);
            if !matches!(dms1, Err(Error::Busy)) {
                break;
            }
            self.env
                .sleep(Duration::from_millis(u64::from((attempt * 10).min(100)).max(1)));
        }
        if let Err(e) = dms1 {
            registry::detach(&self.path);
            return Err(e);
        }

        let outcome = self.open_locked();

        locks.unlock(self.conn, LockSlot::Dms1);

        match outcome {
            Ok(db) => Ok(db),
            Err(e) => {
                locks.unlock_all(self.conn);
                registry::detach(&self.path);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn open_locked(&self) -> Result<Database> {
        let locks = &self.shared.locks;

        let others_rw = locks
            .shared_holders(LockSlot::Dms2)
            .iter()
            .any(|&c| c != self.conn);
        let others_ro = locks
            .shared_holders(LockSlot::Dms3)
            .iter()
            .any(|&c| c != self.conn);
        let first = !others_rw && !others_ro;

        let db_file =
            self.env
                .open_file(&self.path, !self.opts.readonly, self.opts.readonly)?;

        if self.opts.multiple_processes {
            db_file.gate_lock(false)?;
        }

        let log_file = if self.opts.use_log && !self.opts.readonly {
            Some(self.env.open_file(&self.log_path(), true, false)?)
        } else {
            None
        };

        // Establish the authoritative snapshot: from shared memory if
        // other connections are live, from the meta pages otherwise
        let (snapshot, meta_slot) = if first {
            match checkpoint::read_newest(&db_file)? {
                Some((snapshot, slot)) => (snapshot, Some(slot)),
                None => (
                    Snapshot::initial(self.opts.page_size, self.opts.block_size_kib * 1024),
                    None,
                ),
            }
        } else {
            (work::read_shm_snapshot(&self.shared)?, None)
        };

        let compressor = Self::resolve_compression(&self.opts, snapshot.compression_id)?;

        let fs = FileSystem::new(
            db_file.clone(),
            snapshot.page_size as usize,
            snapshot.block_size as usize,
            compressor.clone(),
            self.opts.mmap_limit(),
        );

        let inner = Arc::new(DbInner {
            env: self.env.clone(),
            path: self.path.clone(),
            shared: self.shared.clone(),
            conn: self.conn,
            fs,
            db_file,
            log_file,
            opts: self.opts.clone(),
            state: Mutex::new(ConnState {
                txn_depth: 0,
                marks: Vec::new(),
                hdr: None,
                rollback: Vec::new(),
                log: None,
                recycle_floor: u32::MAX,
                work_kib_since_ckpt: 0,
            }),
            nwrite: AtomicU64::new(0),
            nread: AtomicU64::new(0),
            proxy: false,
            skip_close_checkpoint: std::sync::atomic::AtomicBool::new(false),
        });
        let db = Database { inner };

        if first {
            db.recover(snapshot, meta_slot)?;
        }

        // Membership locks
        if self.opts.readonly {
            locks.lock(self.conn, LockSlot::Dms3, LockKind::Shared)?;
        } else {
            locks.lock(self.conn, LockSlot::Dms2, LockKind::Shared)?;

            // Prove a live read-write client exists, which blocks
            // file truncation by others
            for i in 0..NUM_RW_CLIENTS {
                if locks
                    .lock(self.conn, LockSlot::RwClient(i), LockKind::Exclusive)
                    .is_ok()
                {
                    break;
                }
            }
        }

        log::debug!(
            "opened {:?} (conn {}, first={first})",
            self.path,
            self.conn
        );
        Ok(db)
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        if self.proxy {
            return;
        }

        // An abandoned transaction leaves the writer flag set; the next
        // connection will run shared-memory repair
        if self.shared.locks.holds(self.conn, LockSlot::Writer) {
            log::warn!("connection dropped with an open transaction");
        }

        // Best-effort final checkpoint and tail truncation when this
        // was the last in-process connection
        let last = registry::ref_count(&self.path) == 1;
        let skip = self
            .skip_close_checkpoint
            .load(std::sync::atomic::Ordering::Relaxed);
        if last && !skip && !self.opts.readonly {
            if let Err(e) = Database::final_checkpoint_on_close(self) {
                log::warn!("close: final checkpoint failed: {e}");
            }
        }

        self.shared.locks.unlock_all(self.conn);
        if self.opts.multiple_processes {
            let _ = self.db_file.gate_unlock();
        }
        registry::detach(&self.path);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Database({:?}, conn {})", self.inner.path, self.inner.conn)
    }
}
