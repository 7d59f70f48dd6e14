use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::constants::{
    OpenMode, TdbFlags, DEFAULT_HASH_BITS, MAX_HASH_BITS, MIN_HASH_BITS, VERSION,
};
use crate::database::{Records, View};
use crate::error::{Error, Result};
use crate::hash::random_seed;
use crate::io::{Access, BaseView, FileStorage, MemStorage, Storage};
use crate::lock::{Acquired, FlockBackend, LockBackend, LockManager, NoLock};
use crate::meta::{Header, Layout};
use crate::transaction::{self, Transaction, TxnState};
use crate::types::{LockMode, StoreMode, Summary};

lazy_static! {
    /// Flags that may be toggled on an open handle
    static ref CHANGEABLE: TdbFlags =
        TdbFlags::NOMMAP | TdbFlags::NOSYNC | TdbFlags::SEQNUM | TdbFlags::ALLOW_NESTING;
}

/// Settings for opening a database.
///
/// ```no_run
/// use trivdb::{OpenMode, TdbFlags, TdbOptions};
///
/// let db = TdbOptions::new()
///     .flags(TdbFlags::NOSYNC)
///     .mode(OpenMode::READ_WRITE | OpenMode::CREATE)
///     .hash_bits(12)
///     .open("/tmp/cache.tdb")?;
/// db.store(b"key", b"value")?;
/// # Ok::<(), trivdb::Error>(())
/// ```
pub struct TdbOptions {
    flags: TdbFlags,
    mode: OpenMode,
    hash_bits: u32,
    hash_seed: Option<u64>,
    lock_backend: Option<Box<dyn LockBackend>>,
}

impl Default for TdbOptions {
    fn default() -> Self {
        TdbOptions {
            flags: TdbFlags::DEFAULT,
            mode: OpenMode::default(),
            hash_bits: DEFAULT_HASH_BITS,
            hash_seed: None,
            lock_backend: None,
        }
    }
}

impl TdbOptions {
    pub fn new() -> Self {
        TdbOptions::default()
    }

    pub fn flags(mut self, flags: TdbFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// log2 of the bucket count of a newly created database. Ignored when
    /// opening an existing file.
    pub fn hash_bits(mut self, bits: u32) -> Self {
        self.hash_bits = bits;
        self
    }

    /// Fixed hash seed instead of a random one
    pub fn hash_seed(mut self, seed: u64) -> Self {
        self.hash_seed = Some(seed);
        self
    }

    /// Replace the default `flock(2)` locking
    pub fn lock_backend<B: LockBackend + 'static>(mut self, backend: B) -> Self {
        self.lock_backend = Some(Box::new(backend));
        self
    }

    /// Open (or create) a file-backed database.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Tdb> {
        if self.flags.contains(TdbFlags::INTERNAL) {
            return self.open_internal();
        }
        self.validate()?;
        let path = path.as_ref();

        let mut flags = self.flags;
        let read_only =
            !self.mode.contains(OpenMode::READ_WRITE) || flags.contains(TdbFlags::RDONLY);
        if read_only {
            if self.mode.intersects(OpenMode::CREATE | OpenMode::TRUNCATE) {
                return Err(Error::InvalidArgument("cannot create or truncate read-only"));
            }
            flags |= TdbFlags::RDONLY;
        }

        let create = self.mode.contains(OpenMode::CREATE);
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(create)
            .create_new(create && self.mode.contains(OpenMode::EXCLUSIVE))
            .open(path)
            .map_err(Error::from_open)?;

        let backend: Box<dyn LockBackend> = match self.lock_backend {
            Some(backend) => backend,
            None if flags.contains(TdbFlags::NOLOCK) => Box::new(NoLock),
            None => Box::new(FlockBackend::new(&file)?),
        };
        let mut locks = LockManager::new(backend);
        let mut storage: Box<dyn Storage> = Box::new(FileStorage::new(
            file,
            !read_only,
            !flags.contains(TdbFlags::NOMMAP),
        )?);

        // Exclusive for writers so that creation, truncation and recovery
        // cannot race another opener.
        let _ = if read_only {
            locks.read_lock_all()?
        } else {
            locks.lock_all()?
        };
        let seed = self.hash_seed.unwrap_or_else(random_seed);
        let attached = attach(&mut *storage, self.mode, self.hash_bits, seed, read_only, flags);
        let released = if read_only {
            locks.read_unlock_all()
        } else {
            locks.unlock_all()
        };
        let header = attached?;
        released?;

        info!(
            "opened {} ({} buckets, {} bytes{})",
            path.display(),
            header.layout().buckets(),
            header.data_end,
            if read_only { ", read-only" } else { "" }
        );
        Ok(Tdb {
            name: Some(path.to_path_buf()),
            inner: Mutex::new(Some(Inner {
                storage,
                locks,
                txn: TxnState::None,
                flags,
                layout: header.layout(),
                read_only,
            })),
        })
    }

    /// Create a memory-only database. Nothing touches the filesystem and the
    /// contents vanish with the handle.
    pub fn open_internal(self) -> Result<Tdb> {
        self.validate()?;
        let header = Header::new(self.hash_bits, self.hash_seed.unwrap_or_else(random_seed));
        let mut storage = MemStorage::new();
        storage.write_at(0, &header.encode())?;
        storage.set_len(header.data_end)?;
        debug!("created internal database with {} buckets", header.layout().buckets());

        let backend: Box<dyn LockBackend> = match self.lock_backend {
            Some(backend) => backend,
            None => Box::new(NoLock),
        };
        Ok(Tdb {
            name: None,
            inner: Mutex::new(Some(Inner {
                storage: Box::new(storage),
                locks: LockManager::new(backend),
                txn: TxnState::None,
                flags: (self.flags | TdbFlags::INTERNAL) - TdbFlags::RDONLY,
                layout: header.layout(),
                read_only: false,
            })),
        })
    }

    fn validate(&self) -> Result<()> {
        if !(MIN_HASH_BITS..=MAX_HASH_BITS).contains(&self.hash_bits) {
            return Err(Error::InvalidArgument("hash bits out of range"));
        }
        Ok(())
    }
}

/// Bring a freshly opened file into a usable state under the open lock:
/// create or truncate it, recover an interrupted commit, and validate the
/// header.
fn attach(
    storage: &mut dyn Storage,
    mode: OpenMode,
    hash_bits: u32,
    seed: u64,
    read_only: bool,
    flags: TdbFlags,
) -> Result<Header> {
    let sync = !flags.contains(TdbFlags::NOSYNC);
    storage.refresh()?;
    if mode.contains(OpenMode::TRUNCATE) && storage.len() > 0 {
        debug!("truncating existing database");
        storage.set_len(0)?;
    }

    if storage.len() == 0 {
        if read_only {
            return Err(Error::corrupt("database file is empty"));
        }
        let header = Header::new(hash_bits, seed);
        storage.write_at(0, &header.encode())?;
        storage.set_len(header.data_end)?;
        if sync {
            storage.sync()?;
        }
        info!("initialised new database with {} buckets", header.layout().buckets());
        return Ok(header);
    }

    if transaction::needs_recovery(storage)? {
        if read_only {
            return Err(Error::InvalidState("database needs recovery, open it read-write"));
        }
        transaction::recover(storage, sync)?;
    }

    let header = Header::read(&BaseView::new(storage))?;
    if storage.len() < header.data_end {
        return Err(Error::corrupt(format!(
            "file is {} bytes but records end at {}",
            storage.len(),
            header.data_end
        )));
    }
    if storage.len() > header.data_end && !read_only {
        // Leftovers of a crash after the data was committed
        storage.set_len(header.data_end)?;
    }
    Ok(header)
}

/// An open database.
///
/// All methods take `&self`; a handle can be shared between threads, and
/// operations on it are serialised. Several handles (in this process or
/// others) may attach the same file, coordinated through whole-file locks.
pub struct Tdb {
    name: Option<PathBuf>,
    inner: Mutex<Option<Inner>>,
}

struct Inner {
    storage: Box<dyn Storage>,
    locks: LockManager,
    txn: TxnState,
    flags: TdbFlags,
    layout: Layout,
    read_only: bool,
}

impl Tdb {
    /// Open a file-backed database with default settings for everything
    /// but flags and mode.
    pub fn open<P: AsRef<Path>>(path: P, flags: TdbFlags, mode: OpenMode) -> Result<Tdb> {
        TdbOptions::new().flags(flags).mode(mode).open(path)
    }

    pub fn open_internal() -> Result<Tdb> {
        TdbOptions::new().open_internal()
    }

    pub fn options() -> TdbOptions {
        TdbOptions::new()
    }

    /// Library version
    pub fn version() -> &'static str {
        VERSION
    }

    /// Release locks, cancel any open transaction and detach the storage.
    /// Closing an already closed handle does nothing.
    pub fn close(&self) -> Result<()> {
        let Some(mut inner) = self.inner.lock().take() else {
            return Ok(());
        };

        let mut result = Ok(());
        match inner.txn.take() {
            TxnState::Pending(txn) | TxnState::Prepared(txn) => {
                warn!("{}: cancelling transaction still open at close", self);
                result = txn.cancel(&mut *inner.storage);
            }
            TxnState::None => {}
        }
        let released = inner.locks.release_all();
        info!("closed {}", self.display_name());
        result.and(released)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Backing file, `None` for internal databases
    pub fn name(&self) -> Option<&Path> {
        self.name.as_deref()
    }

    /// The path, or `<internal>` for memory-only databases
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(path) => path.display().to_string(),
            None => "<internal>".to_string(),
        }
    }

    pub fn flags(&self) -> Result<TdbFlags> {
        self.with_inner(|inner| Ok(inner.flags))
    }

    pub fn add_flag(&self, flag: TdbFlags) -> Result<()> {
        self.with_inner(|inner| inner.set_flag(flag, true))
    }

    pub fn remove_flag(&self, flag: TdbFlags) -> Result<()> {
        self.with_inner(|inner| inner.set_flag(flag, false))
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.read_key(key, |records| records.fetch(key))
    }

    /// Run `f` over the value stored under `key`.
    pub fn parse_record<F, R>(&self, key: &[u8], f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        self.read_key(key, |records| {
            let found = records.find(key)?.ok_or(Error::NotFound)?;
            let data = records.read_data(found.off, &found.rec)?;
            Ok(f(&data))
        })
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.read_key(key, |records| records.exists(key))
    }

    /// Insert or overwrite.
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store_with(key, value, StoreMode::Replace)
    }

    pub fn store_with(&self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<()> {
        self.write_key(key, |records| records.store(key, value, mode))
    }

    /// Add `data` to the end of the value under `key`, creating it if absent.
    pub fn append(&self, key: &[u8], data: &[u8]) -> Result<()> {
        self.write_key(key, |records| records.append(key, data))
    }

    /// Remove `key`. Fails with `NotFound` if it was not there.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_key(key, |records| records.delete(key))
    }

    /// Number of records. Walks the whole database every time.
    pub fn len(&self) -> Result<usize> {
        self.read(|records| Ok(records.count()? as usize))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Delete every record.
    pub fn wipe_all(&self) -> Result<()> {
        self.write(|records| records.wipe_all())
    }

    /// Rewrite the database without the holes left by deletes.
    pub fn repack(&self) -> Result<()> {
        self.write(|records| records.repack())
    }

    /// Sequence number, bumped by every mutation while `SEQNUM` is set
    pub fn seqnum(&self) -> Result<u64> {
        self.with_inner(|inner| inner.read(|records| records.seqnum()))
    }

    /// Verify the structure of the whole database.
    pub fn check(&self) -> Result<()> {
        self.read(|records| records.check(None))
    }

    /// Like `check`, also handing every record to `f`; an error from `f`
    /// aborts the check and is returned.
    pub fn check_with<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        self.read(|records| records.check(Some(&mut f)))
    }

    pub fn summary(&self) -> Result<Summary> {
        self.read(|records| records.summary())
    }

    /// Take the exclusive whole-database lock. Nests: every call needs a
    /// matching `unlock_all`.
    pub fn lock_all(&self) -> Result<()> {
        self.with_inner(|inner| {
            let acquired = inner.locks.lock_all()?;
            inner
                .revalidate(acquired, LockMode::Exclusive)
                .or_else(|e| inner.locks.unlock_all().and(Err(e)))
        })
    }

    /// Like `lock_all`, but returns `false` instead of waiting when another
    /// attachment holds a lock on the file.
    pub fn try_lock_all(&self) -> Result<bool> {
        self.with_inner(|inner| match inner.locks.try_lock_all()? {
            Some(acquired) => inner
                .revalidate(acquired, LockMode::Exclusive)
                .map(|_| true)
                .or_else(|e| inner.locks.unlock_all().and(Err(e))),
            None => Ok(false),
        })
    }

    pub fn unlock_all(&self) -> Result<()> {
        self.with_inner(|inner| inner.locks.unlock_all())
    }

    /// Take the shared whole-database lock. Nests like `lock_all`.
    pub fn read_lock_all(&self) -> Result<()> {
        self.with_inner(|inner| {
            let acquired = inner.locks.read_lock_all()?;
            inner
                .revalidate(acquired, LockMode::Shared)
                .or_else(|e| inner.locks.read_unlock_all().and(Err(e)))
        })
    }

    /// Non-blocking `read_lock_all`.
    pub fn try_read_lock_all(&self) -> Result<bool> {
        self.with_inner(|inner| match inner.locks.try_read_lock_all()? {
            Some(acquired) => inner
                .revalidate(acquired, LockMode::Shared)
                .map(|_| true)
                .or_else(|e| inner.locks.read_unlock_all().and(Err(e))),
            None => Ok(false),
        })
    }

    pub fn read_unlock_all(&self) -> Result<()> {
        self.with_inner(|inner| inner.locks.read_unlock_all())
    }

    /// Lock the hash chain holding `key`, whether or not the key exists, so
    /// it can be read and updated without a transaction.
    ///
    /// While a chain lock is held only keys on that chain may be used, no
    /// second chain lock may be taken and no transaction may start. The
    /// chain is locked by locking the whole file, so other attachments wait
    /// on it like on `lock_all`.
    pub fn chainlock(&self, key: &[u8]) -> Result<()> {
        self.with_inner(|inner| inner.chain_lock(key, LockMode::Exclusive))
    }

    pub fn chainunlock(&self, key: &[u8]) -> Result<()> {
        self.with_inner(|inner| inner.chain_unlock(key, LockMode::Exclusive))
    }

    /// Shared variant of `chainlock`: the chain can be read but not changed.
    pub fn chainlock_read(&self, key: &[u8]) -> Result<()> {
        self.with_inner(|inner| inner.chain_lock(key, LockMode::Shared))
    }

    pub fn chainunlock_read(&self, key: &[u8]) -> Result<()> {
        self.with_inner(|inner| inner.chain_unlock(key, LockMode::Shared))
    }

    /// Begin a transaction. Blocks until the exclusive lock is available and
    /// keeps it until the transaction ends.
    pub fn transaction_start(&self) -> Result<()> {
        self.with_inner(|inner| inner.transaction_start())
    }

    /// Discard the open transaction.
    pub fn transaction_cancel(&self) -> Result<()> {
        self.with_inner(|inner| inner.transaction_cancel())
    }

    /// First half of a two-phase commit: the transaction is journalled and
    /// can no longer be modified, only committed or cancelled.
    pub fn transaction_prepare_commit(&self) -> Result<()> {
        self.with_inner(|inner| inner.transaction_prepare_commit())
    }

    pub fn transaction_commit(&self) -> Result<()> {
        self.with_inner(|inner| inner.transaction_commit())
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(Error::InvalidState("database is closed"))?;
        f(inner)
    }

    /// Run a read-only operation against the current view of the data.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&View<'_>) -> Result<T>) -> Result<T> {
        self.with_inner(|inner| {
            inner.in_scope(None, false)?;
            inner.read(f)
        })
    }

    fn read_key<T>(&self, key: &[u8], f: impl FnOnce(&View<'_>) -> Result<T>) -> Result<T> {
        self.with_inner(|inner| {
            inner.in_scope(Some(key), false)?;
            inner.read(f)
        })
    }

    fn write<T>(&self, f: impl FnOnce(&mut View<'_>) -> Result<T>) -> Result<T> {
        self.with_inner(|inner| {
            inner.in_scope(None, true)?;
            inner.write(f)
        })
    }

    fn write_key<T>(&self, key: &[u8], f: impl FnOnce(&mut View<'_>) -> Result<T>) -> Result<T> {
        self.with_inner(|inner| {
            inner.in_scope(Some(key), true)?;
            inner.write(f)
        })
    }
}

impl Inner {
    fn sync(&self) -> bool {
        !self.flags.contains(TdbFlags::NOSYNC)
    }

    fn set_flag(&mut self, flag: TdbFlags, on: bool) -> Result<()> {
        if !CHANGEABLE.contains(flag) {
            return Err(Error::InvalidArgument("flag cannot be changed on an open database"));
        }
        self.flags.set(flag, on);
        if flag.contains(TdbFlags::NOMMAP) {
            self.storage.set_mmap(!on)?;
        }
        Ok(())
    }

    fn chain_of(&self, key: &[u8]) -> u64 {
        self.layout.bucket_of(self.layout.hash(key))
    }

    fn chain_lock(&mut self, key: &[u8], mode: LockMode) -> Result<()> {
        let bucket = self.chain_of(key);
        let acquired = self.locks.chain_lock(bucket, mode)?;
        self.revalidate(acquired, mode)
            .or_else(|e| self.locks.chain_unlock(bucket, mode).and(Err(e)))
    }

    fn chain_unlock(&mut self, key: &[u8], mode: LockMode) -> Result<()> {
        let bucket = self.chain_of(key);
        self.locks.chain_unlock(bucket, mode)
    }

    /// Under a chain lock, only keys on the locked chain may be touched,
    /// and only read if the chain is read locked.
    fn in_scope(&self, key: Option<&[u8]>, write: bool) -> Result<()> {
        let Some((bucket, mode)) = self.locks.chain() else {
            return Ok(());
        };
        match key {
            Some(key) if self.chain_of(key) == bucket => {
                if write && mode == LockMode::Shared {
                    return Err(Error::InvalidState("chain is only read locked"));
                }
                Ok(())
            }
            _ => Err(Error::InvalidState("only the chain-locked key may be used")),
        }
    }

    /// After a fresh OS lock: pick up what other attachments did while we
    /// were not looking, and finish any commit they crashed in.
    fn revalidate(&mut self, acquired: Acquired, mode: LockMode) -> Result<()> {
        if acquired == Acquired::AlreadyHeld {
            return Ok(());
        }
        self.storage.refresh()?;

        if transaction::needs_recovery(&*self.storage)? {
            if self.read_only {
                return Err(Error::InvalidState("database needs recovery, open it read-write"));
            }
            let sync = self.sync();
            match mode {
                LockMode::Exclusive => {
                    transaction::recover(&mut *self.storage, sync)?;
                }
                LockMode::Shared => {
                    self.locks.relock(LockMode::Exclusive)?;
                    let recovered = self
                        .storage
                        .refresh()
                        .and_then(|_| transaction::recover(&mut *self.storage, sync));
                    self.locks.relock(LockMode::Shared)?;
                    recovered?;
                    self.storage.refresh()?;
                }
            }
        }

        let header = Header::read(&BaseView::new(&*self.storage))?;
        if header.layout() != self.layout {
            return Err(Error::corrupt("database was re-created by another attachment"));
        }
        Ok(())
    }

    fn read<T>(&mut self, f: impl FnOnce(&View<'_>) -> Result<T>) -> Result<T> {
        let layout = self.layout;
        if let TxnState::Pending(txn) | TxnState::Prepared(txn) = &self.txn {
            let mut view = txn.read_view(&*self.storage);
            let io: &mut dyn Access = &mut view;
            return f(&Records::new(io, layout));
        }

        let acquired = self.locks.lock_for_read()?;
        if let Err(e) = self.revalidate(acquired, LockMode::Shared) {
            self.locks.release_op(acquired)?;
            return Err(e);
        }
        let result = {
            let mut view = BaseView::new(&*self.storage);
            let io: &mut dyn Access = &mut view;
            f(&Records::new(io, layout))
        };
        self.locks.release_op(acquired)?;
        result
    }

    fn write<T>(&mut self, f: impl FnOnce(&mut View<'_>) -> Result<T>) -> Result<T> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let layout = self.layout;
        let seqnum = self.flags.contains(TdbFlags::SEQNUM);
        match &mut self.txn {
            TxnState::Prepared(_) => {
                return Err(Error::InvalidState("transaction is prepared, commit or cancel it"))
            }
            TxnState::Pending(txn) => return stage(&*self.storage, txn, layout, seqnum, f),
            TxnState::None => {}
        }

        // A lone mutation is its own transaction
        self.begin(false)?;
        let mut txn = Transaction::new(self.storage.len());
        let sync = self.sync();
        let result = match stage(&*self.storage, &mut txn, layout, seqnum, f) {
            Ok(out) => self.finish_commit(txn, sync).map(|_| out),
            Err(e) => {
                if let Err(cancel) = txn.cancel(&mut *self.storage) {
                    warn!("cancelling failed operation: {}", cancel);
                }
                Err(e)
            }
        };
        let released = self.locks.end_transaction();
        let out = result?;
        released?;
        Ok(out)
    }

    /// Take the transaction lock and revalidate.
    fn begin(&mut self, explicit: bool) -> Result<()> {
        let acquired = if explicit {
            self.locks.begin_transaction()?
        } else {
            self.locks.begin_write()?
        };
        self.revalidate(acquired, LockMode::Exclusive)
            .or_else(|e| self.locks.end_transaction().and(Err(e)))
    }

    fn finish_commit(&mut self, txn: Transaction, sync: bool) -> Result<()> {
        txn.commit(&mut *self.storage, sync).map_err(|e| {
            // Whatever made it to disk is undone by the journal
            if let Err(again) = transaction::recover(&mut *self.storage, sync) {
                warn!("recovery after failed commit also failed: {}", again);
            }
            e
        })
    }

    fn transaction_start(&mut self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let nesting = self.flags.contains(TdbFlags::ALLOW_NESTING);
        match &mut self.txn {
            TxnState::Pending(txn) if nesting => {
                txn.nest();
                debug!("nested transaction, depth {}", txn.nesting());
                return Ok(());
            }
            TxnState::Pending(_) | TxnState::Prepared(_) => {
                return Err(Error::InvalidState("transaction already active"));
            }
            TxnState::None => {}
        }

        self.begin(true)?;
        self.txn = TxnState::Pending(Transaction::new(self.storage.len()));
        debug!("transaction started");
        Ok(())
    }

    fn transaction_cancel(&mut self) -> Result<()> {
        match self.txn.take() {
            TxnState::None => Err(Error::InvalidState("no transaction to cancel")),
            TxnState::Pending(mut txn) => {
                if txn.unnest() {
                    // The outermost commit is now bound to fail
                    txn.poison();
                    debug!("inner transaction cancelled, depth {}", txn.nesting());
                    self.txn = TxnState::Pending(txn);
                    return Ok(());
                }
                debug!("transaction cancelled");
                self.abort(txn)
            }
            TxnState::Prepared(txn) => {
                debug!("prepared transaction cancelled");
                self.abort(txn)
            }
        }
    }

    fn transaction_prepare_commit(&mut self) -> Result<()> {
        match self.txn.take() {
            TxnState::None => Err(Error::InvalidState("no transaction to prepare")),
            TxnState::Prepared(txn) => {
                self.txn = TxnState::Prepared(txn);
                Err(Error::InvalidState("transaction already prepared"))
            }
            TxnState::Pending(txn) if txn.nesting() > 0 => {
                self.txn = TxnState::Pending(txn);
                Ok(())
            }
            TxnState::Pending(txn) if txn.is_poisoned() => {
                self.abort(txn)?;
                Err(Error::InvalidState("a nested transaction was cancelled"))
            }
            TxnState::Pending(mut txn) => {
                let sync = self.sync();
                match txn.prepare(&mut *self.storage, sync) {
                    Ok(()) => {
                        self.txn = TxnState::Prepared(txn);
                        Ok(())
                    }
                    Err(e) => {
                        self.abort(txn)?;
                        Err(e)
                    }
                }
            }
        }
    }

    fn transaction_commit(&mut self) -> Result<()> {
        let txn = match self.txn.take() {
            TxnState::None => return Err(Error::InvalidState("no transaction to commit")),
            TxnState::Pending(mut txn) => {
                if txn.unnest() {
                    debug!("inner transaction committed, depth {}", txn.nesting());
                    self.txn = TxnState::Pending(txn);
                    return Ok(());
                }
                txn
            }
            TxnState::Prepared(txn) => txn,
        };
        if txn.is_poisoned() {
            self.abort(txn)?;
            return Err(Error::InvalidState("a nested transaction was cancelled"));
        }

        let sync = self.sync();
        let committed = self.finish_commit(txn, sync);
        let released = self.locks.end_transaction();
        committed?;
        released?;
        debug!("transaction committed");
        Ok(())
    }

    /// Throw a transaction away and drop its lock.
    fn abort(&mut self, txn: Transaction) -> Result<()> {
        let cancelled = txn.cancel(&mut *self.storage);
        let released = self.locks.end_transaction();
        cancelled.and(released)
    }
}

/// Apply `f` to the transaction overlay, bumping the sequence number when
/// asked to.
fn stage<T>(
    storage: &dyn Storage,
    txn: &mut Transaction,
    layout: Layout,
    seqnum: bool,
    f: impl FnOnce(&mut View<'_>) -> Result<T>,
) -> Result<T> {
    let mut view = txn.write_view(storage);
    let io: &mut dyn Access = &mut view;
    let mut records = Records::new(io, layout);
    let out = f(&mut records)?;
    if seqnum {
        records.bump_seqnum()?;
    }
    Ok(out)
}

impl fmt::Display for Tdb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(path) => write!(f, "Tdb('{}')", path.display()),
            None => write!(f, "Tdb(<internal>)"),
        }
    }
}

impl fmt::Debug for Tdb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tdb")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Tdb {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing {}: {}", self, e);
        }
    }
}
