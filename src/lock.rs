use std::fs::File;
use std::io;

use fs2::FileExt;
use log::trace;

use crate::error::{Error, Result};
use crate::types::LockMode;

/// OS-level advisory lock over a whole database file.
///
/// Every attachment gets its own backend; two backends on the same file must
/// exclude each other exactly like two processes would.
pub trait LockBackend: Send {
    /// Block until the lock is granted
    fn lock(&self, mode: LockMode) -> io::Result<()>;
    /// Returns `Ok(false)` if the lock is held elsewhere
    fn try_lock(&self, mode: LockMode) -> io::Result<bool>;
    fn unlock(&self) -> io::Result<()>;
}

/// `flock(2)` locks on a private duplicate of the database descriptor.
pub struct FlockBackend {
    file: File,
}

impl FlockBackend {
    pub fn new(file: &File) -> io::Result<Self> {
        Ok(FlockBackend {
            file: file.try_clone()?,
        })
    }
}

impl LockBackend for FlockBackend {
    fn lock(&self, mode: LockMode) -> io::Result<()> {
        match mode {
            LockMode::Shared => FileExt::lock_shared(&self.file),
            LockMode::Exclusive => FileExt::lock_exclusive(&self.file),
        }
    }

    fn try_lock(&self, mode: LockMode) -> io::Result<bool> {
        let res = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&self.file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&self.file),
        };
        match res {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn unlock(&self) -> io::Result<()> {
        FileExt::unlock(&self.file)
    }
}

/// Backend for internal databases and `NOLOCK` handles.
pub struct NoLock;

impl LockBackend for NoLock {
    fn lock(&self, _mode: LockMode) -> io::Result<()> {
        Ok(())
    }

    fn try_lock(&self, _mode: LockMode) -> io::Result<bool> {
        Ok(true)
    }

    fn unlock(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Per-handle lock bookkeeping.
///
/// Explicit locks nest: each `lock_all` needs a matching `unlock_all`. The
/// shared and exclusive whole-database locks never coexist on one handle; a
/// running transaction counts as an exclusive holder.
///
/// A chain lock covers the hash chain of one key. Backends only lock whole
/// files, so it is held as a whole-file lock of the same mode; the manager
/// remembers which chain it was taken for. At most one chain lock is held at
/// a time, and no transaction may start under it.
pub(crate) struct LockManager {
    backend: Box<dyn LockBackend>,
    /// What the OS currently grants us
    held: Option<LockMode>,
    shared_depth: u32,
    exclusive_depth: u32,
    in_transaction: bool,
    chain: Option<(u64, LockMode)>,
}

/// Whether an acquisition took a fresh OS lock (and the caller must
/// revalidate its view of the file).
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquired {
    Fresh,
    AlreadyHeld,
}

impl LockManager {
    pub(crate) fn new(backend: Box<dyn LockBackend>) -> Self {
        LockManager {
            backend,
            held: None,
            shared_depth: 0,
            exclusive_depth: 0,
            in_transaction: false,
            chain: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn held(&self) -> Option<LockMode> {
        self.held
    }

    pub(crate) fn lock_all(&mut self) -> Result<Acquired> {
        if self.shared_depth > 0 {
            return Err(Error::InvalidState("read lock held, cannot take exclusive lock"));
        }
        let acquired = self.ensure(LockMode::Exclusive)?;
        self.exclusive_depth += 1;
        Ok(acquired)
    }

    /// Non-blocking `lock_all`. `None` if another attachment holds the file.
    pub(crate) fn try_lock_all(&mut self) -> Result<Option<Acquired>> {
        if self.shared_depth > 0 {
            return Err(Error::InvalidState("read lock held, cannot take exclusive lock"));
        }
        let acquired = self.try_ensure(LockMode::Exclusive)?;
        if acquired.is_some() {
            self.exclusive_depth += 1;
        }
        Ok(acquired)
    }

    pub(crate) fn unlock_all(&mut self) -> Result<()> {
        if self.exclusive_depth == 0 {
            return Err(Error::InvalidState("exclusive lock not held"));
        }
        self.exclusive_depth -= 1;
        self.release_if_idle()
    }

    pub(crate) fn read_lock_all(&mut self) -> Result<Acquired> {
        if self.holds_exclusive() {
            return Err(Error::InvalidState("exclusive lock held, cannot take read lock"));
        }
        let acquired = self.ensure(LockMode::Shared)?;
        self.shared_depth += 1;
        Ok(acquired)
    }

    pub(crate) fn try_read_lock_all(&mut self) -> Result<Option<Acquired>> {
        if self.holds_exclusive() {
            return Err(Error::InvalidState("exclusive lock held, cannot take read lock"));
        }
        let acquired = self.try_ensure(LockMode::Shared)?;
        if acquired.is_some() {
            self.shared_depth += 1;
        }
        Ok(acquired)
    }

    pub(crate) fn read_unlock_all(&mut self) -> Result<()> {
        if self.shared_depth == 0 {
            return Err(Error::InvalidState("read lock not held"));
        }
        self.shared_depth -= 1;
        self.release_if_idle()
    }

    fn holds_exclusive(&self) -> bool {
        self.exclusive_depth > 0
            || self.in_transaction
            || matches!(self.chain, Some((_, LockMode::Exclusive)))
    }

    pub(crate) fn chain(&self) -> Option<(u64, LockMode)> {
        self.chain
    }

    pub(crate) fn chain_lock(&mut self, bucket: u64, mode: LockMode) -> Result<Acquired> {
        if self.chain.is_some() {
            return Err(Error::InvalidState("a chain lock is already held"));
        }
        let acquired = self.ensure(mode)?;
        trace!("chain {} locked {:?}", bucket, mode);
        self.chain = Some((bucket, mode));
        Ok(acquired)
    }

    pub(crate) fn chain_unlock(&mut self, bucket: u64, mode: LockMode) -> Result<()> {
        if self.chain != Some((bucket, mode)) {
            return Err(Error::InvalidState("chain lock not held"));
        }
        self.chain = None;
        self.release_if_idle()
    }

    /// Exclusive hold for the lifetime of an explicit transaction.
    pub(crate) fn begin_transaction(&mut self) -> Result<Acquired> {
        if self.chain.is_some() {
            return Err(Error::InvalidState("cannot start a transaction under a chain lock"));
        }
        self.begin_write()
    }

    /// Exclusive hold for one mutation; allowed under a chain lock.
    pub(crate) fn begin_write(&mut self) -> Result<Acquired> {
        if self.shared_depth > 0 {
            return Err(Error::InvalidState("cannot start a transaction under a read lock"));
        }
        let acquired = self.ensure(LockMode::Exclusive)?;
        self.in_transaction = true;
        Ok(acquired)
    }

    pub(crate) fn end_transaction(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.release_if_idle()
    }

    /// Make sure some lock covers a single read. Returns `Fresh` if a
    /// temporary shared lock was taken, to be dropped with `release_op`.
    pub(crate) fn lock_for_read(&mut self) -> Result<Acquired> {
        if self.held.is_some() {
            return Ok(Acquired::AlreadyHeld);
        }
        self.ensure(LockMode::Shared)
    }

    pub(crate) fn release_op(&mut self, acquired: Acquired) -> Result<()> {
        match acquired {
            Acquired::Fresh => self.release_if_idle(),
            Acquired::AlreadyHeld => Ok(()),
        }
    }

    /// Drop everything regardless of nesting, as on close.
    pub(crate) fn release_all(&mut self) -> Result<()> {
        self.shared_depth = 0;
        self.exclusive_depth = 0;
        self.in_transaction = false;
        self.chain = None;
        self.release_if_idle()
    }

    /// Trade the OS lock for one of another mode, keeping the nesting
    /// counts. Not atomic: another attachment may get in between.
    pub(crate) fn relock(&mut self, mode: LockMode) -> Result<()> {
        if let Some(old) = self.held.take() {
            trace!("dropping {:?} lock to take {:?}", old, mode);
            self.backend.unlock().map_err(Error::Lock)?;
        }
        self.backend.lock(mode).map_err(Error::Lock)?;
        self.held = Some(mode);
        Ok(())
    }

    fn ensure(&mut self, mode: LockMode) -> Result<Acquired> {
        match (self.held, mode) {
            (Some(LockMode::Exclusive), _) | (Some(LockMode::Shared), LockMode::Shared) => {
                Ok(Acquired::AlreadyHeld)
            }
            (Some(LockMode::Shared), LockMode::Exclusive) => {
                // flock cannot upgrade atomically
                Err(Error::InvalidState("cannot upgrade a shared lock"))
            }
            (None, mode) => {
                trace!("acquiring {:?} database lock", mode);
                self.backend.lock(mode).map_err(Error::Lock)?;
                self.held = Some(mode);
                Ok(Acquired::Fresh)
            }
        }
    }

    fn try_ensure(&mut self, mode: LockMode) -> Result<Option<Acquired>> {
        if self.held.is_some() {
            return self.ensure(mode).map(Some);
        }
        if !self.backend.try_lock(mode).map_err(Error::Lock)? {
            trace!("{:?} database lock is busy", mode);
            return Ok(None);
        }
        trace!("acquired {:?} database lock without waiting", mode);
        self.held = Some(mode);
        Ok(Some(Acquired::Fresh))
    }

    fn release_if_idle(&mut self) -> Result<()> {
        if self.shared_depth > 0
            || self.exclusive_depth > 0
            || self.in_transaction
            || self.chain.is_some()
        {
            return Ok(());
        }
        if let Some(mode) = self.held.take() {
            trace!("releasing {:?} database lock", mode);
            self.backend.unlock().map_err(Error::Lock)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl LockBackend for Recorder {
        fn lock(&self, mode: LockMode) -> io::Result<()> {
            self.0.lock().unwrap().push(format!("lock {:?}", mode));
            Ok(())
        }

        fn try_lock(&self, mode: LockMode) -> io::Result<bool> {
            self.lock(mode).map(|_| true)
        }

        fn unlock(&self) -> io::Result<()> {
            self.0.lock().unwrap().push("unlock".to_string());
            Ok(())
        }
    }

    fn manager() -> (Recorder, LockManager) {
        let rec = Recorder::default();
        (rec.clone(), LockManager::new(Box::new(rec)))
    }

    #[test]
    fn nested_exclusive_locks_hit_the_os_once() {
        let (rec, mut locks) = manager();
        assert_eq!(locks.lock_all().unwrap(), Acquired::Fresh);
        assert_eq!(locks.lock_all().unwrap(), Acquired::AlreadyHeld);
        locks.unlock_all().unwrap();
        assert_eq!(locks.held(), Some(LockMode::Exclusive));
        locks.unlock_all().unwrap();
        assert_eq!(locks.held(), None);
        assert_eq!(*rec.0.lock().unwrap(), vec!["lock Exclusive", "unlock"]);
    }

    #[test]
    fn shared_and_exclusive_are_mutually_exclusive() {
        let (_rec, mut locks) = manager();
        let _ = locks.read_lock_all().unwrap();
        assert!(matches!(locks.lock_all(), Err(Error::InvalidState(_))));
        assert!(matches!(locks.begin_transaction(), Err(Error::InvalidState(_))));
        locks.read_unlock_all().unwrap();

        let _ = locks.lock_all().unwrap();
        assert!(matches!(locks.read_lock_all(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn unbalanced_unlock_is_rejected() {
        let (_rec, mut locks) = manager();
        assert!(matches!(locks.unlock_all(), Err(Error::InvalidState(_))));
        assert!(matches!(locks.read_unlock_all(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn transaction_keeps_lock_past_unlock_all() {
        let (_rec, mut locks) = manager();
        let _ = locks.lock_all().unwrap();
        assert_eq!(locks.begin_transaction().unwrap(), Acquired::AlreadyHeld);
        locks.unlock_all().unwrap();
        assert_eq!(locks.held(), Some(LockMode::Exclusive));
        locks.end_transaction().unwrap();
        assert_eq!(locks.held(), None);
    }

    #[test]
    fn relock_keeps_nesting() {
        let (rec, mut locks) = manager();
        let _ = locks.read_lock_all().unwrap();
        locks.relock(LockMode::Exclusive).unwrap();
        locks.relock(LockMode::Shared).unwrap();
        assert_eq!(locks.held(), Some(LockMode::Shared));
        locks.read_unlock_all().unwrap();
        assert_eq!(locks.held(), None);
        assert_eq!(
            *rec.0.lock().unwrap(),
            vec![
                "lock Shared",
                "unlock",
                "lock Exclusive",
                "unlock",
                "lock Shared",
                "unlock"
            ]
        );
    }

    #[test]
    fn one_chain_lock_at_a_time() {
        let (rec, mut locks) = manager();
        assert_eq!(locks.chain_lock(3, LockMode::Exclusive).unwrap(), Acquired::Fresh);
        assert!(matches!(
            locks.chain_lock(5, LockMode::Shared),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(locks.begin_transaction(), Err(Error::InvalidState(_))));
        assert!(matches!(
            locks.chain_unlock(3, LockMode::Shared),
            Err(Error::InvalidState(_))
        ));
        locks.chain_unlock(3, LockMode::Exclusive).unwrap();
        assert_eq!(locks.held(), None);
        assert_eq!(locks.chain(), None);
        assert_eq!(*rec.0.lock().unwrap(), vec!["lock Exclusive", "unlock"]);
    }

    #[test]
    fn chain_lock_survives_unlock_all() {
        let (_rec, mut locks) = manager();
        let _ = locks.lock_all().unwrap();
        assert_eq!(
            locks.chain_lock(1, LockMode::Shared).unwrap(),
            Acquired::AlreadyHeld
        );
        locks.unlock_all().unwrap();
        assert_eq!(locks.held(), Some(LockMode::Exclusive));
        locks.chain_unlock(1, LockMode::Shared).unwrap();
        assert_eq!(locks.held(), None);
    }

    struct Busy;

    impl LockBackend for Busy {
        fn lock(&self, _mode: LockMode) -> io::Result<()> {
            Ok(())
        }

        fn try_lock(&self, _mode: LockMode) -> io::Result<bool> {
            Ok(false)
        }

        fn unlock(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn try_lock_reports_contention() {
        let mut locks = LockManager::new(Box::new(Busy));
        assert_eq!(locks.try_lock_all().unwrap(), None);
        assert_eq!(locks.try_read_lock_all().unwrap(), None);
        assert_eq!(locks.held(), None);
        assert!(matches!(locks.unlock_all(), Err(Error::InvalidState(_))));

        // Once something is held the backend is not asked again
        let _ = locks.lock_all().unwrap();
        assert_eq!(locks.try_lock_all().unwrap(), Some(Acquired::AlreadyHeld));
        locks.unlock_all().unwrap();
        locks.unlock_all().unwrap();
        assert_eq!(locks.held(), None);
    }

    #[test]
    fn temporary_read_lock_only_when_nothing_held() {
        let (rec, mut locks) = manager();
        let op = locks.lock_for_read().unwrap();
        assert_eq!(op, Acquired::Fresh);
        locks.release_op(op).unwrap();

        let _ = locks.lock_all().unwrap();
        let op = locks.lock_for_read().unwrap();
        assert_eq!(op, Acquired::AlreadyHeld);
        locks.release_op(op).unwrap();
        assert_eq!(locks.held(), Some(LockMode::Exclusive));

        locks.release_all().unwrap();
        assert_eq!(locks.held(), None);
        assert_eq!(
            *rec.0.lock().unwrap(),
            vec!["lock Shared", "unlock", "lock Exclusive", "unlock"]
        );
    }
}
