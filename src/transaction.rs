//! Transactions and crash recovery.
//!
//! A transaction never touches the database while it is pending. Every write
//! lands in a copy-on-write block overlay, and reads made through the
//! transaction consult the overlay first, so the caller sees its own writes
//! while every other attachment still sees the old contents.
//!
//! Commit is journalled in the same file:
//!
//! 1. the original contents of every dirty block are saved to a recovery
//!    journal past the end of the data, the header is pointed at it, and the
//!    journal is marked valid once it is on disk (this is `prepare`);
//! 2. the dirty blocks are written in place and synced;
//! 3. the journal is invalidated and cut off the end of the file.
//!
//! Whoever next takes the lock after a crash between 1 and 3 finds a valid
//! journal and replays it, restoring the pre-transaction state. A journal
//! that never became valid means step 2 never started, so it is discarded.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::constants::{
    HDR_DATA_END, HDR_RECOVERY, HEADER_SIZE, RECOVERY_HEADER_SIZE, RECOVERY_INVALID_MAGIC,
    RECOVERY_MAGIC, TRANSACTION_BLOCK_SIZE,
};
use crate::error::{Error, Result};
use crate::io::{Access, BaseView, Storage};
use crate::meta::{align_up, Header};

const BLOCK: u64 = TRANSACTION_BLOCK_SIZE;

/// The per-handle transaction slot.
pub(crate) enum TxnState {
    None,
    /// Mutations staged in the overlay
    Pending(Transaction),
    /// Journal on disk, waiting for commit; no further mutation allowed
    Prepared(Transaction),
}

impl TxnState {
    pub(crate) fn take(&mut self) -> TxnState {
        std::mem::replace(self, TxnState::None)
    }
}

/// Staged writes of one transaction.
#[derive(Debug)]
pub(crate) struct Transaction {
    /// Dirty blocks keyed by block number
    blocks: BTreeMap<u64, Box<[u8]>>,
    /// Physical length when the transaction began
    old_len: u64,
    /// End of the highest dirty block
    end: u64,
    /// Extra transaction_start() calls absorbed under ALLOW_NESTING
    nesting: u32,
    /// An inner cancel happened; the outermost commit must fail
    poisoned: bool,
    /// Journal offset once prepared
    journal: Option<u64>,
}

impl Transaction {
    pub(crate) fn new(base_len: u64) -> Self {
        Transaction {
            blocks: BTreeMap::new(),
            old_len: base_len,
            end: 0,
            nesting: 0,
            poisoned: false,
            journal: None,
        }
    }

    pub(crate) fn nesting(&self) -> u32 {
        self.nesting
    }

    pub(crate) fn nest(&mut self) {
        self.nesting += 1;
    }

    /// Leave one nesting level. Returns false at the outermost level.
    pub(crate) fn unnest(&mut self) -> bool {
        if self.nesting == 0 {
            return false;
        }
        self.nesting -= 1;
        true
    }

    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    #[cfg(test)]
    pub(crate) fn dirty_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn read_view<'a>(&'a self, base: &'a dyn Storage) -> TxnReadView<'a> {
        TxnReadView { base, txn: self }
    }

    pub(crate) fn write_view<'a>(&'a mut self, base: &'a dyn Storage) -> TxnWriteView<'a> {
        TxnWriteView { base, txn: self }
    }

    fn size(&self, base: &dyn Storage) -> u64 {
        base.len().max(self.end)
    }

    fn read_at(&self, base: &dyn Storage, off: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = off + done as u64;
            let idx = pos / BLOCK;
            let in_block = (pos % BLOCK) as usize;
            let n = (BLOCK as usize - in_block).min(buf.len() - done);
            let dst = &mut buf[done..done + n];
            match self.blocks.get(&idx) {
                Some(block) => dst.copy_from_slice(&block[in_block..in_block + n]),
                None => read_base(base, pos, dst)?,
            }
            done += n;
        }
        Ok(())
    }

    fn write_at(&mut self, base: &dyn Storage, off: u64, data: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < data.len() {
            let pos = off + done as u64;
            let idx = pos / BLOCK;
            let in_block = (pos % BLOCK) as usize;
            let n = (BLOCK as usize - in_block).min(data.len() - done);

            if !self.blocks.contains_key(&idx) {
                let mut block = vec![0u8; BLOCK as usize].into_boxed_slice();
                read_base(base, idx * BLOCK, &mut block)?;
                self.blocks.insert(idx, block);
                self.end = self.end.max((idx + 1) * BLOCK);
            }
            if let Some(block) = self.blocks.get_mut(&idx) {
                block[in_block..in_block + n].copy_from_slice(&data[done..done + n]);
            }
            done += n;
        }
        Ok(())
    }

    /// Write the recovery journal and make it valid on disk.
    pub(crate) fn prepare(&mut self, storage: &mut dyn Storage, sync: bool) -> Result<()> {
        if self.journal.is_some() {
            return Err(Error::InvalidState("transaction already prepared"));
        }
        if !storage.is_durable() {
            // Nothing can tear an in-memory arena
            self.journal = Some(0);
            return Ok(());
        }

        let journal = align_up(storage.len().max(self.end));
        let mut body = Vec::new();
        for &idx in self.blocks.keys() {
            let start = idx * BLOCK;
            if start >= self.old_len {
                continue;
            }
            let len = BLOCK.min(self.old_len - start);
            let mut old = vec![0u8; len as usize];
            storage.read_at(start, &mut old)?;
            if start == 0 {
                // Replaying the header must not lose the journal pointer
                let at = HDR_RECOVERY as usize;
                old[at..at + 8].copy_from_slice(&journal.to_le_bytes());
            }
            body.extend_from_slice(&start.to_le_bytes());
            body.extend_from_slice(&len.to_le_bytes());
            body.extend_from_slice(&old);
        }

        let mut head = [0u8; RECOVERY_HEADER_SIZE as usize];
        head[0..8].copy_from_slice(&RECOVERY_INVALID_MAGIC.to_le_bytes());
        head[8..16].copy_from_slice(&(body.len() as u64).to_le_bytes());
        head[16..24].copy_from_slice(&self.old_len.to_le_bytes());
        head[24..28].copy_from_slice(&journal_checksum(self.old_len, &body).to_le_bytes());

        storage.write_at(journal, &head)?;
        storage.write_at(journal + RECOVERY_HEADER_SIZE, &body)?;
        storage.write_at(HDR_RECOVERY, &journal.to_le_bytes())?;
        if sync {
            storage.sync()?;
        }
        storage.write_at(journal, &RECOVERY_MAGIC.to_le_bytes())?;
        if sync {
            storage.sync()?;
        }

        debug!(
            "prepared transaction: {} dirty blocks, {} journal bytes at {}",
            self.blocks.len(),
            body.len(),
            journal
        );
        self.journal = Some(journal);
        Ok(())
    }

    /// Apply the staged blocks to the database. Prepares first if needed.
    pub(crate) fn commit(mut self, storage: &mut dyn Storage, sync: bool) -> Result<()> {
        if self.journal.is_none() {
            self.prepare(storage, sync)?;
        }
        let durable = storage.is_durable();
        let journal = self.journal.unwrap_or(0);

        let data_end = self.read_view(storage).read_u64(HDR_DATA_END)?;

        if durable {
            // The header block must keep pointing at the journal until the
            // data is safely down.
            if let Some(block) = self.blocks.get_mut(&0) {
                let at = HDR_RECOVERY as usize;
                block[at..at + 8].copy_from_slice(&journal.to_le_bytes());
            }
        }

        for (&idx, block) in &self.blocks {
            storage.write_at(idx * BLOCK, block)?;
        }

        if durable {
            if sync {
                storage.sync()?;
            }
            storage.write_at(journal, &RECOVERY_INVALID_MAGIC.to_le_bytes())?;
            storage.write_at(HDR_RECOVERY, &0u64.to_le_bytes())?;
        }
        storage.set_len(data_end)?;
        if durable && sync {
            storage.sync()?;
        }

        debug!("committed transaction, {} bytes of data", data_end);
        Ok(())
    }

    /// Throw the staged writes away, undoing a prepare if there was one.
    pub(crate) fn cancel(self, storage: &mut dyn Storage) -> Result<()> {
        if let Some(journal) = self.journal.filter(|_| storage.is_durable()) {
            storage.write_at(journal, &RECOVERY_INVALID_MAGIC.to_le_bytes())?;
            storage.write_at(HDR_RECOVERY, &0u64.to_le_bytes())?;
            storage.set_len(self.old_len)?;
        }
        debug!("cancelled transaction with {} dirty blocks", self.blocks.len());
        Ok(())
    }
}

fn read_base(base: &dyn Storage, pos: u64, dst: &mut [u8]) -> Result<()> {
    let avail = base.len().saturating_sub(pos).min(dst.len() as u64) as usize;
    if avail > 0 {
        base.read_at(pos, &mut dst[..avail])?;
    }
    dst[avail..].fill(0);
    Ok(())
}

fn journal_checksum(old_len: u64, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&old_len.to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}

/// Reads through a transaction's overlay.
pub(crate) struct TxnReadView<'a> {
    base: &'a dyn Storage,
    txn: &'a Transaction,
}

impl Access for TxnReadView<'_> {
    fn size(&self) -> u64 {
        self.txn.size(self.base)
    }

    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.txn.read_at(self.base, off, buf)
    }

    fn write_at(&mut self, _off: u64, _data: &[u8]) -> Result<()> {
        Err(Error::InvalidState("transaction view is read-only"))
    }

    fn own_journal(&self) -> Option<u64> {
        self.txn.journal
    }
}

/// Reads and writes through a transaction's overlay.
pub(crate) struct TxnWriteView<'a> {
    base: &'a dyn Storage,
    txn: &'a mut Transaction,
}

impl Access for TxnWriteView<'_> {
    fn size(&self) -> u64 {
        self.txn.size(self.base)
    }

    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.txn.read_at(self.base, off, buf)
    }

    fn write_at(&mut self, off: u64, data: &[u8]) -> Result<()> {
        self.txn.write_at(self.base, off, data)
    }

    fn own_journal(&self) -> Option<u64> {
        self.txn.journal
    }
}

/// Replay or discard a journal left behind by a crashed commit.
///
/// Must be called with the exclusive lock held. Returns whether anything
/// had to be done.
pub(crate) fn recover(storage: &mut dyn Storage, sync: bool) -> Result<bool> {
    if !needs_recovery(storage)? {
        return Ok(false);
    }

    let header = Header::read(&BaseView::new(storage))?;
    let journal = header.recovery;
    let head = read_journal_head(storage, journal)?;

    match head {
        Some((magic, body_len, old_len, crc)) if magic == RECOVERY_MAGIC => {
            if old_len > journal {
                return Err(Error::corrupt("recovery journal overlaps the data"));
            }
            let body =
                BaseView::new(storage).read_vec(journal + RECOVERY_HEADER_SIZE, body_len)?;
            if journal_checksum(old_len, &body) != crc {
                return Err(Error::corrupt("recovery journal checksum mismatch"));
            }
            let mut pos = 0usize;
            let mut restored = 0usize;
            while pos < body.len() {
                let entry = body
                    .get(pos..pos + 16)
                    .ok_or_else(|| Error::corrupt("truncated recovery entry"))?;
                let (off, len) = entry.split_at(8);
                let off = le_u64(off)?;
                let len = le_u64(len)? as usize;
                let bytes = body
                    .get(pos + 16..pos + 16 + len)
                    .ok_or_else(|| Error::corrupt("truncated recovery entry"))?;
                storage.write_at(off, bytes)?;
                pos += 16 + len;
                restored += 1;
            }
            if sync {
                storage.sync()?;
            }
            storage.write_at(HDR_RECOVERY, &0u64.to_le_bytes())?;
            storage.set_len(old_len)?;
            if sync {
                storage.sync()?;
            }
            info!(
                "recovered from interrupted transaction: restored {} blocks, length {}",
                restored, old_len
            );
        }
        _ => {
            // The journal never became valid, so the data was never touched
            if header.data_end > storage.len() {
                return Err(Error::corrupt("data end beyond end of file"));
            }
            warn!("discarding incomplete recovery journal at {}", journal);
            storage.write_at(HDR_RECOVERY, &0u64.to_le_bytes())?;
            storage.set_len(header.data_end)?;
            if sync {
                storage.sync()?;
            }
        }
    }
    Ok(true)
}

/// Cheap check done on every fresh lock acquisition. Also refuses files
/// whose header is not ours, so nothing is ever "recovered" into them.
pub(crate) fn needs_recovery(storage: &dyn Storage) -> Result<bool> {
    if storage.len() < HEADER_SIZE {
        return Ok(false);
    }
    Ok(Header::read(&BaseView::new(storage))?.recovery != 0)
}

fn le_u64(bytes: &[u8]) -> Result<u64> {
    let word: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::corrupt("malformed recovery entry"))?;
    Ok(u64::from_le_bytes(word))
}

fn read_journal_head(storage: &dyn Storage, journal: u64) -> Result<Option<(u64, u64, u64, u32)>> {
    if journal.saturating_add(RECOVERY_HEADER_SIZE) > storage.len() {
        return Ok(None);
    }
    let mut head = [0u8; RECOVERY_HEADER_SIZE as usize];
    storage.read_at(journal, &mut head)?;
    let word = |at: usize| {
        let mut w = [0u8; 8];
        w.copy_from_slice(&head[at..at + 8]);
        u64::from_le_bytes(w)
    };
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&head[24..28]);
    Ok(Some((word(0), word(8), word(16), u32::from_le_bytes(crc))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::HDR_SEQNUM;
    use crate::io::{FileStorage, MemStorage};
    use std::fs::OpenOptions;

    /// A file holding just an empty database header. Returns its data end.
    fn file_storage() -> (tempfile::TempDir, FileStorage, u64) {
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("txn.tdb"))
            .unwrap();
        let mut storage = FileStorage::new(file, true, false).unwrap();
        let header = Header::new(4, 1);
        storage.write_at(0, &header.encode()).unwrap();
        storage.set_len(header.data_end).unwrap();
        (dir, storage, header.data_end)
    }

    #[test]
    fn overlay_reads_own_writes_and_leaves_base_alone() {
        let mut base = MemStorage::new();
        base.write_at(0, &[1u8; 64]).unwrap();

        let mut txn = Transaction::new(base.len());
        txn.write_view(&base).write_at(10, b"xyz").unwrap();

        let mut buf = [0u8; 5];
        txn.read_view(&base).read_at(9, &mut buf).unwrap();
        assert_eq!(&buf, &[1, b'x', b'y', b'z', 1]);

        let mut buf = [0u8; 3];
        base.read_at(10, &mut buf).unwrap();
        assert_eq!(buf, [1, 1, 1]);
    }

    #[test]
    fn writes_spanning_blocks_are_split() {
        let base = MemStorage::new();
        let mut txn = Transaction::new(0);
        let data = vec![7u8; BLOCK as usize + 10];
        txn.write_view(&base).write_at(BLOCK - 5, &data).unwrap();
        assert_eq!(txn.dirty_blocks(), 3);
        assert_eq!(
            txn.read_view(&base).read_vec(BLOCK - 5, data.len() as u64).unwrap(),
            data
        );
    }

    #[test]
    fn commit_applies_and_clears_journal() {
        let (_dir, mut storage, end) = file_storage();
        let mut txn = Transaction::new(storage.len());
        {
            let mut view = txn.write_view(&storage);
            view.write_u64(HDR_DATA_END, end + 8).unwrap();
            view.write_u64(end, 0xabcd).unwrap();
        }
        txn.commit(&mut storage, true).unwrap();

        let view = BaseView::new(&storage);
        assert_eq!(view.read_u64(end).unwrap(), 0xabcd);
        assert_eq!(view.read_u64(HDR_RECOVERY).unwrap(), 0);
        assert_eq!(storage.len(), end + 8);
        assert!(!needs_recovery(&storage).unwrap());
    }

    #[test]
    fn prepared_journal_rolls_back_after_crash() {
        let (_dir, mut storage, end) = file_storage();
        let mut txn = Transaction::new(storage.len());
        txn.write_view(&storage).write_u64(HDR_DATA_END, 4096).unwrap();
        txn.prepare(&mut storage, true).unwrap();
        assert!(needs_recovery(&storage).unwrap());

        // Simulate a torn commit: scribble over the live header area.
        storage.write_at(HDR_DATA_END, &999u64.to_le_bytes()).unwrap();
        drop(txn);

        assert!(recover(&mut storage, true).unwrap());
        let view = BaseView::new(&storage);
        assert_eq!(view.read_u64(HDR_DATA_END).unwrap(), end);
        assert_eq!(view.read_u64(HDR_RECOVERY).unwrap(), 0);
        assert_eq!(storage.len(), end);
        assert!(!recover(&mut storage, true).unwrap());
    }

    #[test]
    fn interrupted_recovery_can_be_resumed() {
        let (_dir, mut storage, _) = file_storage();
        storage.set_len(2 * BLOCK).unwrap();
        storage.write_at(HDR_DATA_END, &(2 * BLOCK).to_le_bytes()).unwrap();
        storage.write_at(5000, &0xaaaau64.to_le_bytes()).unwrap();

        let mut txn = Transaction::new(storage.len());
        {
            let mut view = txn.write_view(&storage);
            view.write_u64(HDR_SEQNUM, 7).unwrap();
            view.write_u64(5000, 0xbbbb).unwrap();
        }
        txn.prepare(&mut storage, false).unwrap();
        drop(txn);

        // Torn commit, then a crash right after replaying the first entry
        storage.write_at(5000, &0xbbbbu64.to_le_bytes()).unwrap();
        let journal = BaseView::new(&storage).read_u64(HDR_RECOVERY).unwrap();
        let entry = journal + RECOVERY_HEADER_SIZE;
        let off = BaseView::new(&storage).read_u64(entry).unwrap();
        let len = BaseView::new(&storage).read_u64(entry + 8).unwrap();
        assert_eq!(off, 0);
        let first = BaseView::new(&storage).read_vec(entry + 16, len).unwrap();
        storage.write_at(off, &first).unwrap();

        assert!(needs_recovery(&storage).unwrap());
        assert!(recover(&mut storage, false).unwrap());
        let view = BaseView::new(&storage);
        assert_eq!(view.read_u64(5000).unwrap(), 0xaaaa);
        assert_eq!(view.read_u64(HDR_SEQNUM).unwrap(), 0);
        assert_eq!(view.read_u64(HDR_RECOVERY).unwrap(), 0);
        assert_eq!(storage.len(), 2 * BLOCK);
    }

    #[test]
    fn incomplete_journal_is_discarded() {
        let (_dir, mut storage, end) = file_storage();
        // Header points at a journal whose magic never got written
        storage.write_at(end + 64, &[0u8; 64]).unwrap();
        storage.write_at(HDR_RECOVERY, &(end + 64).to_le_bytes()).unwrap();

        assert!(recover(&mut storage, false).unwrap());
        assert_eq!(storage.len(), end);
        assert!(!needs_recovery(&storage).unwrap());
    }

    #[test]
    fn cancel_after_prepare_discards_journal() {
        let (_dir, mut storage, end) = file_storage();
        let mut txn = Transaction::new(storage.len());
        txn.write_view(&storage).write_u64(HEADER_SIZE - 8, 5).unwrap();
        txn.prepare(&mut storage, false).unwrap();
        txn.cancel(&mut storage).unwrap();
        assert!(!needs_recovery(&storage).unwrap());
        assert_eq!(storage.len(), end);
    }

    #[test]
    fn foreign_header_is_never_recovered() {
        let (_dir, mut storage, _) = file_storage();
        storage.write_at(0, b"not a database!!").unwrap();
        assert!(matches!(needs_recovery(&storage), Err(Error::Corrupt(_))));
    }
}
