use log::debug;

use crate::constants::{HDR_DATA_END, HDR_FREE_HEAD, HDR_SEQNUM, RECORD_HEADER_SIZE, REC_NEXT};
use crate::error::{Error, Result};
use crate::io::Access;
use crate::meta::{align_up, Layout, RecordHeader};
use crate::types::StoreMode;

/// Record store: hash-chained key/value records over an `Access` view.
///
/// Each bucket slot in the directory holds the offset of the first record of
/// its chain (0 for empty). Records are variable length and tile the area
/// between the directory and `data_end`; unused ones sit on the free list.
pub(crate) struct Records<'a, A: Access + ?Sized> {
    pub(crate) io: &'a mut A,
    pub(crate) layout: Layout,
}

/// The record store as handed to handle operations, over whichever view
/// (base file or transaction overlay) applies.
pub(crate) type View<'a> = Records<'a, dyn Access + 'a>;

/// A located record and its predecessor in the chain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Found {
    pub(crate) off: u64,
    /// Previous record in the chain, `None` if the bucket points at us
    pub(crate) prev: Option<u64>,
    pub(crate) rec: RecordHeader,
}

impl<'a, A: Access + ?Sized> Records<'a, A> {
    pub(crate) fn new(io: &'a mut A, layout: Layout) -> Self {
        Records { io, layout }
    }

    pub(crate) fn data_end(&self) -> Result<u64> {
        self.io.read_u64(HDR_DATA_END)
    }

    pub(crate) fn set_data_end(&mut self, end: u64) -> Result<()> {
        self.io.write_u64(HDR_DATA_END, end)
    }

    pub(crate) fn free_head(&self) -> Result<u64> {
        self.io.read_u64(HDR_FREE_HEAD)
    }

    pub(crate) fn set_free_head(&mut self, off: u64) -> Result<()> {
        self.io.write_u64(HDR_FREE_HEAD, off)
    }

    pub(crate) fn chain_head(&self, bucket: u64) -> Result<u64> {
        self.io.read_u64(self.layout.bucket_offset(bucket))
    }

    fn set_chain_head(&mut self, bucket: u64, off: u64) -> Result<()> {
        let slot = self.layout.bucket_offset(bucket);
        self.io.write_u64(slot, off)
    }

    /// Upper bound on chain/free-list walks, so a looped list is caught.
    pub(crate) fn max_records(&self, data_end: u64) -> u64 {
        (data_end - self.layout.records_start()) / RECORD_HEADER_SIZE + 1
    }

    pub(crate) fn read_key(&self, off: u64, rec: &RecordHeader) -> Result<Vec<u8>> {
        self.io.read_vec(RecordHeader::key_offset(off), rec.key_len)
    }

    pub(crate) fn read_data(&self, off: u64, rec: &RecordHeader) -> Result<Vec<u8>> {
        self.io.read_vec(rec.data_offset(off), rec.data_len)
    }

    pub(crate) fn find(&self, key: &[u8]) -> Result<Option<Found>> {
        let hash = self.layout.hash(key);
        let bucket = self.layout.bucket_of(hash);
        let data_end = self.data_end()?;
        let limit = self.max_records(data_end);

        let mut off = self.chain_head(bucket)?;
        let mut prev = None;
        let mut steps = 0u64;
        while off != 0 {
            steps += 1;
            if steps > limit {
                return Err(Error::corrupt(format!("hash chain {} loops", bucket)));
            }
            let rec = RecordHeader::read(&*self.io, off, data_end)?;
            if !rec.is_used() {
                return Err(Error::corrupt(format!("free record {} in hash chain", off)));
            }
            if rec.hash == hash
                && rec.key_len == key.len() as u64
                && self.read_key(off, &rec)? == key
            {
                return Ok(Some(Found { off, prev, rec }));
            }
            prev = Some(off);
            off = rec.next;
        }
        Ok(None)
    }

    pub(crate) fn fetch(&self, key: &[u8]) -> Result<Vec<u8>> {
        let found = self.find(key)?.ok_or(Error::NotFound)?;
        self.read_data(found.off, &found.rec)
    }

    pub(crate) fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    pub(crate) fn store(&mut self, key: &[u8], data: &[u8], mode: StoreMode) -> Result<()> {
        let found = self.find(key)?;
        match (mode, &found) {
            (StoreMode::Insert, Some(_)) => return Err(Error::Exists),
            (StoreMode::Modify, None) => return Err(Error::NotFound),
            _ => {}
        }

        let needed = key.len() as u64 + data.len() as u64;
        if let Some(found) = found {
            if found.rec.capacity >= needed {
                // Fits where it is: rewrite the data and length only
                let mut rec = found.rec;
                rec.data_len = data.len() as u64;
                self.io.write_at(rec.data_offset(found.off), data)?;
                return rec.write(self.io, found.off);
            }
            self.remove(&found)?;
        }
        self.insert(key, data)
    }

    pub(crate) fn append(&mut self, key: &[u8], extra: &[u8]) -> Result<()> {
        let Some(found) = self.find(key)? else {
            return self.insert(key, extra);
        };

        let mut rec = found.rec;
        let needed = rec.key_len + rec.data_len + extra.len() as u64;
        if rec.capacity >= needed {
            self.io
                .write_at(rec.data_offset(found.off) + rec.data_len, extra)?;
            rec.data_len += extra.len() as u64;
            return rec.write(self.io, found.off);
        }

        let mut data = self.read_data(found.off, &rec)?;
        data.extend_from_slice(extra);
        self.remove(&found)?;
        self.insert(key, &data)
    }

    pub(crate) fn delete(&mut self, key: &[u8]) -> Result<()> {
        let found = self.find(key)?.ok_or(Error::NotFound)?;
        self.remove(&found)
    }

    /// Forget every record and give the space back.
    pub(crate) fn wipe_all(&mut self) -> Result<()> {
        let directory = vec![0u8; (self.layout.buckets() * 8) as usize];
        self.io.write_at(self.layout.bucket_offset(0), &directory)?;
        self.set_free_head(0)?;
        let start = self.layout.records_start();
        self.set_data_end(start)
    }

    /// Rewrite every live record back to back from the start of the record
    /// area, dropping the holes left by deletes.
    pub(crate) fn repack(&mut self) -> Result<()> {
        let mut live = Vec::new();
        for bucket in 0..self.layout.buckets() {
            live.extend(self.chain_records(bucket)?);
        }
        let before = self.data_end()?;
        self.wipe_all()?;
        // Chains are built head-first, so reinsert backwards to keep order
        for (key, data) in live.iter().rev() {
            self.insert(key, data)?;
        }
        debug!(
            "repacked {} records: {} -> {} bytes",
            live.len(),
            before,
            self.data_end()?
        );
        Ok(())
    }

    pub(crate) fn bump_seqnum(&mut self) -> Result<u64> {
        let next = self.io.read_u64(HDR_SEQNUM)?.wrapping_add(1);
        self.io.write_u64(HDR_SEQNUM, next)?;
        Ok(next)
    }

    pub(crate) fn seqnum(&self) -> Result<u64> {
        self.io.read_u64(HDR_SEQNUM)
    }

    /// Offsets and headers of every record in one chain.
    pub(crate) fn chain(&self, bucket: u64) -> Result<Vec<(u64, RecordHeader)>> {
        let data_end = self.data_end()?;
        let limit = self.max_records(data_end);
        let mut out = Vec::new();
        let mut off = self.chain_head(bucket)?;
        while off != 0 {
            if out.len() as u64 >= limit {
                return Err(Error::corrupt(format!("hash chain {} loops", bucket)));
            }
            let rec = RecordHeader::read(&*self.io, off, data_end)?;
            if !rec.is_used() {
                return Err(Error::corrupt(format!("free record {} in hash chain", off)));
            }
            out.push((off, rec));
            off = rec.next;
        }
        Ok(out)
    }

    pub(crate) fn chain_keys(&self, bucket: u64) -> Result<Vec<Vec<u8>>> {
        self.chain(bucket)?
            .iter()
            .map(|(off, rec)| self.read_key(*off, rec))
            .collect()
    }

    pub(crate) fn chain_records(&self, bucket: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.chain(bucket)?
            .iter()
            .map(|(off, rec)| Ok((self.read_key(*off, rec)?, self.read_data(*off, rec)?)))
            .collect()
    }

    /// Number of live records, by walking every chain.
    pub(crate) fn count(&self) -> Result<u64> {
        let mut total = 0u64;
        for bucket in 0..self.layout.buckets() {
            if self.chain_head(bucket)? != 0 {
                total += self.chain(bucket)?.len() as u64;
            }
        }
        Ok(total)
    }

    fn insert(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        let hash = self.layout.hash(key);
        let bucket = self.layout.bucket_of(hash);
        let body = align_up(key.len() as u64 + data.len() as u64);

        let (off, capacity) = self.alloc(body)?;
        let head = self.chain_head(bucket)?;
        let rec = RecordHeader::used(key.len() as u64, data.len() as u64, capacity, hash, head);
        rec.write(self.io, off)?;
        self.io.write_at(RecordHeader::key_offset(off), key)?;
        self.io.write_at(rec.data_offset(off), data)?;
        self.set_chain_head(bucket, off)
    }

    /// Unlink from the hash chain and release the space.
    fn remove(&mut self, found: &Found) -> Result<()> {
        match found.prev {
            Some(prev) => self.io.write_u64(prev + REC_NEXT, found.rec.next)?,
            None => {
                let bucket = self.layout.bucket_of(found.rec.hash);
                self.set_chain_head(bucket, found.rec.next)?
            }
        }
        self.free(found.off, found.rec.capacity)
    }
}
