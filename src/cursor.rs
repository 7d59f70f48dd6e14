use std::collections::VecDeque;

use crate::database::Records;
use crate::error::{Error, Result};
use crate::handle::Tdb;
use crate::io::Access;
use crate::meta::RecordHeader;

impl<A: Access + ?Sized> Records<'_, A> {
    /// The first non-empty chain at or after `from`, with the bucket to
    /// resume at. `None` once the directory is exhausted.
    pub(crate) fn next_chain(
        &self,
        from: u64,
    ) -> Result<Option<(u64, Vec<(u64, RecordHeader)>)>> {
        for bucket in from..self.layout.buckets() {
            if self.chain_head(bucket)? != 0 {
                return Ok(Some((bucket + 1, self.chain(bucket)?)));
            }
        }
        Ok(None)
    }

    pub(crate) fn first_key(&self) -> Result<Option<Vec<u8>>> {
        self.first_key_from(0)
    }

    /// The key after `key` in traversal order.
    pub(crate) fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let found = self.find(key)?.ok_or(Error::NotFound)?;
        if found.rec.next != 0 {
            let data_end = self.data_end()?;
            let rec = RecordHeader::read(&*self.io, found.rec.next, data_end)?;
            return self.read_key(found.rec.next, &rec).map(Some);
        }
        self.first_key_from(self.layout.bucket_of(found.rec.hash) + 1)
    }

    fn first_key_from(&self, bucket: u64) -> Result<Option<Vec<u8>>> {
        match self.next_chain(bucket)? {
            Some((_, chain)) => {
                let (off, rec) = &chain[0];
                self.read_key(*off, rec).map(Some)
            }
            None => Ok(None),
        }
    }
}

/// Lazy traversal of every key in a database.
///
/// Keys are fetched one hash chain at a time, each under its own short read
/// lock, so other attachments can make progress between steps. A key stored
/// or deleted during the traversal may or may not be seen; keys left alone
/// are seen exactly once.
pub struct Keys<'a> {
    db: &'a Tdb,
    bucket: u64,
    pending: VecDeque<Vec<u8>>,
    done: bool,
}

impl<'a> Keys<'a> {
    fn new(db: &'a Tdb) -> Self {
        Keys {
            db,
            bucket: 0,
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl Iterator for Keys<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.pending.pop_front() {
                return Some(Ok(key));
            }
            if self.done {
                return None;
            }

            let from = self.bucket;
            let step = self.db.read(|records| match records.next_chain(from)? {
                Some((resume, chain)) => {
                    let keys = chain
                        .iter()
                        .map(|(off, rec)| records.read_key(*off, rec))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Some((resume, keys)))
                }
                None => Ok(None),
            });
            match step {
                Ok(Some((resume, keys))) => {
                    self.bucket = resume;
                    self.pending.extend(keys);
                }
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Tdb {
    /// Start a new traversal of all keys.
    pub fn iter(&self) -> Keys<'_> {
        Keys::new(self)
    }

    /// Every key, gathered under a single read lock.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.read(|records| {
            let mut keys = Vec::new();
            for bucket in 0..records.layout.buckets() {
                if records.chain_head(bucket)? != 0 {
                    keys.extend(records.chain_keys(bucket)?);
                }
            }
            Ok(keys)
        })
    }

    pub fn first_key(&self) -> Result<Option<Vec<u8>>> {
        self.read(|records| records.first_key())
    }

    /// Fails with `NotFound` if `key` itself is gone.
    pub fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read(|records| records.next_key(key))
    }

    /// Call `f` with every record until it returns `false`. Returns the
    /// number of records visited.
    ///
    /// `f` runs without any lock held and may itself use the database.
    pub fn traverse<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let mut count = 0;
        let mut bucket = 0;
        loop {
            let from = bucket;
            let step = self.read(|records| match records.next_chain(from)? {
                Some((resume, chain)) => {
                    let pairs = chain
                        .iter()
                        .map(|(off, rec)| {
                            Ok((records.read_key(*off, rec)?, records.read_data(*off, rec)?))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Some((resume, pairs)))
                }
                None => Ok(None),
            })?;
            let Some((resume, pairs)) = step else {
                return Ok(count);
            };
            for (key, data) in pairs {
                count += 1;
                if !f(&key, &data) {
                    return Ok(count);
                }
            }
            bucket = resume;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::database::tests::arena;
    use crate::database::Records;
    use crate::types::StoreMode;

    #[test]
    fn first_and_next_key_visit_everything_once() {
        let (mem, mut txn, layout) = arena(4);
        let mut view = txn.write_view(&mem);
        let mut records = Records::new(&mut view, layout);
        for i in 0..30u32 {
            records
                .store(format!("k{}", i).as_bytes(), b"v", StoreMode::Replace)
                .unwrap();
        }

        let mut seen = HashSet::new();
        let mut cursor = records.first_key().unwrap();
        while let Some(key) = cursor {
            assert!(seen.insert(key.clone()), "duplicate key");
            cursor = records.next_key(&key).unwrap();
        }
        assert_eq!(seen.len(), 30);
    }

    #[test]
    fn next_key_of_missing_key_fails() {
        let (mem, mut txn, layout) = arena(4);
        let mut view = txn.write_view(&mem);
        let records = Records::new(&mut view, layout);
        assert_eq!(records.first_key().unwrap(), None);
        assert!(records.next_key(b"nope").unwrap_err().is_not_found());
    }
}
