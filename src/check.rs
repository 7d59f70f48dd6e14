use std::collections::HashMap;

use crate::constants::{HDR_RECOVERY, RECORD_HEADER_SIZE};
use crate::database::Records;
use crate::error::{Error, Result};
use crate::io::Access;
use crate::meta::{Header, RecordHeader};
use crate::types::Summary;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Seen {
    Unvisited,
    Visited,
}

impl<A: Access + ?Sized> Records<'_, A> {
    /// Full structural check.
    ///
    /// Every record between the bucket directory and `data_end` must parse,
    /// the records must tile that area exactly, and each one must be reachable
    /// exactly once: used records through the chain of their own bucket, free
    /// ones through the free list. `visit` sees every live key/value pair and
    /// may veto it.
    pub(crate) fn check(
        &self,
        mut visit: Option<&mut dyn FnMut(&[u8], &[u8]) -> Result<()>>,
    ) -> Result<()> {
        let header = Header::read(&*self.io)?;
        if header.layout() != self.layout {
            return Err(Error::corrupt("header geometry changed under an open handle"));
        }
        let recovery = self.io.read_u64(HDR_RECOVERY)?;
        if recovery != 0 && self.io.own_journal() != Some(recovery) {
            return Err(Error::corrupt("unrecovered transaction journal"));
        }
        let data_end = header.data_end;
        if data_end > self.io.size() {
            return Err(Error::corrupt(format!(
                "data end {} beyond file size {}",
                data_end,
                self.io.size()
            )));
        }

        // Linear scan
        let mut used: HashMap<u64, Seen> = HashMap::new();
        let mut free: HashMap<u64, Seen> = HashMap::new();
        let mut off = self.layout.records_start();
        while off < data_end {
            let rec = RecordHeader::read(&*self.io, off, data_end)?;
            if rec.is_used() {
                used.insert(off, Seen::Unvisited);
            } else {
                free.insert(off, Seen::Unvisited);
            }
            off += rec.total_len();
        }
        if off != data_end {
            return Err(Error::corrupt("records do not tile the data area"));
        }

        // Hash chains
        for bucket in 0..self.layout.buckets() {
            for (off, rec) in self.chain(bucket)? {
                match used.get_mut(&off) {
                    Some(seen) if *seen == Seen::Unvisited => *seen = Seen::Visited,
                    Some(_) => {
                        return Err(Error::corrupt(format!("record {} linked twice", off)))
                    }
                    None => {
                        return Err(Error::corrupt(format!(
                            "chain {} points into the middle of a record ({})",
                            bucket, off
                        )))
                    }
                }
                if self.layout.bucket_of(rec.hash) != bucket {
                    return Err(Error::corrupt(format!("record {} in wrong bucket", off)));
                }
                let key = self.read_key(off, &rec)?;
                if self.layout.hash(&key) != rec.hash {
                    return Err(Error::corrupt(format!("record {} has a stale hash", off)));
                }
                if let Some(visit) = visit.as_mut() {
                    let data = self.read_data(off, &rec)?;
                    visit(&key, &data)?;
                }
            }
        }

        // Free list
        for (off, _) in self.free_list()? {
            match free.get_mut(&off) {
                Some(seen) if *seen == Seen::Unvisited => *seen = Seen::Visited,
                _ => {
                    return Err(Error::corrupt(format!(
                        "free list entry {} is bogus or duplicated",
                        off
                    )))
                }
            }
        }

        if let Some((off, _)) = used.iter().find(|(_, s)| **s == Seen::Unvisited) {
            return Err(Error::corrupt(format!("record {} is unreachable", off)));
        }
        if let Some((off, _)) = free.iter().find(|(_, s)| **s == Seen::Unvisited) {
            return Err(Error::corrupt(format!("free record {} is leaked", off)));
        }
        Ok(())
    }

    pub(crate) fn summary(&self) -> Result<Summary> {
        let data_end = self.data_end()?;
        let mut summary = Summary {
            size: data_end,
            buckets: self.layout.buckets(),
            ..Summary::default()
        };

        for bucket in 0..self.layout.buckets() {
            let chain = self.chain(bucket)?;
            if chain.is_empty() {
                continue;
            }
            summary.buckets_used += 1;
            summary.max_chain = summary.max_chain.max(chain.len() as u64);
            for (_, rec) in chain {
                summary.records += 1;
                summary.key_bytes += rec.key_len;
                summary.data_bytes += rec.data_len;
                summary.slack_bytes += rec.capacity - rec.key_len - rec.data_len;
                summary.overhead_bytes += RECORD_HEADER_SIZE;
            }
        }
        for (_, capacity) in self.free_list()? {
            summary.free_records += 1;
            summary.free_bytes += capacity;
            summary.overhead_bytes += RECORD_HEADER_SIZE;
        }
        Ok(summary)
    }
}
