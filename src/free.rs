//! Free-space management for the record store.
//!
//! Freed records go on a singly linked free list threaded through their
//! headers. Allocation is first fit; oversized free records are split, and a
//! freed record swallows any free records directly after it. When nothing
//! fits the record area grows at `data_end`.

use log::debug;

use crate::constants::{MAX_EXPANSION, MIN_FREE_BODY, RECORD_HEADER_SIZE, REC_NEXT};
use crate::database::Records;
use crate::error::{Error, Result};
use crate::io::Access;
use crate::meta::{align_up, RecordHeader};

impl<A: Access + ?Sized> Records<'_, A> {
    /// Find room for a record body of `body` bytes. Returns the record
    /// offset and the capacity actually granted (at least `body`).
    pub(crate) fn alloc(&mut self, body: u64) -> Result<(u64, u64)> {
        let data_end = self.data_end()?;
        let limit = self.max_records(data_end);

        let mut prev: Option<u64> = None;
        let mut off = self.free_head()?;
        let mut steps = 0u64;
        while off != 0 {
            steps += 1;
            if steps > limit {
                return Err(Error::corrupt("free list loops"));
            }
            let rec = RecordHeader::read(&*self.io, off, data_end)?;
            if !rec.is_free() {
                return Err(Error::corrupt(format!("used record {} on free list", off)));
            }

            if rec.capacity >= body {
                let spare = rec.capacity - body;
                if spare >= RECORD_HEADER_SIZE + MIN_FREE_BODY {
                    // Split: the tail stays free and takes our list slot
                    let tail = off + RECORD_HEADER_SIZE + body;
                    RecordHeader::free(spare - RECORD_HEADER_SIZE, rec.next).write(self.io, tail)?;
                    self.relink_free(prev, tail)?;
                    return Ok((off, body));
                }
                self.relink_free(prev, rec.next)?;
                return Ok((off, rec.capacity));
            }
            prev = Some(off);
            off = rec.next;
        }

        self.expand(body, data_end)
    }

    /// Put a record's space back on the free list.
    pub(crate) fn free(&mut self, off: u64, capacity: u64) -> Result<()> {
        let mut data_end = self.data_end()?;
        let mut capacity = capacity;

        // Merge with free neighbours to the right
        loop {
            let next = off + RECORD_HEADER_SIZE + capacity;
            if next + RECORD_HEADER_SIZE > data_end {
                break;
            }
            let rec = RecordHeader::read(&*self.io, next, data_end)?;
            if !rec.is_free() {
                break;
            }
            self.unlink_free(next)?;
            capacity += rec.total_len();
        }

        // Space at the very end simply goes away
        if off + RECORD_HEADER_SIZE + capacity == data_end {
            data_end = off;
            return self.set_data_end(data_end);
        }

        let head = self.free_head()?;
        RecordHeader::free(capacity, head).write(self.io, off)?;
        self.set_free_head(off)
    }

    /// Grow the record area to fit a `body`-byte record. Growth is
    /// amortised; the surplus becomes a free record.
    fn expand(&mut self, body: u64, data_end: u64) -> Result<(u64, u64)> {
        let needed = RECORD_HEADER_SIZE + body;
        let slack = align_up((data_end / 4).min(MAX_EXPANSION));
        let growth = needed.max(slack);
        let off = data_end;
        self.set_data_end(data_end + growth)?;
        debug!("expanding record area by {} bytes at {}", growth, off);

        let spare = growth - needed;
        if spare >= RECORD_HEADER_SIZE + MIN_FREE_BODY {
            let tail = off + needed;
            let head = self.free_head()?;
            RecordHeader::free(spare - RECORD_HEADER_SIZE, head).write(self.io, tail)?;
            self.set_free_head(tail)?;
            Ok((off, body))
        } else {
            Ok((off, growth - RECORD_HEADER_SIZE))
        }
    }

    /// Make `prev` (or the list head) point at `next`.
    fn relink_free(&mut self, prev: Option<u64>, next: u64) -> Result<()> {
        match prev {
            Some(p) => self.io.write_u64(p + REC_NEXT, next),
            None => self.set_free_head(next),
        }
    }

    fn unlink_free(&mut self, target: u64) -> Result<()> {
        let data_end = self.data_end()?;
        let limit = self.max_records(data_end);
        let mut prev = None;
        let mut off = self.free_head()?;
        let mut steps = 0u64;
        while off != 0 {
            steps += 1;
            if steps > limit {
                return Err(Error::corrupt("free list loops"));
            }
            let rec = RecordHeader::read(&*self.io, off, data_end)?;
            if off == target {
                return self.relink_free(prev, rec.next);
            }
            prev = Some(off);
            off = rec.next;
        }
        Err(Error::corrupt(format!("free record {} missing from free list", target)))
    }

    /// Offsets and capacities of everything on the free list.
    pub(crate) fn free_list(&self) -> Result<Vec<(u64, u64)>> {
        let data_end = self.data_end()?;
        let limit = self.max_records(data_end);
        let mut out = Vec::new();
        let mut off = self.free_head()?;
        while off != 0 {
            if out.len() as u64 >= limit {
                return Err(Error::corrupt("free list loops"));
            }
            let rec = RecordHeader::read(&*self.io, off, data_end)?;
            if !rec.is_free() {
                return Err(Error::corrupt(format!("used record {} on free list", off)));
            }
            out.push((off, rec.capacity));
            off = rec.next;
        }
        Ok(out)
    }
}
