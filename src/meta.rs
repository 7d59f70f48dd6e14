use crate::constants::{
    FILE_MAGIC, FORMAT_VERSION, FREE_MAGIC, HDR_DATA_END, HDR_FREE_HEAD, HDR_HASH_BITS,
    HDR_HASH_SEED, HDR_MAGIC, HDR_RECOVERY, HDR_SEQNUM, HDR_VERSION, HEADER_SIZE, MAX_HASH_BITS,
    MIN_HASH_BITS, RECORD_ALIGN, RECORD_HEADER_SIZE, REC_CAPACITY, REC_DATA_LEN, REC_HASH,
    REC_KEY_LEN, REC_MAGIC, REC_NEXT, USED_MAGIC,
};
use crate::error::{Error, Result};
use crate::hash::hash_key;
use crate::io::Access;

/// Database file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    /// Format version number
    pub(crate) version: u64,
    /// Seed mixed into every key hash
    pub(crate) hash_seed: u64,
    /// log2 of the bucket count
    pub(crate) hash_bits: u32,
    /// End of the record area; bytes past it are not part of the database
    pub(crate) data_end: u64,
    /// First record on the free list, 0 if empty
    pub(crate) free_head: u64,
    /// Offset of a transaction recovery journal, 0 if none
    pub(crate) recovery: u64,
    /// Mutation counter (only maintained with SEQNUM)
    pub(crate) seqnum: u64,
}

impl Header {
    pub(crate) fn new(hash_bits: u32, hash_seed: u64) -> Self {
        let layout = Layout {
            hash_bits,
            seed: hash_seed,
        };
        Header {
            version: FORMAT_VERSION,
            hash_seed,
            hash_bits,
            data_end: layout.records_start(),
            free_head: 0,
            recovery: 0,
            seqnum: 0,
        }
    }

    pub(crate) fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        let put = |buf: &mut [u8], off: u64, v: u64| {
            buf[off as usize..off as usize + 8].copy_from_slice(&v.to_le_bytes());
        };
        buf[HDR_MAGIC as usize..HDR_MAGIC as usize + FILE_MAGIC.len()].copy_from_slice(FILE_MAGIC);
        put(&mut buf, HDR_VERSION, self.version);
        put(&mut buf, HDR_HASH_SEED, self.hash_seed);
        put(&mut buf, HDR_HASH_BITS, self.hash_bits as u64);
        put(&mut buf, HDR_DATA_END, self.data_end);
        put(&mut buf, HDR_FREE_HEAD, self.free_head);
        put(&mut buf, HDR_RECOVERY, self.recovery);
        put(&mut buf, HDR_SEQNUM, self.seqnum);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(Error::corrupt("header truncated"));
        }
        if &buf[HDR_MAGIC as usize..HDR_MAGIC as usize + FILE_MAGIC.len()] != FILE_MAGIC {
            return Err(Error::corrupt("bad magic, not a trivdb file"));
        }
        let get = |off: u64| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&buf[off as usize..off as usize + 8]);
            u64::from_le_bytes(word)
        };

        let version = get(HDR_VERSION);
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported format version {} (expected {})",
                version, FORMAT_VERSION
            )));
        }
        let hash_bits = get(HDR_HASH_BITS);
        if !(MIN_HASH_BITS as u64..=MAX_HASH_BITS as u64).contains(&hash_bits) {
            return Err(Error::corrupt(format!("hash bits {} out of range", hash_bits)));
        }

        let header = Header {
            version,
            hash_seed: get(HDR_HASH_SEED),
            hash_bits: hash_bits as u32,
            data_end: get(HDR_DATA_END),
            free_head: get(HDR_FREE_HEAD),
            recovery: get(HDR_RECOVERY),
            seqnum: get(HDR_SEQNUM),
        };
        if header.data_end < header.layout().records_start() {
            return Err(Error::corrupt("data end precedes record area"));
        }
        Ok(header)
    }

    pub(crate) fn read<A: Access + ?Sized>(io: &A) -> Result<Self> {
        if io.size() < HEADER_SIZE {
            return Err(Error::corrupt("file too small for header"));
        }
        let mut buf = [0u8; HEADER_SIZE as usize];
        io.read_at(0, &mut buf)?;
        Header::decode(&buf)
    }

    pub(crate) fn layout(&self) -> Layout {
        Layout {
            hash_bits: self.hash_bits,
            seed: self.hash_seed,
        }
    }
}

/// Geometry fixed at creation time: bucket count and hash seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub(crate) hash_bits: u32,
    pub(crate) seed: u64,
}

impl Layout {
    #[inline]
    pub(crate) fn buckets(&self) -> u64 {
        1u64 << self.hash_bits
    }

    #[inline]
    pub(crate) fn hash(&self, key: &[u8]) -> u64 {
        hash_key(self.seed, key)
    }

    #[inline]
    pub(crate) fn bucket_of(&self, hash: u64) -> u64 {
        hash & (self.buckets() - 1)
    }

    #[inline]
    pub(crate) fn bucket_offset(&self, bucket: u64) -> u64 {
        HEADER_SIZE + bucket * 8
    }

    #[inline]
    pub(crate) fn records_start(&self) -> u64 {
        HEADER_SIZE + self.buckets() * 8
    }
}

/// Per-record header preceding the key and data bytes.
///
/// Used records are linked into their hash chain through `next`; free
/// records are linked into the free list the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub(crate) magic: u64,
    pub(crate) next: u64,
    pub(crate) key_len: u64,
    pub(crate) data_len: u64,
    /// Body bytes available after the header
    pub(crate) capacity: u64,
    pub(crate) hash: u64,
}

impl RecordHeader {
    pub(crate) fn used(key_len: u64, data_len: u64, capacity: u64, hash: u64, next: u64) -> Self {
        RecordHeader {
            magic: USED_MAGIC,
            next,
            key_len,
            data_len,
            capacity,
            hash,
        }
    }

    pub(crate) fn free(capacity: u64, next: u64) -> Self {
        RecordHeader {
            magic: FREE_MAGIC,
            next,
            key_len: 0,
            data_len: 0,
            capacity,
            hash: 0,
        }
    }

    pub(crate) fn is_used(&self) -> bool {
        self.magic == USED_MAGIC
    }

    pub(crate) fn is_free(&self) -> bool {
        self.magic == FREE_MAGIC
    }

    /// Header plus body
    pub(crate) fn total_len(&self) -> u64 {
        RECORD_HEADER_SIZE + self.capacity
    }

    pub(crate) fn key_offset(off: u64) -> u64 {
        off + RECORD_HEADER_SIZE
    }

    pub(crate) fn data_offset(&self, off: u64) -> u64 {
        off + RECORD_HEADER_SIZE + self.key_len
    }

    pub(crate) fn encode(&self) -> [u8; RECORD_HEADER_SIZE as usize] {
        let mut buf = [0u8; RECORD_HEADER_SIZE as usize];
        for (off, v) in [
            (REC_MAGIC, self.magic),
            (REC_NEXT, self.next),
            (REC_KEY_LEN, self.key_len),
            (REC_DATA_LEN, self.data_len),
            (REC_CAPACITY, self.capacity),
            (REC_HASH, self.hash),
        ] {
            buf[off as usize..off as usize + 8].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    pub(crate) fn decode(buf: &[u8; RECORD_HEADER_SIZE as usize]) -> Self {
        let get = |off: u64| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&buf[off as usize..off as usize + 8]);
            u64::from_le_bytes(word)
        };
        RecordHeader {
            magic: get(REC_MAGIC),
            next: get(REC_NEXT),
            key_len: get(REC_KEY_LEN),
            data_len: get(REC_DATA_LEN),
            capacity: get(REC_CAPACITY),
            hash: get(REC_HASH),
        }
    }

    /// Read and sanity-check the record at `off`.
    pub(crate) fn read<A: Access + ?Sized>(io: &A, off: u64, data_end: u64) -> Result<Self> {
        if off % RECORD_ALIGN != 0 || off.saturating_add(RECORD_HEADER_SIZE) > data_end {
            return Err(Error::corrupt(format!("record offset {} out of bounds", off)));
        }
        let mut buf = [0u8; RECORD_HEADER_SIZE as usize];
        io.read_at(off, &mut buf)?;
        let rec = RecordHeader::decode(&buf);

        if !rec.is_used() && !rec.is_free() {
            return Err(Error::corrupt(format!(
                "bad record magic {:#x} at {}",
                rec.magic, off
            )));
        }
        let body = rec.key_len.checked_add(rec.data_len);
        if body.map_or(true, |b| b > rec.capacity)
            || off.saturating_add(rec.total_len()) > data_end
        {
            return Err(Error::corrupt(format!("record at {} overruns its space", off)));
        }
        Ok(rec)
    }

    pub(crate) fn write<A: Access + ?Sized>(&self, io: &mut A, off: u64) -> Result<()> {
        io.write_at(off, &self.encode())
    }
}

/// Round up to the record alignment.
#[inline]
pub(crate) fn align_up(n: u64) -> u64 {
    (n + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_rejects_foreign_files() {
        let mut raw = Header::new(6, 42).encode();
        assert!(Header::decode(&raw).is_ok());

        raw[0] = b'X';
        assert!(matches!(Header::decode(&raw), Err(Error::Corrupt(_))));
    }

    #[test]
    fn header_rejects_out_of_range_hash_bits() {
        let mut header = Header::new(6, 0);
        header.hash_bits = MAX_HASH_BITS + 1;
        assert!(Header::decode(&header.encode()).is_err());
    }

    #[test]
    fn new_header_starts_data_after_buckets() {
        let header = Header::new(4, 0);
        assert_eq!(header.data_end, HEADER_SIZE + 16 * 8);
        assert_eq!(header.layout().records_start(), header.data_end);
    }

    #[test]
    fn layout_masks_hash_into_bucket_range() {
        let layout = Layout { hash_bits: 4, seed: 1 };
        assert_eq!(layout.buckets(), 16);
        assert_eq!(layout.bucket_of(0xffff_fff3), 3);
        assert_eq!(layout.bucket_offset(2), HEADER_SIZE + 16);
    }

    #[test]
    fn record_header_encoding_is_stable() {
        let rec = RecordHeader::used(3, 5, 8, 0xdead, 512);
        assert_eq!(RecordHeader::decode(&rec.encode()), rec);
        assert_eq!(rec.total_len(), RECORD_HEADER_SIZE + 8);
        assert_eq!(rec.data_offset(1000), 1000 + RECORD_HEADER_SIZE + 3);
    }

    #[test]
    fn align_up_rounds_to_eight() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(16), 16);
    }
}
