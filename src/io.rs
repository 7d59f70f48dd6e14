use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use log::{debug, warn};
use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{Error, Result};

/// Backing store for a database: a file or a private memory arena.
///
/// Offsets are absolute byte positions. Implementations never interpret the
/// bytes; layout is the record store's business.
pub(crate) trait Storage: Send {
    /// Physical length in bytes
    fn len(&self) -> u64;
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, off: u64, data: &[u8]) -> Result<()>;
    fn set_len(&mut self, len: u64) -> Result<()>;
    /// Flush written data to stable storage
    fn sync(&mut self) -> Result<()>;
    /// Pick up size changes made by other attachments. Called whenever a
    /// whole-database lock is freshly acquired.
    fn refresh(&mut self) -> Result<()>;
    /// Switch between mapped and pread/pwrite access
    fn set_mmap(&mut self, enabled: bool) -> Result<()>;
    /// Whether a crash can tear writes (and so transactions need a journal)
    fn is_durable(&self) -> bool;
}

/// Byte-level view used by the record store.
pub(crate) trait Access {
    /// Logical size of the addressable area
    fn size(&self) -> u64;
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, off: u64, data: &[u8]) -> Result<()>;

    /// Journal written by the transaction this view belongs to, if prepared
    fn own_journal(&self) -> Option<u64> {
        None
    }

    fn read_u64(&self, off: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_at(off, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&mut self, off: u64, value: u64) -> Result<()> {
        self.write_at(off, &value.to_le_bytes())
    }

    fn read_vec(&self, off: u64, len: u64) -> Result<Vec<u8>> {
        let end = off
            .checked_add(len)
            .ok_or_else(|| Error::corrupt("length overflows offset"))?;
        if end > self.size() {
            return Err(Error::corrupt(format!(
                "read of {} bytes at {} runs past end ({})",
                len,
                off,
                self.size()
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.read_at(off, &mut buf)?;
        Ok(buf)
    }
}

/// Read-only access straight to the backing store.
pub(crate) struct BaseView<'a> {
    storage: &'a dyn Storage,
}

impl<'a> BaseView<'a> {
    pub(crate) fn new(storage: &'a dyn Storage) -> Self {
        BaseView { storage }
    }
}

impl Access for BaseView<'_> {
    fn size(&self) -> u64 {
        self.storage.len()
    }

    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.storage.read_at(off, buf)
    }

    fn write_at(&mut self, _off: u64, _data: &[u8]) -> Result<()> {
        Err(Error::InvalidState("write outside of a transaction"))
    }
}

enum Map {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Map {
    fn bytes(&self) -> &[u8] {
        match self {
            Map::ReadOnly(m) => m,
            Map::ReadWrite(m) => m,
        }
    }
}

/// File-backed storage. Reads and writes go through the memory map when one
/// covers the range, otherwise through positional I/O.
pub(crate) struct FileStorage {
    file: File,
    map: Option<Map>,
    use_mmap: bool,
    writable: bool,
    len: u64,
}

impl FileStorage {
    pub(crate) fn new(file: File, writable: bool, use_mmap: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        let mut storage = FileStorage {
            file,
            map: None,
            use_mmap,
            writable,
            len,
        };
        storage.remap();
        Ok(storage)
    }

    fn remap(&mut self) {
        self.map = None;
        if !self.use_mmap || self.len == 0 {
            return;
        }

        let options = {
            let mut o = MmapOptions::new();
            o.len(self.len as usize);
            o
        };
        // SAFETY: the map is dropped before any truncation we perform, and
        // other attachments only shrink the file under the exclusive lock,
        // after which refresh() remaps before the next access.
        let mapped = unsafe {
            if self.writable {
                options.map_mut(&self.file).map(Map::ReadWrite)
            } else {
                options.map(&self.file).map(Map::ReadOnly)
            }
        };

        match mapped {
            Ok(map) => self.map = Some(map),
            Err(e) => {
                // mmap can fail on odd filesystems; positional I/O still works
                warn!("mmap of {} bytes failed, falling back to pread: {}", self.len, e);
            }
        }
    }

    fn mapped_range(&self, off: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let map = self.map.as_ref()?;
        let start = usize::try_from(off).ok()?;
        let end = start.checked_add(len)?;
        if end <= map.bytes().len() {
            Some(start..end)
        } else {
            None
        }
    }
}

impl Storage for FileStorage {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        if let Some(range) = self.mapped_range(off, buf.len()) {
            if let Some(map) = &self.map {
                buf.copy_from_slice(&map.bytes()[range]);
                return Ok(());
            }
        }

        let want = buf.len();
        self.file.read_exact_at(buf, off).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::corrupt(format!("short read of {} bytes at {}", want, off))
            } else {
                Error::Io(e)
            }
        })
    }

    fn write_at(&mut self, off: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }

        if let Some(range) = self.mapped_range(off, data.len()) {
            if let Some(Map::ReadWrite(map)) = &mut self.map {
                map[range].copy_from_slice(data);
                return Ok(());
            }
        }

        self.file.write_all_at(data, off)?;
        self.len = self.len.max(off + data.len() as u64);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        if len == self.len {
            return Ok(());
        }

        debug!("resizing file from {} to {} bytes", self.len, len);
        self.map = None;
        self.file.set_len(len)?;
        self.len = len;
        self.remap();
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(Map::ReadWrite(map)) = &self.map {
            map.flush()?;
        }
        self.file.sync_data()?;
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len();
        let mapped = self.map.as_ref().map(|m| m.bytes().len() as u64);
        if len != self.len || (self.use_mmap && mapped != Some(len)) {
            self.len = len;
            self.remap();
        }
        Ok(())
    }

    fn set_mmap(&mut self, enabled: bool) -> Result<()> {
        if enabled != self.use_mmap {
            self.use_mmap = enabled;
            self.remap();
        }
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

/// Private in-memory arena backing an internal database.
#[derive(Default)]
pub(crate) struct MemStorage {
    buf: Vec<u8>,
}

impl MemStorage {
    pub(crate) fn new() -> Self {
        MemStorage::default()
    }
}

impl Storage for MemStorage {
    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let start = off as usize;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| self.buf.get(start..end))
            .ok_or_else(|| {
                Error::corrupt(format!("read of {} bytes at {} past end", buf.len(), off))
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&mut self, off: u64, data: &[u8]) -> Result<()> {
        let start = off as usize;
        let end = start + data.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.buf.resize(len as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_mmap(&mut self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
