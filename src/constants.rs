use bitflags::bitflags;

// Handle flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TdbFlags: u32 {
        /// Memory-only database, never touches the filesystem
        const INTERNAL = 0x02;
        /// Skip all OS-level locking
        const NOLOCK = 0x04;
        /// Use pread/pwrite instead of a memory map
        const NOMMAP = 0x08;
        /// Don't fsync/msync during transaction commit
        const NOSYNC = 0x40;
        /// Maintain a sequence number bumped by every mutation
        const SEQNUM = 0x80;
        /// Turn nested transaction_start() calls into a depth counter
        const ALLOW_NESTING = 0x100;
        /// Reject every mutation
        const RDONLY = 0x200;
    }
}

impl TdbFlags {
    /// Readability placeholder for "no flags"
    pub const DEFAULT: TdbFlags = TdbFlags::empty();
}

// Open mode flags, modelled on the O_* family
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenMode: u32 {
        const READ_ONLY = 0x00;
        const READ_WRITE = 0x02;
        const CREATE = 0x40;
        const EXCLUSIVE = 0x80;
        const TRUNCATE = 0x200;
    }
}

impl Default for OpenMode {
    fn default() -> Self {
        OpenMode::READ_WRITE | OpenMode::CREATE
    }
}

/// Library version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Magic string at the start of every database file
pub const FILE_MAGIC: &[u8; 16] = b"TrivDB file\n\0\0\0\0";
/// On-disk format version
pub const FORMAT_VERSION: u64 = 1;

// Header layout
pub const HEADER_SIZE: u64 = 128;
pub const HDR_MAGIC: u64 = 0;
pub const HDR_VERSION: u64 = 16;
pub const HDR_HASH_SEED: u64 = 24;
pub const HDR_HASH_BITS: u64 = 32;
pub const HDR_DATA_END: u64 = 40;
pub const HDR_FREE_HEAD: u64 = 48;
pub const HDR_RECOVERY: u64 = 56;
pub const HDR_SEQNUM: u64 = 64;

// Record header layout
pub const RECORD_HEADER_SIZE: u64 = 48;
pub const REC_MAGIC: u64 = 0;
pub const REC_NEXT: u64 = 8;
pub const REC_KEY_LEN: u64 = 16;
pub const REC_DATA_LEN: u64 = 24;
pub const REC_CAPACITY: u64 = 32;
pub const REC_HASH: u64 = 40;

pub const USED_MAGIC: u64 = 0x5553_4544_5245_4331; // "USEDREC1"
pub const FREE_MAGIC: u64 = 0x4652_4545_5245_4331; // "FREEREC1"

// Recovery journal
pub const RECOVERY_MAGIC: u64 = 0x5245_434F_5645_5259; // "RECOVERY"
pub const RECOVERY_INVALID_MAGIC: u64 = 0;
pub const RECOVERY_HEADER_SIZE: u64 = 32;

/// Granularity of transaction copy-on-write blocks
pub const TRANSACTION_BLOCK_SIZE: u64 = 4096;

/// Smallest body worth splitting off into its own free record
pub const MIN_FREE_BODY: u64 = 16;
/// Upper bound on speculative growth when the file is expanded
pub const MAX_EXPANSION: u64 = 1 << 20;

pub const DEFAULT_HASH_BITS: u32 = 10;
pub const MIN_HASH_BITS: u32 = 4;
pub const MAX_HASH_BITS: u32 = 24;

/// Record bodies are padded to this alignment
pub const RECORD_ALIGN: u64 = 8;
