use std::fmt;

/// How `store_with` treats an existing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// Insert or overwrite
    #[default]
    Replace,
    /// Fail with `Exists` if the key is present
    Insert,
    /// Fail with `NotFound` if the key is absent
    Modify,
}

/// Whole-database lock granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Database statistics, as gathered by `Tdb::summary`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    /// Size of the file (or arena) in bytes
    pub size: u64,
    /// Number of hash buckets
    pub buckets: u64,
    /// Buckets with at least one record
    pub buckets_used: u64,
    /// Longest hash chain
    pub max_chain: u64,
    /// Number of live records
    pub records: u64,
    pub key_bytes: u64,
    pub data_bytes: u64,
    /// Allocated but unused bytes inside live records
    pub slack_bytes: u64,
    pub free_records: u64,
    pub free_bytes: u64,
    /// Per-record header bytes
    pub overhead_bytes: u64,
}

impl Summary {
    pub fn average_chain(&self) -> f64 {
        if self.buckets_used == 0 {
            0.0
        } else {
            self.records as f64 / self.buckets_used as f64
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Size of file/data: {}", self.size)?;
        writeln!(f, "Number of records: {}", self.records)?;
        writeln!(f, "Key bytes: {}", self.key_bytes)?;
        writeln!(f, "Data bytes: {}", self.data_bytes)?;
        writeln!(f, "Slack bytes: {}", self.slack_bytes)?;
        writeln!(
            f,
            "Free records: {} ({} bytes)",
            self.free_records, self.free_bytes
        )?;
        writeln!(f, "Header overhead: {}", self.overhead_bytes)?;
        writeln!(
            f,
            "Hash buckets: {} ({} used, longest chain {}, average {:.2})",
            self.buckets,
            self.buckets_used,
            self.max_chain,
            self.average_chain()
        )
    }
}
