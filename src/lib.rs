//! A trivial database: an embedded, single-file key/value store with
//! transactions, whole-database locking and crash recovery.
//!
//! Keys and values are arbitrary byte strings. Several handles, in one
//! process or many, may attach the same file; every mutation made outside an
//! explicit transaction is committed atomically on its own.
//!
//! ```
//! use trivdb::Tdb;
//!
//! let db = Tdb::open_internal()?;
//! db.store(b"bar", b"bla")?;
//! assert_eq!(db.get(b"bar")?, b"bla");
//!
//! db.transaction_start()?;
//! db.store(b"bar", b"changed")?;
//! db.transaction_cancel()?;
//! assert_eq!(db.get(b"bar")?, b"bla");
//! # Ok::<(), trivdb::Error>(())
//! ```
mod check;
mod constants;
mod cursor;
mod database;
mod error;
mod free;
mod handle;
mod hash;
mod io;
mod lock;
mod meta;
mod transaction;
mod types;

pub use constants::{OpenMode, TdbFlags, VERSION};
pub use cursor::Keys;
pub use error::{Error, Result};
pub use handle::{Tdb, TdbOptions};
pub use lock::{FlockBackend, LockBackend, NoLock};
pub use types::{LockMode, StoreMode, Summary};
