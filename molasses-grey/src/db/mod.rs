//! The greylist database abstraction.
//!
//! Three kinds of row share one value shape: IP rows (whitelisted or
//! trapped sources), MAIL rows (spamtrap addresses), and TUPLE rows (the
//! greylisting memory proper). Drivers are selected by name from the
//! `[database]` config section; the updater is the only writer during
//! normal operation, the scanner expires and promotes during its pass.

pub mod file;
pub mod memory;

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use molasses_common::config::DatabaseConfig;

/// `pcount` sentinel for a trapped source IP.
pub const PCOUNT_TRAPPED: i32 = -1;
/// `pcount` sentinel for a spamtrap MAIL address.
pub const PCOUNT_SPAMTRAP: i32 = -2;

/// The unit of greylisting memory: who spoke to whom, from where.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GreyTuple {
    pub ip: String,
    pub helo: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Ip(String),
    Mail(String),
    Tuple(GreyTuple),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreyData {
    /// When we first saw this entry.
    pub first: i64,
    /// When it was (or will be) whitelisted.
    pub pass: i64,
    /// When to get rid of it; 0 means never.
    pub expire: i64,
    /// Times blocked.
    pub bcount: i32,
    /// Times passed, or a `PCOUNT_*` sentinel.
    pub pcount: i32,
}

impl GreyData {
    pub fn is_trapped(&self) -> bool {
        self.pcount == PCOUNT_TRAPPED
    }

    pub fn is_spamtrap(&self) -> bool {
        self.pcount == PCOUNT_SPAMTRAP
    }

    pub fn expired(&self, now: i64) -> bool {
        self.expire != 0 && self.expire < now
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("database is corrupt: {0}")]
    Corrupt(String),

    #[error("unknown database driver {0:?}")]
    UnknownDriver(String),

    #[error("database driver {0:?} requires a path")]
    MissingPath(&'static str),
}

/// What every database driver must satisfy. Iteration is a snapshot so a
/// caller may mutate while walking the rows it took.
pub trait DbDriver: Send {
    fn get(&self, key: &Key) -> Result<Option<GreyData>, DbError>;
    fn put(&mut self, key: Key, val: GreyData) -> Result<(), DbError>;
    fn del(&mut self, key: &Key) -> Result<(), DbError>;
    fn entries(&self) -> Result<Vec<(Key, GreyData)>, DbError>;

    /// Flush to stable storage, where the driver has any.
    fn sync(&mut self) -> Result<(), DbError> {
        Ok(())
    }
}

/// One database handle shared by the updater and the scanner. The lock
/// stands in for the storage engine's own concurrency contract; critical
/// sections are one record application or one scan pass.
pub type SharedDb = Arc<Mutex<Box<dyn DbDriver>>>;

/// A fresh in-memory handle; what the default configuration and most
/// tests run on.
pub fn memory() -> SharedDb {
    Arc::new(Mutex::new(Box::new(memory::MemoryDb::new()) as Box<dyn DbDriver>))
}

pub fn open(config: &DatabaseConfig) -> Result<SharedDb, DbError> {
    let driver: Box<dyn DbDriver> = match config.driver.as_str() {
        "memory" => Box::new(memory::MemoryDb::new()),
        "file" => {
            let path = config.path.clone().ok_or(DbError::MissingPath("file"))?;
            Box::new(file::FileDb::open(path)?)
        }
        other => return Err(DbError::UnknownDriver(other.to_owned())),
    };

    Ok(Arc::new(Mutex::new(driver)))
}
