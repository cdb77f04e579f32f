//! File-backed database driver.
//!
//! Rows live in memory and are flushed as one bincode snapshot; the
//! flush writes a sibling temp file and renames it over the old
//! snapshot, so a crash mid-sync leaves the previous generation intact.

use std::{collections::HashMap, fs, path::PathBuf};

use super::{DbDriver, DbError, GreyData, Key};

pub struct FileDb {
    path: PathBuf,
    rows: HashMap<Key, GreyData>,
    dirty: bool,
}

impl FileDb {
    pub fn open(path: PathBuf) -> Result<Self, DbError> {
        let rows = match fs::read(&path) {
            Ok(bytes) => {
                let (rows, _): (Vec<(Key, GreyData)>, usize) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|err| DbError::Corrupt(err.to_string()))?;
                rows.into_iter().collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            rows,
            dirty: false,
        })
    }
}

impl DbDriver for FileDb {
    fn get(&self, key: &Key) -> Result<Option<GreyData>, DbError> {
        Ok(self.rows.get(key).copied())
    }

    fn put(&mut self, key: Key, val: GreyData) -> Result<(), DbError> {
        self.rows.insert(key, val);
        self.dirty = true;
        Ok(())
    }

    fn del(&mut self, key: &Key) -> Result<(), DbError> {
        if self.rows.remove(key).is_some() {
            self.dirty = true;
        }
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(Key, GreyData)>, DbError> {
        Ok(self
            .rows
            .iter()
            .map(|(key, val)| (key.clone(), *val))
            .collect())
    }

    fn sync(&mut self) -> Result<(), DbError> {
        if !self.dirty {
            return Ok(());
        }

        let rows: Vec<(&Key, &GreyData)> = self.rows.iter().collect();
        let bytes = bincode::serde::encode_to_vec(&rows, bincode::config::standard())
            .map_err(|err| DbError::Corrupt(err.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grey.db");

        let key = Key::Ip(String::from("4.3.2.1"));
        let val = GreyData {
            first: 10,
            pass: 20,
            expire: 30,
            bcount: 2,
            pcount: 1,
        };

        let mut db = FileDb::open(path.clone()).unwrap();
        db.put(key.clone(), val).unwrap();
        db.sync().unwrap();

        let reopened = FileDb::open(path).unwrap();
        assert_eq!(reopened.get(&key).unwrap(), Some(val));
    }

    #[test]
    fn missing_snapshot_is_an_empty_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = FileDb::open(dir.path().join("absent.db")).unwrap();
        assert!(db.entries().unwrap().is_empty());
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grey.db");
        fs::write(&path, b"\xff\xff not a snapshot").unwrap();

        assert!(matches!(FileDb::open(path), Err(DbError::Corrupt(_))));
    }

    #[test]
    fn deleting_all_rows_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grey.db");

        let key = Key::Mail(String::from("trap@example.org"));
        let mut db = FileDb::open(path.clone()).unwrap();
        db.put(key.clone(), GreyData::default()).unwrap();
        db.sync().unwrap();

        let mut db = FileDb::open(path.clone()).unwrap();
        db.del(&key).unwrap();
        db.sync().unwrap();

        let reopened = FileDb::open(path).unwrap();
        assert!(reopened.entries().unwrap().is_empty());
    }
}
