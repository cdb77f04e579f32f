//! In-memory database driver, the default and the one tests use.

use std::collections::HashMap;

use super::{DbDriver, DbError, GreyData, Key};

#[derive(Debug, Default)]
pub struct MemoryDb {
    rows: HashMap<Key, GreyData>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl DbDriver for MemoryDb {
    fn get(&self, key: &Key) -> Result<Option<GreyData>, DbError> {
        Ok(self.rows.get(key).copied())
    }

    fn put(&mut self, key: Key, val: GreyData) -> Result<(), DbError> {
        self.rows.insert(key, val);
        Ok(())
    }

    fn del(&mut self, key: &Key) -> Result<(), DbError> {
        self.rows.remove(key);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(Key, GreyData)>, DbError> {
        Ok(self
            .rows
            .iter()
            .map(|(key, val)| (key.clone(), *val))
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn put_get_del() {
        let mut db = MemoryDb::new();
        let key = Key::Ip(String::from("1.2.3.4"));
        let val = GreyData {
            first: 1,
            pass: 2,
            expire: 3,
            bcount: 4,
            pcount: 5,
        };

        assert_eq!(db.get(&key).unwrap(), None);
        db.put(key.clone(), val).unwrap();
        assert_eq!(db.get(&key).unwrap(), Some(val));
        assert_eq!(db.entries().unwrap().len(), 1);

        db.del(&key).unwrap();
        assert_eq!(db.get(&key).unwrap(), None);
        assert!(db.is_empty());
    }
}
