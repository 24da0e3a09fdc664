use std::path::Path;

use crate::common::error::{Error, Result};

use super::KvStore;

/// sled 持久化后端适配
#[derive(Clone, Debug)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<SledStore> {
        let db = sled::open(path)
            .map_err(|e| Error::new_kv(Some(e.into()), Some("Open sled db failed".to_owned())))?;

        Ok(SledStore { db })
    }

    pub fn new(db: sled::Db) -> SledStore {
        SledStore { db }
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let val = self
            .db
            .get(key)
            .map_err(|e| Error::new_kv(Some(e.into()), None))?;

        Ok(val.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .insert(key, value)
            .map_err(|e| Error::new_kv(Some(e.into()), None))?;

        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db
            .remove(key)
            .map_err(|e| Error::new_kv(Some(e.into()), None))?;

        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| Error::new_kv(Some(e.into()), None))?;
            out.push((k.to_vec(), v.to_vec()));
        }

        Ok(out)
    }
}
