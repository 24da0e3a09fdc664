use std::{collections::BTreeMap, sync::RwLock};

use crate::common::error::Result;

use super::KvStore;

/// 内存版 [KvStore]，测试和临时运行用
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map
            .write()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.write().unwrap().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.read().unwrap();
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_prefix() {
        let store = MemoryStore::new();
        store.put(b"ns-a", b"1").unwrap();
        store.put(b"ns-b", b"2").unwrap();
        store.put(b"other", b"3").unwrap();

        let got = store.scan_prefix(b"ns-").unwrap();
        assert_eq!(
            got,
            vec![
                (b"ns-a".to_vec(), b"1".to_vec()),
                (b"ns-b".to_vec(), b"2".to_vec()),
            ]
        );

        store.delete(b"ns-a").unwrap();
        assert_eq!(store.scan_prefix(b"ns-").unwrap().len(), 1);
        assert_eq!(store.get(b"ns-a").unwrap(), None);
    }
}
