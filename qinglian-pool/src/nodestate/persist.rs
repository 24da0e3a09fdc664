use bytes::BytesMut;
use qinglian_core::{
    common::error::{Error, Result},
    data::codec::{get_len_bytes, get_uvarint, put_len_bytes, put_uvarint},
};

const RECORD_VERSION: u8 = 1;

/// 单个节点的持久化记录。标志和字段都按名字存储，
/// 重启后注册顺序变化不影响恢复；未知名字原样保留。
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct NodeRecord {
    /// 节点地址的文本形式
    pub address: String,
    /// 已置的持久化标志名
    pub flags: Vec<String>,
    /// (字段名, 编码后的值)
    pub fields: Vec<(String, Vec<u8>)>,
}

impl NodeRecord {
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.fields.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[RECORD_VERSION]);
        put_len_bytes(&mut buf, self.address.as_bytes());

        put_uvarint(&mut buf, self.flags.len() as u64);
        for name in &self.flags {
            put_len_bytes(&mut buf, name.as_bytes());
        }

        put_uvarint(&mut buf, self.fields.len() as u64);
        for (name, value) in &self.fields {
            put_len_bytes(&mut buf, name.as_bytes());
            put_len_bytes(&mut buf, value);
        }

        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<NodeRecord> {
        let (&version, rest) = data
            .split_first()
            .ok_or_else(|| Error::new_decode("Empty node record"))?;
        if version != RECORD_VERSION {
            Err(Error::new_decode(&format!(
                "Unknown node record version {}",
                version
            )))?;
        }
        data = rest;

        let address = String::from_utf8(get_len_bytes(&mut data)?.to_vec())
            .map_err(|e| Error::new_decode(&format!("Node record address not utf8: {}", e)))?;

        let flag_count = get_uvarint(&mut data)?;
        let mut flags = Vec::with_capacity(flag_count as usize);
        for _ in 0..flag_count {
            let name = String::from_utf8(get_len_bytes(&mut data)?.to_vec())
                .map_err(|e| Error::new_decode(&format!("Flag name not utf8: {}", e)))?;
            flags.push(name);
        }

        let field_count = get_uvarint(&mut data)?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let name = String::from_utf8(get_len_bytes(&mut data)?.to_vec())
                .map_err(|e| Error::new_decode(&format!("Field name not utf8: {}", e)))?;
            let value = get_len_bytes(&mut data)?.to_vec();
            fields.push((name, value));
        }

        Ok(NodeRecord {
            address,
            flags,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let record = NodeRecord {
            address: "127.0.0.1:30303".to_owned(),
            flags: vec!["hasValue".to_owned(), "trusted".to_owned()],
            fields: vec![
                ("nodeHistory".to_owned(), vec![1, 2, 3]),
                ("legacy".to_owned(), vec![]),
            ],
        };

        let enc = record.encode();
        let got = NodeRecord::decode(&enc).unwrap();
        assert_eq!(got, record);
    }

    #[test]
    fn test_record_rejects_garbage() {
        assert!(NodeRecord::decode(&[]).is_err());
        assert!(NodeRecord::decode(&[99, 0, 0]).is_err());

        let record = NodeRecord {
            address: "1.2.3.4:5".to_owned(),
            flags: vec!["a".to_owned()],
            fields: vec![],
        };
        let enc = record.encode();
        // 截断的记录必须报错而不是 panic
        assert!(NodeRecord::decode(&enc[..enc.len() - 1]).is_err());
    }
}
