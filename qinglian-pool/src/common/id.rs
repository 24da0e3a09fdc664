use std::{fmt, net::SocketAddr, str::FromStr};

use derivative::Derivative;
use qinglian_core::common::error::{Error, Result};

pub const ID_SIZE: usize = 32;

/// 远程节点的不透明标识，除相等性和哈希外不做任何解释
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn from_bytes(bytes: &[u8]) -> Result<Id> {
        if bytes.len() != ID_SIZE {
            Err(Error::new_general(&format!(
                "Id requires {} bytes, got {}",
                ID_SIZE,
                bytes.len()
            )))?;
        }
        let mut inner = [0u8; ID_SIZE];
        inner.copy_from_slice(bytes);

        Ok(Id(inner))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// 随机 Id，测试和演示用
    pub fn random() -> Id {
        let mut inner = [0u8; ID_SIZE];
        rand::Rng::fill(&mut rand::thread_rng(), &mut inner[..]);

        Id(inner)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 日志里只打印前 4 字节
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", hex::encode(self.0))
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::new_general(&format!("Invalid hex id: {}", e)))?;

        Id::from_bytes(&bytes)
    }
}

/// Represents a dialable remote server. Equality and hash are by identity
/// only: the same node reappearing under a new address is still the same
/// node.
#[derive(Derivative)]
#[derivative(Debug, PartialEq, Eq, Clone, Hash)]
pub struct Node {
    pub id: Id,

    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    pub address: SocketAddr,
}

impl Node {
    pub fn new(id: Id, address: SocketAddr) -> Node {
        Node { id, address }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// 解析 "qln://<hex id>@<ip>:<port>" 形式的节点 URL，scheme 前缀可省略
pub fn parse_node_url(url: &str) -> Result<Node> {
    let rest = url.strip_prefix("qln://").unwrap_or(url);

    let (id_part, addr_part) = rest
        .split_once('@')
        .ok_or_else(|| Error::new_general(&format!("Node url missing '@': {}", url)))?;

    let id: Id = id_part.parse()?;
    let address: SocketAddr = addr_part
        .parse()
        .map_err(|e| Error::new_general(&format!("Invalid node address {}: {}", addr_part, e)))?;

    Ok(Node::new(id, address))
}
