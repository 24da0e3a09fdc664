mod id;

pub use id::{parse_node_url, Id, Node, ID_SIZE};
