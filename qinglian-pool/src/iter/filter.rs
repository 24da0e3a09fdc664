use futures::future::BoxFuture;

use crate::common::Node;

use super::NodeSource;

/// 包一层过滤：check 返回 false 的节点被吞掉。check 同时承担
/// "节点流出迭代器前做标记"的副作用（服务池用它原子地置 dialed）。
pub struct FilterIter {
    source: Box<dyn NodeSource>,
    check: Box<dyn Fn(&Node) -> bool + Send + Sync>,
}

impl FilterIter {
    pub fn new<F>(source: Box<dyn NodeSource>, check: F) -> FilterIter
    where
        F: Fn(&Node) -> bool + Send + Sync + 'static,
    {
        FilterIter {
            source,
            check: Box::new(check),
        }
    }
}

impl NodeSource for FilterIter {
    fn next(&mut self) -> BoxFuture<'_, Option<Node>> {
        Box::pin(async move {
            loop {
                match self.source.next().await {
                    Some(node) => {
                        if (self.check)(&node) {
                            return Some(node);
                        }
                    }
                    None => return None,
                }
            }
        })
    }

    fn close(&mut self) {
        self.source.close();
    }
}
